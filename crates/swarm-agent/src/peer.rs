//! A worker's view of the coordination bus

use async_trait::async_trait;
use std::collections::BTreeMap;
use swarm_core::{Message, MessageKind, Note, PeerState, PeerStatus, Result, WorkerId};

/// Coordination operations available to one worker during an attempt
///
/// Bound to a run and a sender, so agents can only publish as themselves and
/// only see their own run's artifacts.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Id of the worker this channel publishes as
    fn worker_id(&self) -> &str;

    /// Overwrite this worker's broadcast note
    async fn publish_note(&self, topic: Option<&str>, content: &str, tags: &[String]) -> Result<()>;

    /// Latest note of every worker
    async fn notes(&self) -> Result<BTreeMap<WorkerId, Note>>;

    /// Send a directed message; returns its sequence number
    async fn send_message(
        &self,
        to: &str,
        kind: MessageKind,
        topic: &str,
        content: &str,
    ) -> Result<u64>;

    /// Messages addressed to this worker
    async fn inbox(&self) -> Result<Vec<Message>>;

    /// Overwrite this worker's milestone
    async fn publish_status(&self, state: PeerState, milestone: &str, details: &str) -> Result<()>;

    /// Latest milestone of every worker
    async fn statuses(&self) -> Result<BTreeMap<WorkerId, PeerStatus>>;
}
