//! The semantic review capability

use async_trait::async_trait;
use std::path::PathBuf;
use swarm_core::{Plan, Result, ReviewFinding, RunId, WorkerId};
use tokio_util::sync::CancellationToken;

/// Input to a review or fix pass over the integrated change set
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub run_id: RunId,
    pub plan: Plan,
    /// Aggregate diff of the integration branch against the base ref
    pub diff: String,
    /// Summary reported by each merged worker, in merge order
    pub worker_summaries: Vec<(WorkerId, String)>,
    /// Coordination summary of the run
    pub coordination: String,
    /// Integration worktree
    pub workspace: PathBuf,
}

/// Looks for interface mismatches, incompatible assumptions and missing
/// wiring between workers, and optionally fixes them in the workspace
#[async_trait]
pub trait ReviewCapability: Send + Sync {
    async fn review(
        &self,
        context: &ReviewContext,
        cancel: CancellationToken,
    ) -> Result<Vec<ReviewFinding>>;

    /// Apply fixes for `findings` directly in the integration worktree
    async fn fix(
        &self,
        context: &ReviewContext,
        findings: &[ReviewFinding],
        cancel: CancellationToken,
    ) -> Result<()>;
}
