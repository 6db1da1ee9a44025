//! The planning capability

use async_trait::async_trait;
use std::path::Path;
use swarm_core::Result;

/// Decomposes an objective into a plan
///
/// Returns the raw plan document; the orchestrator validates it against the
/// task schema before anything runs.
#[async_trait]
pub trait PlanningCapability: Send + Sync {
    async fn plan(
        &self,
        objective: &str,
        max_tasks: usize,
        repo_root: &Path,
    ) -> Result<serde_json::Value>;
}
