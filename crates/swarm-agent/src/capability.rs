//! The agent invocation capability

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use swarm_core::{CapabilityTier, Result, RunId, Task, WorkerId};
use tokio_util::sync::CancellationToken;

use crate::peer::PeerChannel;
use crate::progress::ProgressReporter;

/// Everything an agent needs for one attempt
#[derive(Clone)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub worker_id: WorkerId,
    /// 1-based attempt number
    pub attempt: u32,
    /// Task objective plus the failure summaries of earlier attempts
    pub objective: String,
    /// The planned task (scope, interfaces and acceptance hints)
    pub task: Task,
    pub tier: CapabilityTier,
    /// Isolated worktree the agent must work in
    pub workspace: PathBuf,
    /// Peers worth messaging (coupled or sharing an interface)
    pub peers: Vec<WorkerId>,
    pub channel: Option<Arc<dyn PeerChannel>>,
}

impl std::fmt::Debug for AgentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRequest")
            .field("run_id", &self.run_id)
            .field("worker_id", &self.worker_id)
            .field("attempt", &self.attempt)
            .field("tier", &self.tier)
            .field("workspace", &self.workspace)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

/// Structured result of one agent invocation
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Completed {
        summary: String,
        cost_usd: f64,
        touched_files: Vec<String>,
    },
    Failed {
        message: String,
        cost_usd: f64,
    },
    /// Stopped by the cancellation token
    Cancelled { cost_usd: f64 },
}

impl AgentOutcome {
    /// Cost reported for the attempt, whatever its outcome
    pub fn cost_usd(&self) -> f64 {
        match self {
            Self::Completed { cost_usd, .. }
            | Self::Failed { cost_usd, .. }
            | Self::Cancelled { cost_usd } => *cost_usd,
        }
    }
}

/// Opaque, long-running, cancellable code-generation capability
///
/// Implementations must stop promptly once `cancel` fires and report
/// [`AgentOutcome::Cancelled`] with the cost incurred so far. An `Err` means
/// the capability could not run at all; it is treated as a failed attempt
/// with no cost.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn invoke(
        &self,
        request: AgentRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome>;
}

/// Build the objective for an attempt, appending every earlier failure
pub fn objective_with_context(objective: &str, failures: &[String]) -> String {
    if failures.is_empty() {
        return objective.to_string();
    }
    let mut text = objective.to_string();
    text.push_str("\n\n## Previous attempts failed\n");
    for (i, failure) in failures.iter().enumerate() {
        text.push_str(&format!("\nAttempt {}: {}\n", i + 1, failure.trim()));
    }
    text.push_str("\nAvoid repeating these failures.\n");
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_unchanged_without_failures() {
        assert_eq!(objective_with_context("build it", &[]), "build it");
    }

    #[test]
    fn test_objective_accumulates_failures() {
        let text = objective_with_context(
            "build it",
            &["tests failed".to_string(), "stalled: no progress for 900s".to_string()],
        );
        assert!(text.starts_with("build it"));
        assert!(text.contains("Attempt 1: tests failed"));
        assert!(text.contains("Attempt 2: stalled"));
    }

    #[test]
    fn test_outcome_cost() {
        assert_eq!(AgentOutcome::Cancelled { cost_usd: 0.3 }.cost_usd(), 0.3);
        assert_eq!(
            AgentOutcome::Failed {
                message: "x".into(),
                cost_usd: 1.5
            }
            .cost_usd(),
            1.5
        );
    }
}
