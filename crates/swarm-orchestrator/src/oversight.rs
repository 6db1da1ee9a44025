//! Oversight gate
//!
//! Decides at each checkpoint whether the orchestrator may proceed. The gate
//! never blocks indefinitely: an approver that does not answer in time turns
//! into a pause, leaving the run awaiting external action.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::{Checkpoint, OversightPolicy, Result, Run};
use tracing::{debug, info, warn};

/// Outcome of consulting the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Stop and wait for an external approve/abort
    Pause,
    Abort,
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::Pause => write!(f, "pause"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Source of human confirmation
///
/// `Ok(None)` means nobody is available to answer right now.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn confirm(&self, run: &Run, checkpoint: Checkpoint, summary: &str) -> Result<Option<bool>>;
}

/// Approver for non-interactive use; every confirmation becomes a pause
pub struct NoApprover;

#[async_trait]
impl Approver for NoApprover {
    async fn confirm(&self, _run: &Run, _checkpoint: Checkpoint, _summary: &str) -> Result<Option<bool>> {
        Ok(None)
    }
}

pub struct OversightGate {
    approver: Arc<dyn Approver>,
    timeout: Duration,
}

impl OversightGate {
    pub fn new(approver: Arc<dyn Approver>, timeout: Duration) -> Self {
        Self { approver, timeout }
    }

    /// Apply the run's policy at `checkpoint`
    pub async fn decide(&self, run: &Run, checkpoint: Checkpoint) -> GateDecision {
        if run.is_checkpoint_approved(checkpoint) {
            debug!("Checkpoint {} already approved", checkpoint);
            return GateDecision::Proceed;
        }

        let needs_confirmation = match (run.oversight, checkpoint) {
            (OversightPolicy::Checkpoint, _) => true,
            (OversightPolicy::Gated, Checkpoint::BeforeDelivery) => true,
            (OversightPolicy::Autonomous, Checkpoint::BeforeDelivery) => {
                let checks_passed = run
                    .integration
                    .as_ref()
                    .map_or(false, |record| record.checks_passed());
                if !checks_passed {
                    info!("Verification did not pass; withholding autonomous delivery");
                    return GateDecision::Pause;
                }
                false
            }
            _ => false,
        };

        if !needs_confirmation {
            return GateDecision::Proceed;
        }

        let summary = checkpoint_summary(run, checkpoint);
        match tokio::time::timeout(
            self.timeout,
            self.approver.confirm(run, checkpoint, &summary),
        )
        .await
        {
            Ok(Ok(Some(true))) => GateDecision::Proceed,
            Ok(Ok(Some(false))) => GateDecision::Abort,
            Ok(Ok(None)) => GateDecision::Pause,
            Ok(Err(e)) => {
                warn!("Approver failed at {}: {}", checkpoint, e);
                GateDecision::Pause
            }
            Err(_) => {
                info!(
                    "No answer at {} within {}s; pausing",
                    checkpoint,
                    self.timeout.as_secs()
                );
                GateDecision::Pause
            }
        }
    }
}

/// Short text shown to whoever approves a checkpoint
pub fn checkpoint_summary(run: &Run, checkpoint: Checkpoint) -> String {
    let mut text = format!("Run {} ({}): {}\n", run.run_id, checkpoint, run.objective);
    match checkpoint {
        Checkpoint::BeforeFanOut => {
            if let Some(plan) = &run.plan {
                for task in &plan.tasks {
                    text.push_str(&format!("  - {}: {}\n", task.id, task.display_title()));
                }
            }
        }
        Checkpoint::BeforeIntegration => {
            for worker in &run.workers {
                text.push_str(&format!(
                    "  - {}: {} (${:.2})\n",
                    worker.worker_id, worker.status, worker.cost_usd
                ));
            }
        }
        Checkpoint::BeforeDelivery => {
            if let Some(record) = &run.integration {
                text.push_str(&format!(
                    "  branch {}: {} merged, {} resolved, {} findings, checks {}\n",
                    record.branch,
                    record.merged.len(),
                    record.resolved.len(),
                    record.findings.len(),
                    if record.checks_passed() { "passed" } else { "failed" }
                ));
                if !record.unmerged.is_empty() {
                    text.push_str(&format!("  not merged: {}\n", record.unmerged.join(", ")));
                }
            }
        }
    }
    text.push_str(&format!("  total cost ${:.2}\n", run.cost.total_usd));
    text
}
