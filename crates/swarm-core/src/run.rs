//! Run and worker lifecycle records
//!
//! A [`Run`] is the durable record of one pipeline execution. Each planned
//! task gets a [`WorkerRecord`] whose status only moves along the edges
//! allowed by [`WorkerStatus::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::RunLimits;
use crate::types::{CapabilityTier, Checkpoint, OversightPolicy, Plan, RunId, WorkerId};
use crate::{Result, SwarmError};

/// Run status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Planning,
    Executing,
    Integrating,
    AwaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::Integrating => write!(f, "integrating"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Escalated,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl WorkerStatus {
    /// Allowed edges of the worker state machine
    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Succeeded | Failed) => true,
            (Failed, Retrying | Escalated) => true,
            (Retrying | Escalated, Running) => true,
            // ceiling cutoff and cancellation reach every non-terminal state
            (Pending | Running | Retrying | Escalated | Failed, Skipped | Aborted) => true,
            _ => false,
        }
    }

    /// Statuses that can never change again (Failed depends on the attempt ceiling)
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Aborted)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Escalated => write!(f, "escalated"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// What happens to a worker after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt at the same tier
    Retry,
    /// The final attempt, at the escalated tier
    Escalate,
    /// Attempt ceiling reached, Failed is terminal
    Exhausted,
}

/// Live execution state of one planned task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub title: String,
    pub status: WorkerStatus,
    /// Attempts started so far (never decreases)
    pub attempts: u32,
    /// Whether the one-shot tier upgrade has been spent
    #[serde(default)]
    pub escalation_used: bool,
    pub tier: CapabilityTier,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Failure summary of every failed attempt, oldest first
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Set by crash reconciliation; the next Running re-runs the same attempt number
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(worker_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            title: title.into(),
            status: WorkerStatus::Pending,
            attempts: 0,
            escalation_used: false,
            tier: CapabilityTier::Standard,
            worktree_path: None,
            branch: None,
            cost_usd: 0.0,
            last_error: None,
            failures: Vec::new(),
            summary: None,
            files_changed: Vec::new(),
            interrupted: false,
            skip_reason: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, enforcing the state machine and its bookkeeping
    ///
    /// Entering Running starts a new attempt unless the record was
    /// interrupted by a crash. Entering Escalated spends the tier upgrade.
    pub fn transition(&mut self, next: WorkerStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SwarmError::InvalidTransition {
                worker_id: self.worker_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            WorkerStatus::Running => {
                if self.interrupted {
                    self.interrupted = false;
                } else {
                    self.attempts += 1;
                }
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            WorkerStatus::Escalated => {
                self.escalation_used = true;
                self.tier = CapabilityTier::Escalated;
            }
            WorkerStatus::Succeeded | WorkerStatus::Skipped | WorkerStatus::Aborted => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt (the caller transitions to Failed)
    pub fn record_failure(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.failures.push(message.clone());
        self.last_error = Some(message);
    }

    /// Add an attempt's reported cost; negative reports are ignored
    pub fn add_cost(&mut self, cost_usd: f64) {
        if cost_usd > 0.0 {
            self.cost_usd += cost_usd;
        }
    }

    /// Decide the next step after the current attempt failed
    pub fn retry_decision(&self, limits: &RunLimits) -> RetryDecision {
        if self.attempts >= limits.max_attempts {
            RetryDecision::Exhausted
        } else if self.attempts + 1 == limits.max_attempts
            && limits.escalation
            && !self.escalation_used
        {
            RetryDecision::Escalate
        } else {
            RetryDecision::Retry
        }
    }

    /// Whether this record will never run again
    pub fn is_terminal(&self, limits: &RunLimits) -> bool {
        match self.status {
            WorkerStatus::Failed => self.retry_decision(limits) == RetryDecision::Exhausted,
            other => other.is_final(),
        }
    }

    /// Whether the per-worker spend ceiling has been reached
    pub fn over_ceiling(&self, limits: &RunLimits) -> bool {
        self.cost_usd >= limits.worker_ceiling_usd
    }

    /// Re-classify a record left Running by an unclean shutdown
    ///
    /// Bypasses the transition graph: Running becomes Retrying when the
    /// worktree survived and Pending otherwise.
    pub fn reconcile_interrupted(&mut self, worktree_exists: bool) {
        if self.status != WorkerStatus::Running {
            return;
        }
        self.status = if worktree_exists {
            WorkerStatus::Retrying
        } else {
            WorkerStatus::Pending
        };
        self.interrupted = self.attempts > 0;
        self.updated_at = Utc::now();
    }
}

/// Aggregate spend of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostCounters {
    /// Sum of every attempt's reported cost
    pub total_usd: f64,
    /// Number of attempts whose cost has been recorded
    pub attempts: u32,
}

impl CostCounters {
    /// Record one attempt's cost (never decreases the total)
    pub fn record(&mut self, cost_usd: f64) {
        if cost_usd > 0.0 {
            self.total_usd += cost_usd;
        }
        self.attempts += 1;
    }
}

/// Class of a semantic review finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingClass {
    InterfaceMismatch,
    IncompatibleAssumption,
    MissingWiring,
}

impl std::fmt::Display for FindingClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InterfaceMismatch => write!(f, "interface mismatch"),
            Self::IncompatibleAssumption => write!(f, "incompatible assumption"),
            Self::MissingWiring => write!(f, "missing wiring"),
        }
    }
}

/// One issue reported by the semantic review pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub class: FindingClass,
    pub description: String,
    /// Workers whose output is involved
    #[serde(default)]
    pub workers: Vec<WorkerId>,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Outcome of a build or verification command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub command: String,
    pub passed: bool,
    /// Tail of the combined output
    #[serde(default)]
    pub output: String,
}

/// Result of the integration phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    /// Integration branch name
    pub branch: String,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    /// Workers merged, in merge order
    #[serde(default)]
    pub merged: Vec<WorkerId>,
    /// Workers whose merge needed the resolution capability
    #[serde(default)]
    pub resolved: Vec<WorkerId>,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub findings_fixed: bool,
    #[serde(default)]
    pub build: Option<CheckReport>,
    #[serde(default)]
    pub verification: Option<CheckReport>,
    /// Workers that did not succeed, reported alongside the result
    #[serde(default)]
    pub unmerged: Vec<WorkerId>,
}

impl IntegrationRecord {
    /// Build and verification both passed (or were not configured)
    pub fn checks_passed(&self) -> bool {
        self.build.as_ref().map_or(true, |r| r.passed)
            && self.verification.as_ref().map_or(true, |r| r.passed)
    }
}

/// Durable record of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub objective: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ref every worker branch starts from
    pub base_ref: String,
    #[serde(default)]
    pub plan: Option<Plan>,
    /// One record per task, in plan order
    #[serde(default)]
    pub workers: Vec<WorkerRecord>,
    #[serde(default)]
    pub cost: CostCounters,
    /// Limits snapshot taken at plan time
    pub limits: RunLimits,
    pub oversight: OversightPolicy,
    #[serde(default)]
    pub pending_checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub approved_checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub integration: Option<IntegrationRecord>,
    /// Reference to the delivered change set (branch or PR)
    #[serde(default)]
    pub delivery: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        objective: impl Into<String>,
        base_ref: impl Into<String>,
        limits: RunLimits,
        oversight: OversightPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            objective: objective.into(),
            status: RunStatus::Planning,
            created_at: now,
            updated_at: now,
            base_ref: base_ref.into(),
            plan: None,
            workers: Vec::new(),
            cost: CostCounters::default(),
            limits,
            oversight,
            pending_checkpoint: None,
            approved_checkpoints: Vec::new(),
            integration: None,
            delivery: None,
            error: None,
            archived_at: None,
        }
    }

    /// Attach the plan and create one Pending worker per task
    pub fn set_plan(&mut self, plan: Plan) {
        self.workers = plan
            .tasks
            .iter()
            .map(|t| WorkerRecord::new(t.id.clone(), t.display_title()))
            .collect();
        self.plan = Some(plan);
        self.touch();
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    pub fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| w.worker_id == worker_id)
    }

    /// Whether the aggregate spend ceiling has been reached
    pub fn over_aggregate_ceiling(&self) -> bool {
        self.cost.total_usd >= self.limits.aggregate_ceiling_usd
    }

    /// Workers that still need execution
    pub fn runnable_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| !w.is_terminal(&self.limits))
            .map(|w| w.worker_id.clone())
            .collect()
    }

    /// Whether every worker has reached a terminal status
    pub fn all_workers_terminal(&self) -> bool {
        self.workers.iter().all(|w| w.is_terminal(&self.limits))
    }

    /// Succeeded workers in plan order
    pub fn succeeded_workers(&self) -> Vec<&WorkerRecord> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Succeeded)
            .collect()
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    pub fn is_checkpoint_approved(&self, checkpoint: Checkpoint) -> bool {
        self.approved_checkpoints.contains(&checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_attempts: u32, escalation: bool) -> RunLimits {
        RunLimits {
            max_attempts,
            escalation,
            ..RunLimits::default()
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut worker = WorkerRecord::new("api", "API layer");
        worker.transition(WorkerStatus::Running).unwrap();
        assert_eq!(worker.attempts, 1);
        assert!(worker.started_at.is_some());

        worker.transition(WorkerStatus::Succeeded).unwrap();
        assert!(worker.completed_at.is_some());
        assert!(worker.is_terminal(&RunLimits::default()));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut worker = WorkerRecord::new("api", "");
        assert!(worker.transition(WorkerStatus::Succeeded).is_err());
        assert!(worker.transition(WorkerStatus::Retrying).is_err());

        worker.transition(WorkerStatus::Running).unwrap();
        worker.transition(WorkerStatus::Succeeded).unwrap();
        let err = worker.transition(WorkerStatus::Running).unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTransition { .. }));
        assert!(worker.transition(WorkerStatus::Skipped).is_err());
    }

    #[test]
    fn test_retry_then_escalate_then_exhaust() {
        let limits = limits(3, true);
        let mut worker = WorkerRecord::new("db", "");

        worker.transition(WorkerStatus::Running).unwrap();
        worker.transition(WorkerStatus::Failed).unwrap();
        assert_eq!(worker.retry_decision(&limits), RetryDecision::Retry);
        assert!(!worker.is_terminal(&limits));
        worker.transition(WorkerStatus::Retrying).unwrap();

        worker.transition(WorkerStatus::Running).unwrap();
        worker.transition(WorkerStatus::Failed).unwrap();
        assert_eq!(worker.retry_decision(&limits), RetryDecision::Escalate);
        worker.transition(WorkerStatus::Escalated).unwrap();
        assert_eq!(worker.tier, CapabilityTier::Escalated);
        assert!(worker.escalation_used);

        worker.transition(WorkerStatus::Running).unwrap();
        worker.transition(WorkerStatus::Failed).unwrap();
        assert_eq!(worker.attempts, 3);
        assert_eq!(worker.retry_decision(&limits), RetryDecision::Exhausted);
        assert!(worker.is_terminal(&limits));
    }

    #[test]
    fn test_no_escalation_when_disabled() {
        let limits = limits(2, false);
        let mut worker = WorkerRecord::new("db", "");
        worker.transition(WorkerStatus::Running).unwrap();
        worker.transition(WorkerStatus::Failed).unwrap();
        assert_eq!(worker.retry_decision(&limits), RetryDecision::Retry);
    }

    #[test]
    fn test_single_attempt_ceiling() {
        let limits = limits(1, true);
        let mut worker = WorkerRecord::new("db", "");
        worker.transition(WorkerStatus::Running).unwrap();
        worker.transition(WorkerStatus::Failed).unwrap();
        assert_eq!(worker.retry_decision(&limits), RetryDecision::Exhausted);
    }

    #[test]
    fn test_reconcile_interrupted_keeps_attempt_number() {
        let mut worker = WorkerRecord::new("ui", "");
        worker.transition(WorkerStatus::Running).unwrap();

        worker.reconcile_interrupted(true);
        assert_eq!(worker.status, WorkerStatus::Retrying);
        assert!(worker.interrupted);

        worker.transition(WorkerStatus::Running).unwrap();
        assert_eq!(worker.attempts, 1);
        assert!(!worker.interrupted);
    }

    #[test]
    fn test_reconcile_without_worktree_goes_pending() {
        let mut worker = WorkerRecord::new("ui", "");
        worker.transition(WorkerStatus::Running).unwrap();
        worker.reconcile_interrupted(false);
        assert_eq!(worker.status, WorkerStatus::Pending);
    }

    #[test]
    fn test_cost_counters_monotonic() {
        let mut counters = CostCounters::default();
        counters.record(0.5);
        counters.record(-3.0);
        counters.record(0.25);
        assert_eq!(counters.total_usd, 0.75);
        assert_eq!(counters.attempts, 3);
    }

    #[test]
    fn test_run_plan_creates_pending_workers() {
        let mut run = Run::new(
            RunId::from("20260101-000000-abcdef"),
            "objective",
            "main",
            RunLimits::default(),
            OversightPolicy::Gated,
        );
        run.set_plan(Plan::new(
            "objective",
            vec![
                crate::Task::new("a", "do a"),
                crate::Task::new("b", "do b").with_title("Bee"),
            ],
        ));

        assert_eq!(run.workers.len(), 2);
        assert_eq!(run.worker("b").unwrap().title, "Bee");
        assert_eq!(run.runnable_workers(), vec!["a", "b"]);
        assert!(!run.all_workers_terminal());
    }

    #[test]
    fn test_aggregate_ceiling_trips_at_equal() {
        let mut run = Run::new(
            RunId::from("r"),
            "o",
            "main",
            RunLimits {
                aggregate_ceiling_usd: 1.0,
                ..RunLimits::default()
            },
            OversightPolicy::Autonomous,
        );
        run.cost.record(0.5);
        assert!(!run.over_aggregate_ceiling());
        run.cost.record(0.5);
        assert!(run.over_aggregate_ceiling());
    }
}
