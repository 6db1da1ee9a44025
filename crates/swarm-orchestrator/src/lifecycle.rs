//! Worker lifecycle controller
//!
//! Drives one task to a terminal worker status:
//!
//! ```text
//! Pending --acquire--> Running --completed--> Succeeded
//! Running --failed/stalled--> Failed --attempts left--> Retrying --> Running
//!                                    --final attempt--> Escalated --> Running
//!                                    --exhausted--> Failed (terminal)
//! any non-terminal --cost ceiling--> Skipped
//! any non-terminal --run cancelled--> Aborted
//! ```
//!
//! Every transition is persisted through the [`RunLedger`] before the
//! controller acts on it.

use std::sync::Arc;
use std::time::Duration;
use swarm_agent::{
    objective_with_context, AgentCapability, AgentOutcome, AgentRequest, PeerChannel, Progress,
    ProgressReporter,
};
use swarm_core::fail_open::fail_open;
use swarm_core::{
    CapabilityTier, PeerState, PeerStatus, Result, RetryDecision, RunId, SwarmError, Task,
    WorkerId, WorkerStatus,
};
use swarm_vcs::{VcsExecutor, Workspace, WorktreeManager};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::CoordinationBus;
use crate::ledger::{aggregate_skip_reason, worker_skip_reason, RunLedger};
use crate::session::{SessionEvent, SessionLog};

/// How long a stalled or cancelled agent gets to wind down
const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// What the controller does at the top of each loop
enum Step {
    Finished(WorkerStatus),
    Attempt {
        attempt: u32,
        tier: CapabilityTier,
        failures: Vec<String>,
    },
}

/// How an attempt ended, as far as the state machine cares
enum AttemptResult {
    Succeeded {
        summary: String,
        files: Vec<String>,
    },
    Failed(String),
    Aborted,
}

pub struct LifecycleController<E: VcsExecutor + ?Sized> {
    ledger: RunLedger,
    worktrees: WorktreeManager<E>,
    bus: CoordinationBus,
    agent: Arc<dyn AgentCapability>,
    session: SessionLog,
    cancel: CancellationToken,
    run_id: RunId,
    base_ref: String,
    stall_timeout: Duration,
    grace: Duration,
}

impl<E: VcsExecutor + ?Sized> LifecycleController<E> {
    pub fn new(
        ledger: RunLedger,
        worktrees: WorktreeManager<E>,
        bus: CoordinationBus,
        agent: Arc<dyn AgentCapability>,
        session: SessionLog,
        cancel: CancellationToken,
        run_id: RunId,
        base_ref: impl Into<String>,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            worktrees,
            bus,
            agent,
            session,
            cancel,
            run_id,
            base_ref: base_ref.into(),
            stall_timeout,
            grace: DEFAULT_GRACE,
        }
    }

    /// Time an agent gets to stop after cancellation before it is dropped
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run the attempt loop until the worker is terminal
    pub async fn drive(&self, task: &Task, peers: Vec<WorkerId>) -> Result<WorkerStatus> {
        let worker_id = task.id.as_str();

        loop {
            if self.cancel.is_cancelled() {
                return self.abort(worker_id).await;
            }

            let (attempt, tier, failures) = match self.begin_attempt(worker_id).await? {
                Step::Finished(status) => return Ok(status),
                Step::Attempt {
                    attempt,
                    tier,
                    failures,
                } => (attempt, tier, failures),
            };

            info!(
                "Worker {} attempt {} ({} tier)",
                worker_id, attempt, tier
            );
            self.session
                .record(
                    &self.run_id,
                    SessionEvent::AttemptStarted {
                        worker_id: worker_id.to_string(),
                        attempt,
                        tier,
                    },
                )
                .await;
            self.milestone(worker_id, PeerState::InProgress, &format!("attempt {}", attempt))
                .await;

            let (result, cost) = match self.acquire(worker_id).await? {
                Ok(workspace) => {
                    let objective = objective_with_context(&task.objective, &failures);
                    self.attempt(task, &workspace, attempt, tier, objective, peers.clone())
                        .await
                }
                Err(message) => (AttemptResult::Failed(message), 0.0),
            };

            self.session
                .record(
                    &self.run_id,
                    SessionEvent::AttemptFinished {
                        worker_id: worker_id.to_string(),
                        attempt,
                        outcome: match &result {
                            AttemptResult::Succeeded { .. } => "succeeded".to_string(),
                            AttemptResult::Failed(message) => format!("failed: {}", message),
                            AttemptResult::Aborted => "aborted".to_string(),
                        },
                        cost_usd: cost,
                    },
                )
                .await;

            // spend is recorded before anything else may start
            self.ledger.record_cost(worker_id, cost).await?;

            match result {
                AttemptResult::Succeeded { summary, files } => {
                    return self.succeed(worker_id, summary, files).await;
                }
                AttemptResult::Aborted => return self.abort(worker_id).await,
                AttemptResult::Failed(message) => {
                    if let Some(status) = self.fail(worker_id, &message).await? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// Create the worktree and record where it lives
    ///
    /// The outer error is a ledger failure; the inner one fails the attempt.
    async fn acquire(&self, worker_id: &str) -> Result<std::result::Result<Workspace, String>> {
        match self
            .worktrees
            .acquire(&self.run_id, worker_id, &self.base_ref)
            .await
        {
            Ok(workspace) => {
                let (path, branch) = (workspace.path.clone(), workspace.branch.clone());
                self.ledger
                    .update_worker(worker_id, move |worker| {
                        worker.worktree_path = Some(path);
                        worker.branch = Some(branch);
                        Ok(())
                    })
                    .await?;
                Ok(Ok(workspace))
            }
            Err(e) => {
                let exists = self.worktrees.exists(&self.run_id, worker_id);
                self.ledger
                    .update_worker(worker_id, move |worker| {
                        if !exists {
                            worker.worktree_path = None;
                            worker.branch = None;
                        }
                        Ok(())
                    })
                    .await?;
                Ok(Err(format!("workspace: {}", e)))
            }
        }
    }

    /// Decide whether another attempt may start and, if so, mark Running
    async fn begin_attempt(&self, worker_id: &str) -> Result<Step> {
        let id = worker_id.to_string();

        let step = self
            .ledger
            .update(move |run| {
                let limits = run.limits.clone();
                let over_aggregate = run.over_aggregate_ceiling();
                let aggregate_reason = aggregate_skip_reason(run);
                let worker = run
                    .worker(&id)
                    .ok_or_else(|| SwarmError::Other(format!("unknown worker {}", id)))?;
                let worker_reason = worker_skip_reason(run, worker);
                let over_worker = worker.over_ceiling(&limits);

                let worker = run
                    .worker_mut(&id)
                    .ok_or_else(|| SwarmError::Other(format!("unknown worker {}", id)))?;

                if worker.is_terminal(&limits) {
                    return Ok(Step::Finished(worker.status));
                }

                // a Failed record with attempts left moves on first
                if worker.status == WorkerStatus::Failed {
                    match worker.retry_decision(&limits) {
                        RetryDecision::Retry => worker.transition(WorkerStatus::Retrying)?,
                        RetryDecision::Escalate => worker.transition(WorkerStatus::Escalated)?,
                        RetryDecision::Exhausted => return Ok(Step::Finished(worker.status)),
                    }
                }

                if over_aggregate || over_worker {
                    let reason = if over_aggregate {
                        aggregate_reason
                    } else {
                        worker_reason
                    };
                    worker.skip_reason = Some(reason);
                    worker.transition(WorkerStatus::Skipped)?;
                    return Ok(Step::Finished(WorkerStatus::Skipped));
                }

                worker.transition(WorkerStatus::Running)?;
                Ok(Step::Attempt {
                    attempt: worker.attempts,
                    tier: worker.tier,
                    failures: worker.failures.clone(),
                })
            })
            .await?;

        if let Step::Finished(WorkerStatus::Skipped) = step {
            self.terminal_event(worker_id, WorkerStatus::Skipped).await;
        }
        Ok(step)
    }

    /// Invoke the agent under the stall watchdog
    async fn attempt(
        &self,
        task: &Task,
        workspace: &Workspace,
        attempt: u32,
        tier: CapabilityTier,
        objective: String,
        peers: Vec<WorkerId>,
    ) -> (AttemptResult, f64) {
        let worker_id = task.id.as_str();
        let (reporter, mut progress) = ProgressReporter::channel();
        let attempt_cancel = self.cancel.child_token();
        let channel: Arc<dyn PeerChannel> =
            Arc::new(self.bus.channel(&self.run_id, worker_id, reporter.clone()));

        let request = AgentRequest {
            run_id: self.run_id.clone(),
            worker_id: worker_id.to_string(),
            attempt,
            objective,
            task: task.clone(),
            tier,
            workspace: workspace.path.clone(),
            peers,
            channel: Some(channel),
        };

        let invocation = self.agent.invoke(request, reporter, attempt_cancel.clone());
        tokio::pin!(invocation);

        let mut deadline = Instant::now() + self.stall_timeout;
        let mut last_cost = 0.0_f64;
        let mut stalled = false;
        let mut winding_down = false;

        let outcome = loop {
            tokio::select! {
                result = &mut invocation => break result,
                Some(signal) = progress.recv(), if !winding_down => {
                    if let Progress::Cost(cost) = signal {
                        last_cost = last_cost.max(cost);
                    }
                    deadline = Instant::now() + self.stall_timeout;
                }
                _ = self.cancel.cancelled(), if !winding_down => {
                    debug!("Run cancelled; waiting for worker {} to stop", worker_id);
                    winding_down = true;
                    deadline = Instant::now() + self.grace;
                }
                _ = sleep_until(deadline) => {
                    if winding_down {
                        warn!("Worker {} ignored cancellation; dropping the invocation", worker_id);
                        break Ok(AgentOutcome::Cancelled { cost_usd: last_cost });
                    }
                    warn!(
                        "Worker {} stalled: no progress for {}s",
                        worker_id,
                        self.stall_timeout.as_secs()
                    );
                    stalled = true;
                    winding_down = true;
                    attempt_cancel.cancel();
                    deadline = Instant::now() + self.grace;
                }
            }
        };

        match outcome {
            Ok(AgentOutcome::Completed {
                summary,
                cost_usd,
                touched_files,
            }) => {
                let message = commit_message(worker_id, &summary);
                if let Err(e) = self.worktrees.repo().commit_all(&workspace.path, &message).await {
                    return (
                        AttemptResult::Failed(format!("could not commit work: {}", e)),
                        cost_usd,
                    );
                }
                let files = match self.worktrees.changed_files(workspace, &self.base_ref).await {
                    Ok(files) if !files.is_empty() => files,
                    Ok(_) => touched_files,
                    Err(e) => {
                        debug!("changed_files failed for {}: {}", worker_id, e);
                        touched_files
                    }
                };
                (AttemptResult::Succeeded { summary, files }, cost_usd)
            }
            Ok(AgentOutcome::Failed { message, cost_usd }) => {
                (AttemptResult::Failed(message), cost_usd)
            }
            Ok(AgentOutcome::Cancelled { cost_usd }) => {
                let cost = cost_usd.max(last_cost);
                if stalled {
                    let stall = SwarmError::StallTimeout {
                        run_id: self.run_id.to_string(),
                        worker_id: worker_id.to_string(),
                        idle_secs: self.stall_timeout.as_secs(),
                    };
                    debug!("{}", stall);
                    (
                        AttemptResult::Failed(format!(
                            "stalled: no progress for {}s",
                            self.stall_timeout.as_secs()
                        )),
                        cost,
                    )
                } else if self.cancel.is_cancelled() {
                    (AttemptResult::Aborted, cost)
                } else {
                    (
                        AttemptResult::Failed("agent invocation was cancelled".to_string()),
                        cost,
                    )
                }
            }
            Err(e) => (AttemptResult::Failed(e.to_string()), last_cost),
        }
    }

    async fn succeed(
        &self,
        worker_id: &str,
        summary: String,
        files: Vec<String>,
    ) -> Result<WorkerStatus> {
        let summary_for_status = summary.lines().next().unwrap_or_default().to_string();
        self.ledger
            .update_worker(worker_id, move |worker| {
                worker.summary = Some(summary);
                worker.files_changed = files;
                worker.transition(WorkerStatus::Succeeded)
            })
            .await?;

        info!("Worker {} succeeded", worker_id);
        self.milestone(worker_id, PeerState::Done, &summary_for_status)
            .await;
        self.terminal_event(worker_id, WorkerStatus::Succeeded).await;
        Ok(WorkerStatus::Succeeded)
    }

    /// Persist Failed, then re-classify it; returns the status if terminal
    async fn fail(&self, worker_id: &str, message: &str) -> Result<Option<WorkerStatus>> {
        let failure = SwarmError::TaskFailure {
            run_id: self.run_id.to_string(),
            worker_id: worker_id.to_string(),
            message: message.to_string(),
        };
        warn!("{}", failure);

        let recorded = message.to_string();
        self.ledger
            .update_worker(worker_id, move |worker| {
                worker.record_failure(recorded);
                worker.transition(WorkerStatus::Failed)
            })
            .await?;

        let id = worker_id.to_string();
        let decision = self
            .ledger
            .update(move |run| {
                let limits = run.limits.clone();
                let worker = run
                    .worker_mut(&id)
                    .ok_or_else(|| SwarmError::Other(format!("unknown worker {}", id)))?;
                let decision = worker.retry_decision(&limits);
                match decision {
                    RetryDecision::Retry => worker.transition(WorkerStatus::Retrying)?,
                    RetryDecision::Escalate => worker.transition(WorkerStatus::Escalated)?,
                    RetryDecision::Exhausted => {}
                }
                Ok(decision)
            })
            .await?;

        match decision {
            RetryDecision::Exhausted => {
                info!("Worker {} failed terminally", worker_id);
                self.milestone(worker_id, PeerState::Blocked, "failed").await;
                self.terminal_event(worker_id, WorkerStatus::Failed).await;
                Ok(Some(WorkerStatus::Failed))
            }
            RetryDecision::Retry => {
                debug!("Worker {} will retry", worker_id);
                Ok(None)
            }
            RetryDecision::Escalate => {
                info!("Worker {} escalates for its final attempt", worker_id);
                Ok(None)
            }
        }
    }

    async fn abort(&self, worker_id: &str) -> Result<WorkerStatus> {
        let id = worker_id.to_string();
        let status = self
            .ledger
            .update(move |run| {
                let limits = run.limits.clone();
                let worker = run
                    .worker_mut(&id)
                    .ok_or_else(|| SwarmError::Other(format!("unknown worker {}", id)))?;
                if !worker.is_terminal(&limits) {
                    worker.transition(WorkerStatus::Aborted)?;
                }
                Ok(worker.status)
            })
            .await?;

        if status == WorkerStatus::Aborted {
            info!("Worker {} aborted", worker_id);
            self.terminal_event(worker_id, status).await;
        }
        Ok(status)
    }

    async fn milestone(&self, worker_id: &str, state: PeerState, milestone: &str) {
        let status = PeerStatus::new(worker_id, state, milestone);
        fail_open("lifecycle::publish_status", || {
            self.bus.publish_status(&self.run_id, &status)
        })
        .await;
    }

    async fn terminal_event(&self, worker_id: &str, status: WorkerStatus) {
        let reason = self
            .ledger
            .snapshot()
            .await
            .worker(worker_id)
            .and_then(|w| w.skip_reason.clone().or_else(|| w.last_error.clone()));
        self.session
            .record(
                &self.run_id,
                SessionEvent::WorkerTerminal {
                    worker_id: worker_id.to_string(),
                    status,
                    reason: if status == WorkerStatus::Succeeded {
                        None
                    } else {
                        reason
                    },
                },
            )
            .await;
    }
}

fn commit_message(worker_id: &str, summary: &str) -> String {
    let headline = summary.lines().next().unwrap_or_default().trim();
    if headline.is_empty() {
        format!("swarm: {}", worker_id)
    } else {
        format!("swarm: {}: {}", worker_id, headline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use swarm_core::{OversightPolicy, Plan, Run, RunLimits, WorktreeConfig};
    use swarm_vcs::{MockVcsExecutor, VcsOutput};
    use tempfile::TempDir;

    use crate::store::StateStore;

    enum Script {
        Complete(f64),
        Fail(&'static str, f64),
        /// Report cost, then never make progress again
        Hang(f64),
    }

    struct ScriptedAgent {
        script: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<AgentRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentCapability for ScriptedAgent {
        async fn invoke(
            &self,
            request: AgentRequest,
            progress: ProgressReporter,
            cancel: CancellationToken,
        ) -> Result<AgentOutcome> {
            self.requests.lock().unwrap().push(request);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Script::Complete(cost)) => {
                    progress.heartbeat();
                    Ok(AgentOutcome::Completed {
                        summary: "done".into(),
                        cost_usd: cost,
                        touched_files: vec!["src/lib.rs".into()],
                    })
                }
                Some(Script::Fail(message, cost)) => Ok(AgentOutcome::Failed {
                    message: message.into(),
                    cost_usd: cost,
                }),
                Some(Script::Hang(cost)) => {
                    progress.cost(cost);
                    cancel.cancelled().await;
                    Ok(AgentOutcome::Cancelled { cost_usd: cost })
                }
                None => Err(SwarmError::Agent("script exhausted".into())),
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        ledger: RunLedger,
        controller: LifecycleController<MockVcsExecutor>,
        cancel: CancellationToken,
        task: Task,
    }

    fn fixture(agent: Arc<ScriptedAgent>, limits: RunLimits, stall: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let executor = MockVcsExecutor::with_root(dir.path());
        fixture_in(dir, executor, agent, limits, stall)
    }

    fn fixture_in(
        dir: TempDir,
        executor: MockVcsExecutor,
        agent: Arc<ScriptedAgent>,
        limits: RunLimits,
        stall: Duration,
    ) -> Fixture {
        let run_id = RunId::from("r1");
        let task = Task::new("api", "build the api");
        let mut run = Run::new(
            run_id.clone(),
            "objective",
            "main",
            limits,
            OversightPolicy::Autonomous,
        );
        run.set_plan(Plan::new("objective", vec![task.clone()]));

        let store = Arc::new(StateStore::new(dir.path().join(".swarm")));
        let ledger = RunLedger::new(store, run);
        let worktrees = WorktreeManager::new(Arc::new(executor), &WorktreeConfig::default());
        let cancel = CancellationToken::new();
        let controller = LifecycleController::new(
            ledger.clone(),
            worktrees,
            CoordinationBus::new(dir.path().join("coordination")),
            agent,
            SessionLog::new(dir.path().join("logs")),
            cancel.clone(),
            run_id,
            "main",
            stall,
        )
        .with_grace(Duration::from_millis(200));

        Fixture {
            _dir: dir,
            ledger,
            controller,
            cancel,
            task,
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let agent = ScriptedAgent::new(vec![Script::Complete(0.3)]);
        let f = fixture(agent.clone(), RunLimits::default(), Duration::from_secs(60));

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Succeeded);

        let run = f.ledger.snapshot().await;
        let worker = run.worker("api").unwrap();
        assert_eq!(worker.attempts, 1);
        assert_eq!(worker.cost_usd, 0.3);
        assert_eq!(worker.files_changed, vec!["src/lib.rs"]);
        assert_eq!(worker.branch.as_deref(), Some("swarm/r1/api"));
        assert!(worker.worktree_path.as_ref().unwrap().ends_with("r1/api"));
        assert_eq!(run.cost.total_usd, 0.3);
    }

    #[tokio::test]
    async fn test_failed_acquire_records_no_worktree() {
        let dir = TempDir::new().unwrap();
        let executor = MockVcsExecutor::with_root(dir.path()).with_prefix(
            "worktree add",
            VcsOutput::failed("fatal: invalid reference: main"),
        );
        let agent = ScriptedAgent::new(vec![]);
        let f = fixture_in(
            dir,
            executor,
            agent.clone(),
            RunLimits::default(),
            Duration::from_secs(60),
        );

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Failed);
        assert!(agent.requests().is_empty());

        let worker = f.ledger.snapshot().await.worker("api").unwrap().clone();
        assert_eq!(worker.attempts, 2);
        assert!(worker.failures[0].starts_with("workspace:"));
        assert_eq!(worker.worktree_path, None);
        assert_eq!(worker.branch, None);
    }

    #[tokio::test]
    async fn test_retry_carries_failure_context() {
        let agent = ScriptedAgent::new(vec![
            Script::Fail("tests fail", 0.1),
            Script::Complete(0.2),
        ]);
        let limits = RunLimits {
            max_attempts: 3,
            ..RunLimits::default()
        };
        let f = fixture(agent.clone(), limits, Duration::from_secs(60));

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Succeeded);

        let requests = agent.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].objective, "build the api");
        assert!(requests[1].objective.contains("Attempt 1: tests fail"));
        assert_eq!(requests[1].tier, CapabilityTier::Standard);

        let run = f.ledger.snapshot().await;
        assert_eq!(run.worker("api").unwrap().attempts, 2);
        assert_eq!(run.cost.attempts, 2);
    }

    #[tokio::test]
    async fn test_escalates_final_attempt_then_fails() {
        let agent = ScriptedAgent::new(vec![
            Script::Fail("first", 0.1),
            Script::Fail("second", 0.1),
        ]);
        let f = fixture(agent.clone(), RunLimits::default(), Duration::from_secs(60));

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Failed);

        let requests = agent.requests();
        assert_eq!(requests[0].tier, CapabilityTier::Standard);
        assert_eq!(requests[1].tier, CapabilityTier::Escalated);
        // escalation only changes the tier
        assert!(requests[1].objective.starts_with("build the api"));

        let worker = f.ledger.snapshot().await.worker("api").unwrap().clone();
        assert_eq!(worker.attempts, 2);
        assert!(worker.escalation_used);
        assert_eq!(worker.failures, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_worker_ceiling_skips_next_attempt() {
        let agent = ScriptedAgent::new(vec![Script::Fail("expensive", 2.0)]);
        let limits = RunLimits {
            max_attempts: 3,
            worker_ceiling_usd: 1.5,
            ..RunLimits::default()
        };
        let f = fixture(agent.clone(), limits, Duration::from_secs(60));

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Skipped);
        assert_eq!(agent.requests().len(), 1);

        let worker = f.ledger.snapshot().await.worker("api").unwrap().clone();
        assert!(worker.skip_reason.unwrap().contains("worker api"));
    }

    #[tokio::test]
    async fn test_stalled_attempt_is_a_failure() {
        let agent = ScriptedAgent::new(vec![Script::Hang(0.4), Script::Complete(0.1)]);
        let limits = RunLimits {
            max_attempts: 2,
            escalation: false,
            ..RunLimits::default()
        };
        let f = fixture(agent.clone(), limits, Duration::from_millis(100));

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Succeeded);

        let run = f.ledger.snapshot().await;
        let worker = run.worker("api").unwrap();
        assert!(worker.failures[0].starts_with("stalled: no progress"));
        assert!((run.cost.total_usd - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_cancellation_aborts_worker() {
        let agent = ScriptedAgent::new(vec![Script::Hang(0.2)]);
        let f = fixture(agent.clone(), RunLimits::default(), Duration::from_secs(60));

        let cancel = f.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let status = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(status, WorkerStatus::Aborted);
        assert_eq!(agent.requests().len(), 1);
        assert_eq!(f.ledger.snapshot().await.cost.total_usd, 0.2);
    }

    #[tokio::test]
    async fn test_terminal_worker_is_not_rerun() {
        let agent = ScriptedAgent::new(vec![Script::Complete(0.1)]);
        let f = fixture(agent.clone(), RunLimits::default(), Duration::from_secs(60));

        f.controller.drive(&f.task, vec![]).await.unwrap();
        let again = f.controller.drive(&f.task, vec![]).await.unwrap();
        assert_eq!(again, WorkerStatus::Succeeded);
        assert_eq!(agent.requests().len(), 1);
    }

    #[test]
    fn test_commit_message_uses_headline() {
        assert_eq!(commit_message("api", "Added routes\n\ndetails"), "swarm: api: Added routes");
        assert_eq!(commit_message("api", ""), "swarm: api");
    }
}
