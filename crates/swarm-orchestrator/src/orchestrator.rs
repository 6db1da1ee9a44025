//! Top-level pipeline
//!
//! plan -> bounded fan-out of lifecycle controllers -> integration ->
//! oversight gate -> deliver, pause or abort. One run may be active per
//! repository; every phase can be resumed from the persisted record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_agent::{AgentCapability, ClaudeCli, ConflictResolver, PlanningCapability, ReviewCapability};
use swarm_core::fail_open::fail_open;
use swarm_core::{
    Checkpoint, Result, Run, RunId, RunStatus, SwarmConfig, SwarmError, WorkerStatus,
};
use swarm_vcs::{CleanupReport, ProcessRunner, VcsExecutor, WorktreeManager};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination::CoordinationBus;
use crate::delivery::{delivery_for, Delivery};
use crate::integrator::Integrator;
use crate::ledger::RunLedger;
use crate::lifecycle::LifecycleController;
use crate::oversight::{Approver, GateDecision, NoApprover, OversightGate};
use crate::plan::validate_plan;
use crate::session::{SessionEvent, SessionLog};
use crate::store::StateStore;

/// How long cancelled agents get to stop before they are dropped
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// External capabilities the pipeline consumes
#[derive(Clone)]
pub struct Capabilities {
    pub planner: Arc<dyn PlanningCapability>,
    pub agent: Arc<dyn AgentCapability>,
    pub resolver: Option<Arc<dyn ConflictResolver>>,
    pub reviewer: Option<Arc<dyn ReviewCapability>>,
}

impl Capabilities {
    /// Every capability backed by one coding-agent CLI
    pub fn from_cli(cli: ClaudeCli) -> Self {
        let cli = Arc::new(cli);
        Self {
            planner: cli.clone(),
            agent: cli.clone(),
            resolver: Some(cli.clone()),
            reviewer: Some(cli),
        }
    }
}

pub struct Orchestrator<E: VcsExecutor + ?Sized + 'static> {
    config: SwarmConfig,
    repo_root: PathBuf,
    store: Arc<StateStore>,
    worktrees: WorktreeManager<E>,
    bus: CoordinationBus,
    session: SessionLog,
    capabilities: Capabilities,
    approver: Arc<dyn Approver>,
    delivery: Arc<dyn Delivery>,
    cancel: CancellationToken,
    cancel_grace: Duration,
}

impl<E: VcsExecutor + ?Sized + 'static> Orchestrator<E> {
    pub fn new(executor: Arc<E>, config: SwarmConfig, capabilities: Capabilities) -> Self {
        let repo_root = executor.repo_root().clone();
        let delivery = delivery_for(
            config.integration.delivery,
            executor.clone(),
            Arc::new(ProcessRunner),
        );
        let worktrees = WorktreeManager::new(executor, &config.worktree);
        Self {
            store: Arc::new(StateStore::for_repo(&repo_root)),
            bus: CoordinationBus::for_repo(&repo_root),
            session: SessionLog::for_repo(&repo_root),
            worktrees,
            config,
            repo_root,
            capabilities,
            approver: Arc::new(NoApprover),
            delivery,
            cancel: CancellationToken::new(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn bus(&self) -> &CoordinationBus {
        &self.bus
    }

    pub fn session(&self) -> &SessionLog {
        &self.session
    }

    pub fn worktrees(&self) -> &WorktreeManager<E> {
        &self.worktrees
    }

    /// Token that stops the active pipeline when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal in-flight agents to stop; their workers end Aborted
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    /// Obtain and validate a plan, then persist it as the new active run
    pub async fn plan(&self, objective: &str) -> Result<Run> {
        if let Some(active) = self.store.active_run_id().await? {
            return Err(SwarmError::RunConflict {
                active_run: active.to_string(),
            });
        }
        if objective.trim().is_empty() {
            return Err(SwarmError::Validation("objective is empty".to_string()));
        }

        let base_ref = match &self.config.base_branch {
            Some(branch) => branch.clone(),
            None => self.worktrees.repo().current_branch().await?,
        };

        info!("Planning: {}", objective.lines().next().unwrap_or(objective));
        let raw = self
            .capabilities
            .planner
            .plan(objective, self.config.max_tasks, &self.repo_root)
            .await?;
        let plan = validate_plan(raw, objective, self.config.max_tasks)?;

        let mut run = Run::new(
            RunId::generate(),
            objective,
            base_ref.clone(),
            self.config.limits.clone(),
            self.config.oversight.policy,
        );
        let task_ids: Vec<_> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        run.set_plan(plan);
        self.store.begin(&run).await?;

        info!(
            "Run {} planned with {} tasks on {}",
            run.run_id,
            run.workers.len(),
            base_ref
        );
        self.session
            .record(
                &run.run_id,
                SessionEvent::RunStarted {
                    objective: objective.to_string(),
                    base_ref,
                },
            )
            .await;
        self.session
            .record(&run.run_id, SessionEvent::PlanReady { tasks: task_ids })
            .await;
        Ok(run)
    }

    /// Fan out the active run's runnable workers
    pub async fn execute(&self) -> Result<Run> {
        let run = self.active().await?;
        self.execute_run(run).await
    }

    /// Integrate the active run once every worker is terminal
    pub async fn integrate(&self) -> Result<Run> {
        let run = self.active().await?;
        self.integrate_run(run).await
    }

    /// Plan and drive a new run as far as the oversight policy allows
    pub async fn run(&self, objective: &str) -> Result<Run> {
        let run = self.plan(objective).await?;
        self.advance(run).await
    }

    /// Continue the active run from wherever it stopped
    ///
    /// The saved plan is reused; only Pending and Retrying workers run again.
    pub async fn resume(&self) -> Result<Run> {
        let run = self.active().await?;
        info!("Resuming run {} ({})", run.run_id, run.status);
        self.advance(run).await
    }

    /// Approve the checkpoint the active run is paused at, then continue
    pub async fn approve(&self) -> Result<Run> {
        let mut run = self.active().await?;
        let checkpoint = match (run.status, run.pending_checkpoint) {
            (RunStatus::AwaitingApproval, Some(checkpoint)) => checkpoint,
            _ => {
                return Err(SwarmError::Validation(format!(
                    "run {} is not awaiting approval (status {})",
                    run.run_id, run.status
                )))
            }
        };

        info!("Checkpoint {} approved for run {}", checkpoint, run.run_id);
        if !run.is_checkpoint_approved(checkpoint) {
            run.approved_checkpoints.push(checkpoint);
        }
        run.touch();
        self.store.save(&run).await?;
        self.advance(run).await
    }

    /// Abort the active run, keeping its worktrees for inspection
    pub async fn abort(&self) -> Result<Run> {
        let run = match self.store.load_raw().await? {
            Some(run) => run,
            None => return Err(SwarmError::NoActiveRun),
        };
        self.abort_run(run).await
    }

    /// Remove a finished run's worktrees, branches and coordination artifacts
    pub async fn cleanup(&self, run_id: &RunId) -> Result<CleanupReport> {
        if self.store.active_run_id().await?.as_ref() == Some(run_id) {
            return Err(SwarmError::RunConflict {
                active_run: run_id.to_string(),
            });
        }
        let report = self.worktrees.cleanup(run_id).await?;
        self.bus.cleanup(run_id).await?;
        Ok(report)
    }

    /// Remove one worker's worktree of a finished run, keeping its branch
    ///
    /// Returns whether a worktree was on disk.
    pub async fn release_worker(&self, run_id: &RunId, worker_id: &str) -> Result<bool> {
        if self.store.active_run_id().await?.as_ref() == Some(run_id) {
            return Err(SwarmError::RunConflict {
                active_run: run_id.to_string(),
            });
        }
        let run = self.store.get(run_id).await?;
        if run.worker(worker_id).is_none() {
            return Err(SwarmError::Validation(format!(
                "run {} has no worker {}",
                run_id, worker_id
            )));
        }
        let existed = self.worktrees.exists(run_id, worker_id);
        self.worktrees
            .release(&self.worktrees.workspace(run_id, worker_id))
            .await?;
        info!("Released worktree of {} in run {}", worker_id, run_id);
        Ok(existed)
    }

    /// Remove every swarm worktree and branch; refused while a run is active
    pub async fn cleanup_all(&self) -> Result<CleanupReport> {
        if let Some(active) = self.store.active_run_id().await? {
            return Err(SwarmError::RunConflict {
                active_run: active.to_string(),
            });
        }
        let report = self.worktrees.cleanup_all().await?;
        for run in self.store.list().await? {
            fail_open("orchestrator::cleanup_coordination", || {
                self.bus.cleanup(&run.run_id)
            })
            .await;
        }
        Ok(report)
    }

    /// Read-only view: a specific run, else the active run, else the latest
    pub async fn status(&self, run_id: Option<&RunId>) -> Result<Option<Run>> {
        match run_id {
            Some(run_id) => Ok(Some(self.store.get(run_id).await?)),
            None => self.store.latest().await,
        }
    }

    async fn active(&self) -> Result<Run> {
        self.store.load().await?.ok_or(SwarmError::NoActiveRun)
    }

    /// Move a run forward until it pauses or becomes terminal
    async fn advance(&self, run: Run) -> Result<Run> {
        match (run.status, run.pending_checkpoint) {
            (RunStatus::Planning | RunStatus::Executing, _)
            | (RunStatus::AwaitingApproval, Some(Checkpoint::BeforeFanOut)) => {
                let run = self.execute_run(run).await?;
                if run.status != RunStatus::Executing {
                    return Ok(run);
                }
                self.integrate_run(run).await
            }
            (RunStatus::Integrating, _)
            | (RunStatus::AwaitingApproval, Some(Checkpoint::BeforeIntegration)) => {
                self.integrate_run(run).await
            }
            (RunStatus::AwaitingApproval, _) => self.deliver_stage(run).await,
            (RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted, _) => Ok(run),
        }
    }

    /// Gate, then drive every runnable worker under the concurrency bound
    ///
    /// Returns the run still Executing once all workers are terminal, or
    /// paused/aborted by the gate or cancellation.
    async fn execute_run(&self, run: Run) -> Result<Run> {
        let mut run = run;
        if matches!(run.status, RunStatus::Planning | RunStatus::AwaitingApproval) {
            let (gated, decision) = self.pass_gate(run, Checkpoint::BeforeFanOut).await?;
            run = gated;
            if decision != GateDecision::Proceed {
                return Ok(run);
            }
        } else if run.status != RunStatus::Executing {
            return Ok(run);
        }

        run.set_status(RunStatus::Executing);
        run.pending_checkpoint = None;
        self.store.save(&run).await?;

        let plan = run
            .plan
            .clone()
            .ok_or_else(|| SwarmError::Validation(format!("run {} has no plan", run.run_id)))?;
        let runnable = run.runnable_workers();
        let run_id = run.run_id.clone();
        let stall_timeout = Duration::from_secs(run.limits.stall_timeout_secs);
        let base_ref = run.base_ref.clone();
        let ledger = RunLedger::new(self.store.clone(), run);

        info!(
            "Run {}: {} runnable workers, concurrency {}",
            run_id,
            runnable.len(),
            self.config.max_concurrency
        );

        fail_open("worktrees::disable_gc", || self.worktrees.disable_gc()).await;

        let controller = Arc::new(
            LifecycleController::new(
                ledger.clone(),
                self.worktrees.clone(),
                self.bus.clone(),
                self.capabilities.agent.clone(),
                self.session.clone(),
                self.cancel.clone(),
                run_id.clone(),
                base_ref,
                stall_timeout,
            )
            .with_grace(self.cancel_grace),
        );
        let slots = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut workers = JoinSet::new();

        for worker_id in runnable {
            let Some(task) = plan.task(&worker_id).cloned() else {
                warn!("Worker {} has no task in the plan", worker_id);
                continue;
            };

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit
                    .map_err(|e| SwarmError::Other(format!("worker slots closed: {}", e)))?,
                _ = self.cancel.cancelled() => break,
            };

            let peers = CoordinationBus::peers_for(&plan, &worker_id);
            let controller = controller.clone();
            debug!("Starting worker {}", worker_id);
            workers.spawn(async move {
                let _permit = permit;
                let status = controller.drive(&task, peers).await;
                (task.id, status)
            });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((worker_id, Ok(status))) => {
                    debug!("Worker {} finished: {}", worker_id, status);
                }
                Ok((worker_id, Err(e))) => {
                    error!("Worker {} could not be driven: {}", worker_id, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    first_error.get_or_insert(SwarmError::Other(format!("worker task failed: {}", e)));
                }
            }
        }

        fail_open("worktrees::restore_gc", || self.worktrees.restore_gc()).await;

        let run = ledger.snapshot().await;
        if let Some(e) = first_error {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return self.abort_run(run).await;
        }

        info!(
            "Run {}: {} succeeded, {} failed, {} skipped",
            run.run_id,
            run.count(WorkerStatus::Succeeded),
            run.count(WorkerStatus::Failed),
            run.count(WorkerStatus::Skipped)
        );
        Ok(run)
    }

    /// Gate, merge, verify, then hand over to the delivery stage
    async fn integrate_run(&self, run: Run) -> Result<Run> {
        let mut run = run;
        if !run.all_workers_terminal() {
            return Err(SwarmError::Validation(format!(
                "run {} still has workers that are not terminal",
                run.run_id
            )));
        }

        if matches!(run.status, RunStatus::Executing | RunStatus::AwaitingApproval) {
            let (gated, decision) = self.pass_gate(run, Checkpoint::BeforeIntegration).await?;
            run = gated;
            if decision != GateDecision::Proceed {
                return Ok(run);
            }
        } else if run.status != RunStatus::Integrating {
            return Ok(run);
        }

        run.set_status(RunStatus::Integrating);
        run.pending_checkpoint = None;
        self.store.save(&run).await?;

        if run.succeeded_workers().is_empty() {
            warn!("Run {}: no worker succeeded; nothing to integrate", run.run_id);
            run.error = Some("no worker succeeded".to_string());
            return self.finish(run, RunStatus::Failed).await;
        }

        let integrator = Integrator::new(
            self.worktrees.clone(),
            self.config.integration.clone(),
            self.bus.clone(),
            self.session.clone(),
            self.cancel.clone(),
        )
        .with_resolver(self.capabilities.resolver.clone())
        .with_reviewer(self.capabilities.reviewer.clone());

        match integrator.integrate(&run).await {
            Ok(record) => {
                run.integration = Some(record);
                run.touch();
                self.store.save(&run).await?;
            }
            Err(SwarmError::Cancelled(_)) => return self.abort_run(run).await,
            Err(e @ SwarmError::MergeConflict { .. }) => {
                error!("{}", e);
                run.error = Some(e.to_string());
                self.finish(run, RunStatus::Failed).await?;
                return Err(e);
            }
            Err(e) => {
                // left Integrating so resume can retry
                run.error = Some(e.to_string());
                run.touch();
                self.store.save(&run).await?;
                return Err(e);
            }
        }

        self.deliver_stage(run).await
    }

    /// Final gate, then delivery
    async fn deliver_stage(&self, run: Run) -> Result<Run> {
        let (mut run, decision) = self.pass_gate(run, Checkpoint::BeforeDelivery).await?;
        if decision != GateDecision::Proceed {
            return Ok(run);
        }

        let reference = self.delivery.deliver(&run).await?;
        run.delivery = Some(reference);
        run.pending_checkpoint = None;
        self.finish(run, RunStatus::Completed).await
    }

    /// Consult the gate; a pause is persisted, an abort archives the run
    async fn pass_gate(&self, run: Run, checkpoint: Checkpoint) -> Result<(Run, GateDecision)> {
        let gate = OversightGate::new(
            self.approver.clone(),
            Duration::from_secs(self.config.oversight.approval_timeout_secs),
        );
        let decision = gate.decide(&run, checkpoint).await;
        self.session
            .record(
                &run.run_id,
                SessionEvent::Gate {
                    checkpoint,
                    decision: decision.to_string(),
                },
            )
            .await;

        let mut run = run;
        match decision {
            GateDecision::Proceed => {
                if !run.is_checkpoint_approved(checkpoint) {
                    run.approved_checkpoints.push(checkpoint);
                }
            }
            GateDecision::Pause => {
                info!(
                    "Run {} paused {}; approve or abort to continue",
                    run.run_id, checkpoint
                );
                run.set_status(RunStatus::AwaitingApproval);
                run.pending_checkpoint = Some(checkpoint);
                self.store.save(&run).await?;
            }
            GateDecision::Abort => {
                info!("Run {} declined {}", run.run_id, checkpoint);
                run = self.abort_run(run).await?;
            }
        }
        Ok((run, decision))
    }

    async fn abort_run(&self, mut run: Run) -> Result<Run> {
        let limits = run.limits.clone();
        for worker in &mut run.workers {
            if !worker.is_terminal(&limits) {
                worker.transition(WorkerStatus::Aborted)?;
            }
        }
        run.pending_checkpoint = None;
        warn!("Run {} aborted", run.run_id);
        self.finish(run, RunStatus::Aborted).await
    }

    /// Record a terminal status and archive the run
    async fn finish(&self, mut run: Run, status: RunStatus) -> Result<Run> {
        run.set_status(status);
        self.store.archive(&mut run).await?;
        self.session
            .record(
                &run.run_id,
                SessionEvent::RunFinished {
                    status,
                    delivery: run.delivery.clone(),
                },
            )
            .await;
        info!("Run {} finished: {}", run.run_id, status);
        Ok(run)
    }
}
