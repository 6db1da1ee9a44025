//! Shared, persisted view of the active run
//!
//! Concurrent workers mutate the same [`Run`]. Every mutation goes through
//! [`RunLedger::update`], which applies it to a copy, persists the copy and
//! only then publishes it in memory. A failed save leaves both the file and
//! the in-memory record untouched.

use std::sync::Arc;
use swarm_core::{Result, Run, SwarmError, WorkerRecord, WorkerStatus};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::StateStore;

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<StateStore>,
    run: Arc<Mutex<Run>>,
}

impl RunLedger {
    pub fn new(store: Arc<StateStore>, run: Run) -> Self {
        Self {
            store,
            run: Arc::new(Mutex::new(run)),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Clone of the current record
    pub async fn snapshot(&self) -> Run {
        self.run.lock().await.clone()
    }

    /// Apply `f`, persist, then publish
    ///
    /// The lock is held across the save so updates are serialized in the
    /// order they were persisted.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Run) -> Result<T>) -> Result<T> {
        let mut guard = self.run.lock().await;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        next.touch();
        self.store.save(&next).await?;
        *guard = next;
        Ok(value)
    }

    /// Apply `f` to one worker's record
    pub async fn update_worker<T>(
        &self,
        worker_id: &str,
        f: impl FnOnce(&mut WorkerRecord) -> Result<T>,
    ) -> Result<T> {
        let worker_id = worker_id.to_string();
        self.update(move |run| {
            let worker = run
                .worker_mut(&worker_id)
                .ok_or_else(|| SwarmError::Other(format!("unknown worker {}", worker_id)))?;
            f(worker)
        })
        .await
    }

    /// Record one attempt's cost against the worker and the run
    ///
    /// When this pushes the run to its aggregate ceiling every worker that
    /// has not started yet is skipped in the same update. Returns whether
    /// the aggregate ceiling is now reached.
    pub async fn record_cost(&self, worker_id: &str, cost_usd: f64) -> Result<bool> {
        let worker_id = worker_id.to_string();
        self.update(move |run| {
            if let Some(worker) = run.worker_mut(&worker_id) {
                worker.add_cost(cost_usd);
            }
            run.cost.record(cost_usd);

            if !run.over_aggregate_ceiling() {
                return Ok(false);
            }

            let reason = aggregate_skip_reason(run);
            for worker in run
                .workers
                .iter_mut()
                .filter(|w| w.status == WorkerStatus::Pending)
            {
                debug!("Skipping pending worker {}: {}", worker.worker_id, reason);
                worker.skip_reason = Some(reason.clone());
                worker.transition(WorkerStatus::Skipped)?;
            }
            warn!(
                "Run {} reached its aggregate cost ceiling (${:.2})",
                run.run_id, run.limits.aggregate_ceiling_usd
            );
            Ok(true)
        })
        .await
    }
}

pub(crate) fn aggregate_skip_reason(run: &Run) -> String {
    SwarmError::CostCeilingExceeded {
        run_id: run.run_id.to_string(),
        scope: "aggregate".to_string(),
        spent: run.cost.total_usd,
        ceiling: run.limits.aggregate_ceiling_usd,
    }
    .to_string()
}

pub(crate) fn worker_skip_reason(run: &Run, worker: &WorkerRecord) -> String {
    SwarmError::CostCeilingExceeded {
        run_id: run.run_id.to_string(),
        scope: format!("worker {}", worker.worker_id),
        spent: worker.cost_usd,
        ceiling: run.limits.worker_ceiling_usd,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::{OversightPolicy, Plan, RunId, RunLimits, Task};
    use tempfile::TempDir;

    fn ledger(dir: &TempDir, aggregate: f64) -> RunLedger {
        let mut run = Run::new(
            RunId::from("r1"),
            "objective",
            "main",
            RunLimits {
                aggregate_ceiling_usd: aggregate,
                ..RunLimits::default()
            },
            OversightPolicy::Autonomous,
        );
        run.set_plan(Plan::new(
            "objective",
            vec![
                Task::new("a", "a"),
                Task::new("b", "b"),
                Task::new("c", "c"),
            ],
        ));
        RunLedger::new(Arc::new(StateStore::new(dir.path())), run)
    }

    #[tokio::test]
    async fn test_update_persists_before_publishing() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 10.0);

        ledger
            .update_worker("a", |w| w.transition(WorkerStatus::Running))
            .await
            .unwrap();

        let on_disk = ledger.store().get(&RunId::from("r1")).await.unwrap();
        assert_eq!(on_disk.worker("a").unwrap().status, WorkerStatus::Running);
        assert_eq!(
            ledger.snapshot().await.worker("a").unwrap().status,
            WorkerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_failed_update_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 10.0);
        let before = ledger.snapshot().await;

        let err = ledger
            .update_worker("a", |w| w.transition(WorkerStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTransition { .. }));
        assert_eq!(ledger.snapshot().await.workers, before.workers);

        assert!(ledger.update_worker("zzz", |_| Ok(())).await.is_err());
    }

    #[tokio::test]
    async fn test_aggregate_ceiling_skips_pending_workers() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir, 1.0);
        ledger
            .update_worker("a", |w| w.transition(WorkerStatus::Running))
            .await
            .unwrap();

        assert!(!ledger.record_cost("a", 0.4).await.unwrap());
        assert!(ledger.record_cost("a", 0.6).await.unwrap());

        let run = ledger.snapshot().await;
        assert_eq!(run.worker("a").unwrap().status, WorkerStatus::Running);
        assert_eq!(run.worker("b").unwrap().status, WorkerStatus::Skipped);
        assert_eq!(run.worker("c").unwrap().status, WorkerStatus::Skipped);
        assert!(run
            .worker("b")
            .unwrap()
            .skip_reason
            .as_deref()
            .unwrap()
            .contains("aggregate"));
        assert_eq!(run.cost.attempts, 2);
    }
}
