//! Durable run state
//!
//! Layout under `.swarm/`:
//!
//! ```text
//! active.json          singleton pointer to the active run
//! runs/<run_id>.json   one snapshot per run, kept after archiving
//! ```
//!
//! Every write is an atomic replace. The active pointer is claimed with a
//! hard link, which fails if another run already holds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use swarm_core::fsutil::{atomic_write_json, is_tmp_file};
use swarm_core::{
    Result, RetryDecision, Run, RunId, SwarmError, WorkerStatus, SWARM_DIR,
};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Contents of `active.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActivePointer {
    run_id: RunId,
    since: DateTime<Utc>,
}

/// File-backed store of run records
#[derive(Debug, Clone)]
pub struct StateStore {
    swarm_dir: PathBuf,
}

impl StateStore {
    /// Store rooted at an explicit `.swarm` directory
    pub fn new(swarm_dir: impl Into<PathBuf>) -> Self {
        Self {
            swarm_dir: swarm_dir.into(),
        }
    }

    /// Store for a repository (`<repo>/.swarm`)
    pub fn for_repo(repo_root: &Path) -> Self {
        Self::new(repo_root.join(SWARM_DIR))
    }

    pub fn swarm_dir(&self) -> &Path {
        &self.swarm_dir
    }

    fn active_path(&self) -> PathBuf {
        self.swarm_dir.join("active.json")
    }

    fn runs_dir(&self) -> PathBuf {
        self.swarm_dir.join("runs")
    }

    pub fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(format!("{}.json", run_id))
    }

    /// Id of the active run, if any
    pub async fn active_run_id(&self) -> Result<Option<RunId>> {
        let path = self.active_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let pointer: ActivePointer = serde_json::from_str(&content)?;
        Ok(Some(pointer.run_id))
    }

    /// The active run exactly as last persisted
    pub async fn load_raw(&self) -> Result<Option<Run>> {
        match self.active_run_id().await? {
            Some(run_id) => Ok(Some(self.get(&run_id).await?)),
            None => Ok(None),
        }
    }

    /// The active run, reconciled after a possible unclean shutdown
    ///
    /// Reconciliation changes are persisted before the run is returned.
    pub async fn load(&self) -> Result<Option<Run>> {
        let Some(mut run) = self.load_raw().await? else {
            return Ok(None);
        };
        if reconcile(&mut run) {
            info!("Reconciled interrupted workers of run {}", run.run_id);
            self.save(&run).await?;
        }
        Ok(Some(run))
    }

    /// Atomically replace the run's snapshot
    pub async fn save(&self, run: &Run) -> Result<()> {
        atomic_write_json(&self.run_path(&run.run_id), run).await?;
        debug!("Saved run {} ({})", run.run_id, run.status);
        Ok(())
    }

    /// Persist a new run and make it the active one
    ///
    /// Fails with [`SwarmError::RunConflict`] when a different run is active.
    /// A run that loses the claim leaves no record behind.
    pub async fn begin(&self, run: &Run) -> Result<()> {
        if let Some(active) = self.active_run_id().await? {
            if active == run.run_id {
                return self.save(run).await;
            }
            return Err(SwarmError::RunConflict {
                active_run: active.to_string(),
            });
        }

        self.save(run).await?;

        let pointer = ActivePointer {
            run_id: run.run_id.clone(),
            since: Utc::now(),
        };
        let tmp = self
            .swarm_dir
            .join(format!(".active.{}.tmp", Uuid::new_v4().simple()));
        atomic_write_json(&tmp, &pointer).await?;

        // hard_link refuses to replace an existing pointer
        let claimed = fs::hard_link(&tmp, self.active_path()).await;
        let _ = fs::remove_file(&tmp).await;

        let Err(e) = claimed else {
            info!("Run {} is now active", run.run_id);
            return Ok(());
        };

        if let Err(remove) = fs::remove_file(self.run_path(&run.run_id)).await {
            warn!(
                "Failed to remove unclaimed run record {}: {}",
                run.run_id, remove
            );
        }
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(e.into());
        }
        let active = self
            .active_run_id()
            .await?
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(SwarmError::RunConflict { active_run: active })
    }

    /// Clear the active pointer, keeping the run's record
    pub async fn archive(&self, run: &mut Run) -> Result<()> {
        run.archived_at = Some(Utc::now());
        run.touch();
        self.save(run).await?;

        if self.active_run_id().await?.as_ref() == Some(&run.run_id) {
            fs::remove_file(self.active_path()).await?;
        }
        info!("Archived run {} ({})", run.run_id, run.status);
        Ok(())
    }

    /// Any run by id, active or archived
    pub async fn get(&self, run_id: &RunId) -> Result<Run> {
        let path = self.run_path(run_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SwarmError::RunNotFound(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Every recorded run, oldest first (unreadable records are skipped)
    pub async fn list(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(self.runs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_tmp_file(&path) || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .await
                .map_err(SwarmError::from)
                .and_then(|content| serde_json::from_str::<Run>(&content).map_err(Into::into));
            match parsed {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping unreadable run record {}: {}", path.display(), e),
            }
        }

        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    /// The active run, or else the most recently created one
    pub async fn latest(&self) -> Result<Option<Run>> {
        if let Some(run) = self.load_raw().await? {
            return Ok(Some(run));
        }
        Ok(self.list().await?.pop())
    }
}

/// Re-classify workers left mid-attempt by an unclean shutdown
///
/// Running workers become Retrying when their worktree survived and Pending
/// otherwise. Failed workers that still have attempts left are moved on to
/// Retrying/Escalated. Returns whether anything changed.
pub fn reconcile(run: &mut Run) -> bool {
    let limits = run.limits.clone();
    let mut changed = false;

    for worker in &mut run.workers {
        match worker.status {
            WorkerStatus::Running => {
                let worktree_exists = worker
                    .worktree_path
                    .as_ref()
                    .map_or(false, |path| path.exists());
                worker.reconcile_interrupted(worktree_exists);
                debug!(
                    "Worker {} was running; now {}",
                    worker.worker_id, worker.status
                );
                changed = true;
            }
            WorkerStatus::Failed => {
                let next = match worker.retry_decision(&limits) {
                    RetryDecision::Exhausted => continue,
                    RetryDecision::Retry => WorkerStatus::Retrying,
                    RetryDecision::Escalate => WorkerStatus::Escalated,
                };
                if worker.transition(next).is_ok() {
                    changed = true;
                }
            }
            _ => {}
        }
    }

    if changed {
        run.touch();
    }
    changed
}
