//! Worktree management for worker isolation
//!
//! Every worker gets its own git worktree under
//! `<worktrees_dir>/<run_id>/<worker_id>` on the branch
//! `swarm/<run_id>/<worker_id>`. Worktrees are created lazily and only
//! removed by an explicit [`WorktreeManager::cleanup`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_core::{is_safe_identifier, Result, RunId, SwarmError, WorktreeConfig};
use tracing::{debug, info, warn};

use crate::command::VcsExecutor;
use crate::git::Repo;
use crate::retry::LockRetry;

/// Prefix of every branch swarm creates
pub const BRANCH_PREFIX: &str = "swarm";

/// Worker id reserved for the integration worktree
pub const INTEGRATION_WORKER: &str = "integration";

/// An isolated, branch-scoped working copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub run_id: RunId,
    pub worker_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub worktrees_removed: usize,
    pub branches_deleted: usize,
}

/// Branch name for a worker, deterministic in `(run_id, worker_id)`
pub fn branch_name(run_id: &RunId, worker_id: &str) -> String {
    format!("{}/{}/{}", BRANCH_PREFIX, run_id, worker_id)
}

/// Manages git worktrees for worker isolation
pub struct WorktreeManager<E: VcsExecutor + ?Sized> {
    repo: Repo<E>,
    worktrees_dir: PathBuf,
}

impl<E: VcsExecutor + ?Sized> Clone for WorktreeManager<E> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            worktrees_dir: self.worktrees_dir.clone(),
        }
    }
}

impl<E: VcsExecutor + ?Sized> WorktreeManager<E> {
    pub fn new(executor: Arc<E>, config: &WorktreeConfig) -> Self {
        let worktrees_dir = if config.dir.is_absolute() {
            config.dir.clone()
        } else {
            executor.repo_root().join(&config.dir)
        };
        Self {
            repo: Repo::new(executor, LockRetry::from_config(config)),
            worktrees_dir,
        }
    }

    /// Underlying git operations
    pub fn repo(&self) -> &Repo<E> {
        &self.repo
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    pub fn branch_name(&self, run_id: &RunId, worker_id: &str) -> String {
        branch_name(run_id, worker_id)
    }

    pub fn worktree_path(&self, run_id: &RunId, worker_id: &str) -> PathBuf {
        self.run_dir(run_id).join(worker_id)
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.worktrees_dir.join(run_id.as_str())
    }

    /// The workspace `acquire` would produce, without touching the repo
    pub fn workspace(&self, run_id: &RunId, worker_id: &str) -> Workspace {
        Workspace {
            run_id: run_id.clone(),
            worker_id: worker_id.to_string(),
            path: self.worktree_path(run_id, worker_id),
            branch: self.branch_name(run_id, worker_id),
        }
    }

    /// Whether the worker's worktree directory is present on disk
    pub fn exists(&self, run_id: &RunId, worker_id: &str) -> bool {
        self.worktree_path(run_id, worker_id).exists()
    }

    /// Create (or reattach to) the worker's worktree on its own branch
    ///
    /// Idempotent: an existing worktree is reused, and an existing branch
    /// is checked out instead of being recreated from `base_ref`.
    pub async fn acquire(&self, run_id: &RunId, worker_id: &str, base_ref: &str) -> Result<Workspace> {
        if !is_safe_identifier(worker_id) {
            return Err(SwarmError::Validation(format!(
                "worker id {:?} is not usable as a branch name",
                worker_id
            )));
        }

        let path = self.worktree_path(run_id, worker_id);
        let branch = self.branch_name(run_id, worker_id);
        let workspace = Workspace {
            run_id: run_id.clone(),
            worker_id: worker_id.to_string(),
            path: path.clone(),
            branch: branch.clone(),
        };

        if path.join(".git").exists() {
            debug!("Reusing worktree for {} at {}", worker_id, path.display());
            return Ok(workspace);
        }

        if path.exists() {
            warn!("Removing stale worktree directory {}", path.display());
            tokio::fs::remove_dir_all(&path).await?;
            self.repo.worktree_prune().await?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SwarmError::Workspace(format!(
                    "Failed to create worktree directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        if self.repo.branch_exists(&branch).await? {
            self.repo.worktree_add(&path, &branch, None).await?;
        } else {
            self.repo.worktree_add(&path, &branch, Some(base_ref)).await?;
        }

        info!(
            "Created worktree for {} at {} (branch {})",
            worker_id,
            path.display(),
            branch
        );
        Ok(workspace)
    }

    /// Remove a worktree (the branch is kept)
    ///
    /// A worktree that is already gone is not an error.
    pub async fn release(&self, workspace: &Workspace) -> Result<()> {
        self.remove_worktree(&workspace.path).await.map(|_| ())
    }

    /// Returns whether anything was on disk to remove
    async fn remove_worktree(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        info!("Removing worktree {}", path.display());
        self.repo.worktree_remove(path).await?;
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(true)
    }

    /// Remove every worktree and branch belonging to a run
    pub async fn cleanup(&self, run_id: &RunId) -> Result<CleanupReport> {
        let pattern = format!("{}/{}/*", BRANCH_PREFIX, run_id);
        self.remove_under(&self.run_dir(run_id), &pattern).await
    }

    /// Remove every swarm worktree and branch, from any run
    pub async fn cleanup_all(&self) -> Result<CleanupReport> {
        let pattern = format!("{}/*", BRANCH_PREFIX);
        let dir = self.worktrees_dir.clone();
        self.remove_under(&dir, &pattern).await
    }

    async fn remove_under(&self, dir: &Path, branch_pattern: &str) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for path in self.repo.worktree_list().await? {
            if !path.starts_with(dir) {
                continue;
            }
            match self.remove_worktree(&path).await {
                Ok(true) => report.worktrees_removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to remove worktree {}: {}", path.display(), e),
            }
        }

        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        self.repo.worktree_prune().await?;

        for branch in self.repo.list_branches(branch_pattern).await? {
            if self.repo.delete_branch(&branch).await? {
                report.branches_deleted += 1;
            }
        }

        info!(
            "Cleanup removed {} worktrees and {} branches",
            report.worktrees_removed, report.branches_deleted
        );
        Ok(report)
    }

    /// Files the workspace's branch changed relative to `base_ref`
    pub async fn changed_files(&self, workspace: &Workspace, base_ref: &str) -> Result<Vec<String>> {
        self.repo.changed_files(&workspace.path, base_ref).await
    }

    /// Diff of the workspace's branch against `base_ref`
    pub async fn diff(&self, workspace: &Workspace, base_ref: &str) -> Result<String> {
        self.repo
            .diff_range(&workspace.path, base_ref, "HEAD", &[])
            .await
    }

    /// Suspend automatic gc while workers run in parallel
    pub async fn disable_gc(&self) -> Result<()> {
        self.repo.set_auto_gc(false).await
    }

    pub async fn restore_gc(&self) -> Result<()> {
        self.repo.set_auto_gc(true).await
    }
}
