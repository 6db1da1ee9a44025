//! Git operations used by the worktree manager and the integrator

use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_core::{Result, SwarmError};
use tracing::{debug, warn};

use crate::command::{VcsExecutor, VcsOutput};
use crate::retry::LockRetry;

/// Result of merging one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    Conflicted { files: Vec<String> },
}

/// Identity used for commits swarm makes itself
const COMMIT_IDENTITY: [&str; 4] = ["-c", "user.name=swarm", "-c", "user.email=swarm@localhost"];

/// Git operations over a [`VcsExecutor`], with lock-contention retry
pub struct Repo<E: VcsExecutor + ?Sized> {
    executor: Arc<E>,
    retry: LockRetry,
}

impl<E: VcsExecutor + ?Sized> Clone for Repo<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            retry: self.retry,
        }
    }
}

impl<E: VcsExecutor + ?Sized> Repo<E> {
    pub fn new(executor: Arc<E>, retry: LockRetry) -> Self {
        Self { executor, retry }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn root(&self) -> &PathBuf {
        self.executor.repo_root()
    }

    /// Run with lock retry; the output may be unsuccessful
    pub async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<VcsOutput> {
        self.retry.run(self.executor.as_ref(), dir, args).await
    }

    /// Run with lock retry and fail on a non-zero exit
    pub async fn run_checked(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let output = self.run(dir, args).await?;
        if !output.success {
            return Err(SwarmError::VcsCommand(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Current branch of the main checkout
    pub async fn current_branch(&self) -> Result<String> {
        let out = self
            .run_checked(None, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        let output = self
            .run(None, &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(output.success)
    }

    /// Branches matching a glob such as `swarm/<run>/*`
    pub async fn list_branches(&self, pattern: &str) -> Result<Vec<String>> {
        let output = self
            .run(
                None,
                &["branch", "--list", pattern, "--format=%(refname:short)"],
            )
            .await?;
        Ok(output.lines())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(None, &["branch", "-D", branch]).await?;
        if !output.success {
            debug!("branch -D {} failed: {}", branch, output.stderr.trim());
        }
        Ok(output.success)
    }

    /// Add a worktree at `path`, creating `branch` from `base` when given
    pub async fn worktree_add(&self, path: &Path, branch: &str, base: Option<&str>) -> Result<()> {
        let path_str = path_str(path)?;
        let args: Vec<&str> = match base {
            Some(base) => vec!["worktree", "add", "-b", branch, path_str, base],
            None => vec!["worktree", "add", path_str, branch],
        };
        let output = self.run(None, &args).await?;
        if !output.success {
            return Err(SwarmError::Workspace(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path_str(path)?;
        let output = self
            .run(None, &["worktree", "remove", "--force", path_str])
            .await?;
        if !output.success {
            return Err(SwarmError::Workspace(format!(
                "git worktree remove {} failed: {}",
                path.display(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Paths of every registered worktree
    pub async fn worktree_list(&self) -> Result<Vec<PathBuf>> {
        let out = self
            .run_checked(None, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        let output = self.run(None, &["worktree", "prune"]).await?;
        if !output.success {
            warn!("git worktree prune failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    /// Toggle automatic gc while workers share the object store
    pub async fn set_auto_gc(&self, enabled: bool) -> Result<()> {
        let output = if enabled {
            self.run(None, &["config", "--unset", "gc.auto"]).await?
        } else {
            self.run(None, &["config", "gc.auto", "0"]).await?
        };
        if !output.success {
            debug!("gc.auto toggle failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    /// Merge `branch` into the checkout at `dir` with a merge commit
    ///
    /// A conflicted merge is left in progress so the caller can resolve or abort it.
    pub async fn merge(&self, dir: &Path, branch: &str, message: &str) -> Result<MergeOutcome> {
        let output = self
            .run(Some(dir), &["merge", "--no-ff", "-m", message, branch])
            .await?;
        if output.success {
            return Ok(MergeOutcome::Clean);
        }

        let files = self.conflicted_files(dir).await?;
        if files.is_empty() {
            return Err(SwarmError::VcsCommand(format!(
                "git merge {} failed: {}",
                branch,
                first_non_empty(&output.stderr, &output.stdout)
            )));
        }
        Ok(MergeOutcome::Conflicted { files })
    }

    pub async fn merge_abort(&self, dir: &Path) -> Result<()> {
        let output = self.run(Some(dir), &["merge", "--abort"]).await?;
        if !output.success {
            warn!("git merge --abort failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    /// Point the checkout at `dir` to `rev`, discarding local changes
    pub async fn reset_hard(&self, dir: &Path, rev: &str) -> Result<()> {
        self.run_checked(Some(dir), &["reset", "--hard", rev]).await?;
        Ok(())
    }

    /// Files with unresolved conflicts in the checkout at `dir`
    pub async fn conflicted_files(&self, dir: &Path) -> Result<Vec<String>> {
        let output = self
            .run(Some(dir), &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(output.lines())
    }

    /// Diff of `to` against its merge base with `from`, optionally limited to paths
    pub async fn diff_range(
        &self,
        dir: &Path,
        from: &str,
        to: &str,
        paths: &[String],
    ) -> Result<String> {
        let range = format!("{}...{}", from, to);
        let mut args = vec!["diff", range.as_str()];
        if !paths.is_empty() {
            args.push("--");
            args.extend(paths.iter().map(String::as_str));
        }
        let output = self.run(Some(dir), &args).await?;
        Ok(output.stdout)
    }

    /// Files changed on `HEAD` of `dir` since it diverged from `base`,
    /// falling back to uncommitted changes
    pub async fn changed_files(&self, dir: &Path, base: &str) -> Result<Vec<String>> {
        let range = format!("{}...HEAD", base);
        let committed = self
            .run(Some(dir), &["diff", "--name-only", &range])
            .await?;
        let files = committed.lines();
        if !files.is_empty() {
            return Ok(files);
        }
        let pending = self.run(Some(dir), &["diff", "--name-only", "HEAD"]).await?;
        Ok(pending.lines())
    }

    /// Commit everything left uncommitted in `dir`; returns whether a commit was made
    pub async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool> {
        let status = self
            .run_checked(Some(dir), &["status", "--porcelain"])
            .await?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        self.run_checked(Some(dir), &["add", "-A"]).await?;
        self.commit(dir, message).await?;
        Ok(true)
    }

    pub async fn add(&self, dir: &Path, files: &[String]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend(files.iter().map(String::as_str));
        self.run_checked(Some(dir), &args).await?;
        Ok(())
    }

    /// Commit the index (also concludes an in-progress merge)
    pub async fn commit(&self, dir: &Path, message: &str) -> Result<()> {
        let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
        args.extend(["commit", "--no-verify", "-m", message]);
        self.run_checked(Some(dir), &args).await?;
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        SwarmError::Workspace(format!(
            "worktree path contains non-UTF-8 characters: {}",
            path.display()
        ))
    })
}

fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.trim().is_empty() {
        b.trim()
    } else {
        a.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockVcsExecutor;
    use std::time::Duration;

    fn repo(executor: MockVcsExecutor) -> Repo<MockVcsExecutor> {
        Repo::new(Arc::new(executor), LockRetry::new(1, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_merge_clean() {
        let executor = MockVcsExecutor::new();
        let repo = repo(executor.clone());

        let outcome = repo
            .merge(Path::new("/wt"), "swarm/r/a", "Merge a")
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(
            executor.calls_matching("merge"),
            vec!["merge --no-ff -m Merge a swarm/r/a"]
        );
    }

    #[tokio::test]
    async fn test_merge_conflict_reports_files() {
        let executor = MockVcsExecutor::new()
            .with_prefix("merge --no-ff", VcsOutput::failed("CONFLICT (content)"))
            .with_response(
                "diff --name-only --diff-filter=U",
                VcsOutput::ok("src/lib.rs\nREADME.md\n"),
            );
        let repo = repo(executor);

        let outcome = repo
            .merge(Path::new("/wt"), "swarm/r/b", "Merge b")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflicted {
                files: vec!["src/lib.rs".to_string(), "README.md".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_merge_failure_without_conflicts_is_error() {
        let executor = MockVcsExecutor::new()
            .with_prefix("merge --no-ff", VcsOutput::failed("not something we can merge"));
        let repo = repo(executor);

        let err = repo
            .merge(Path::new("/wt"), "swarm/r/missing", "Merge")
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::VcsCommand(_)));
    }

    #[tokio::test]
    async fn test_changed_files_falls_back_to_uncommitted() {
        let executor = MockVcsExecutor::new()
            .with_response("diff --name-only main...HEAD", VcsOutput::ok(""))
            .with_response("diff --name-only HEAD", VcsOutput::ok("a.txt\n"));
        let repo = repo(executor);

        let files = repo.changed_files(Path::new("/wt"), "main").await.unwrap();
        assert_eq!(files, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_commit_all_skips_clean_tree() {
        let executor = MockVcsExecutor::new().with_response("status --porcelain", VcsOutput::ok(""));
        let repo = repo(executor.clone());

        assert!(!repo.commit_all(Path::new("/wt"), "msg").await.unwrap());
        assert!(executor.calls_matching("add").is_empty());
    }

    #[tokio::test]
    async fn test_worktree_list_parses_porcelain() {
        let executor = MockVcsExecutor::new().with_response(
            "worktree list --porcelain",
            VcsOutput::ok(
                "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo/.swarm-worktrees/r/a\nHEAD def\n",
            ),
        );
        let repo = repo(executor);

        let paths = repo.worktree_list().await.unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/repo"),
                PathBuf::from("/repo/.swarm-worktrees/r/a")
            ]
        );
    }
}
