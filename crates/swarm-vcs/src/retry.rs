//! Lock-contention retry for git operations
//!
//! Concurrent workers share one object store, so `worktree add`, branch
//! creation and ref updates can collide on `index.lock` / ref locks. Those
//! failures are transient; everything else is returned to the caller as-is.

use std::path::Path;
use std::time::Duration;
use swarm_core::{Result, SwarmError, WorktreeConfig};
use tracing::debug;

use crate::command::{VcsExecutor, VcsOutput};

/// Whether a failed git command lost a lock race
pub fn is_lock_contention(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains(".lock") || stderr.contains("cannot lock") || stderr.contains("unable to lock")
}

/// Bounded exponential backoff for lock-contended commands
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    retries: u32,
    backoff: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self::from_config(&WorktreeConfig::default())
    }
}

impl LockRetry {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    pub fn from_config(config: &WorktreeConfig) -> Self {
        Self::new(config.lock_retries, Duration::from_millis(config.lock_backoff_ms))
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// Run a command, retrying while it fails on lock contention
    ///
    /// Returns the first non-contended output (successful or not). When every
    /// attempt lost the lock race the result is a [`SwarmError::Workspace`].
    pub async fn run<E: VcsExecutor + ?Sized>(
        &self,
        executor: &E,
        dir: Option<&Path>,
        args: &[&str],
    ) -> Result<VcsOutput> {
        let mut last_stderr = String::new();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = self.delay(attempt);
                debug!(
                    "git lock contention, retrying in {:?} (retry {}/{})",
                    delay, attempt, self.retries
                );
                tokio::time::sleep(delay).await;
            }

            let output = match dir {
                Some(dir) => executor.exec_in(dir, args).await?,
                None => executor.exec(args).await?,
            };

            if output.success || !is_lock_contention(&output.stderr) {
                return Ok(output);
            }
            last_stderr = output.stderr;
        }

        Err(SwarmError::Workspace(format!(
            "git {} failed after {} retries (lock contention): {}",
            args.join(" "),
            self.retries,
            last_stderr.trim()
        )))
    }
}
