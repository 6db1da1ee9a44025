//! The conflict-resolution capability

use async_trait::async_trait;
use std::path::PathBuf;
use swarm_core::{Result, RunId, WorkerId};
use tokio_util::sync::CancellationToken;

/// A conflicted file as left by the merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFile {
    pub path: String,
    /// Working-tree content including the raw conflict markers
    pub content: String,
}

/// Full context of one conflicted merge
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub run_id: RunId,
    /// Already-merged worker the conflict is attributed to
    pub left: WorkerId,
    /// Worker whose branch was being merged
    pub right: WorkerId,
    pub left_diff: String,
    pub right_diff: String,
    pub files: Vec<ConflictFile>,
    /// Coordination summary of the run
    pub coordination: String,
    /// Integration worktree holding the in-progress merge
    pub workspace: PathBuf,
}

/// Resolved content for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: String,
    pub content: String,
}

/// Given both diffs and the raw conflict markers, produce resolved files
///
/// Must return one entry per conflicted file, free of conflict markers, or fail.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        context: &ConflictContext,
        cancel: CancellationToken,
    ) -> Result<Vec<ResolvedFile>>;
}

/// Whether text still contains git conflict markers
pub fn has_conflict_markers(content: &str) -> bool {
    content.lines().any(|line| {
        line.starts_with("<<<<<<< ") || line.starts_with(">>>>>>> ") || line == "======="
    })
}
