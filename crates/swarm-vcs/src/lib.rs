//! # swarm-vcs
//!
//! Git plumbing for swarm.
//!
//! This crate provides:
//! - Git command execution abstraction ([`VcsExecutor`]) with a scripted mock
//! - Lock-contention retry with exponential backoff
//! - Worktree-per-worker isolation ([`WorktreeManager`])
//! - Merge / conflict detection and build/verification commands

mod command;
mod git;
mod retry;
mod verify;
mod worktree;

pub use command::{
    CommandRunner, GitCommand, MockVcsExecutor, ProcessRunner, VcsCall, VcsExecutor, VcsOutput,
};
pub use git::{MergeOutcome, Repo};
pub use retry::{is_lock_contention, LockRetry};
pub use verify::run_check;
pub use worktree::{
    branch_name, CleanupReport, Workspace, WorktreeManager, BRANCH_PREFIX, INTEGRATION_WORKER,
};
