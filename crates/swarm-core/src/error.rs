//! Unified error types for swarm

use thiserror::Error;

/// Classification of a failure, used for retry decisions and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// VCS-level workspace failure (already retried internally)
    Workspace,
    /// Another run is active, or a merge conflict could not be resolved
    Conflict,
    /// Agent-reported failure of one attempt
    TaskFailure,
    /// No observable progress within the attempt's progress timeout
    StallTimeout,
    /// A per-worker or aggregate cost ceiling was crossed
    CostCeilingExceeded,
    /// Malformed plan, task, configuration or argument
    Validation,
    /// Corrupt coordination artifact (never fatal)
    CoordinationArtifact,
    /// The run was cancelled
    Cancelled,
    /// Anything else (I/O, serialization, VCS plumbing)
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Workspace => "workspace",
            Self::Conflict => "conflict",
            Self::TaskFailure => "task-failure",
            Self::StallTimeout => "stall-timeout",
            Self::CostCeilingExceeded => "cost-ceiling-exceeded",
            Self::Validation => "validation",
            Self::CoordinationArtifact => "coordination-artifact",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Unified error type for all swarm operations
#[derive(Error, Debug)]
pub enum SwarmError {
    // Workspace / VCS errors
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("VCS command failed: {0}")]
    VcsCommand(String),

    // Run-level conflicts
    #[error("Run conflict: run {active_run} is already active; resume, approve or abort it first")]
    RunConflict { active_run: String },

    #[error("Merge conflict in run {run_id}: workers {left} and {right} conflict on [{}]", .files.join(", "))]
    MergeConflict {
        run_id: String,
        left: String,
        right: String,
        files: Vec<String>,
    },

    // Worker attempt failures
    #[error("Task failure in run {run_id}, worker {worker_id}: {message}")]
    TaskFailure {
        run_id: String,
        worker_id: String,
        message: String,
    },

    #[error("Stall timeout in run {run_id}, worker {worker_id}: no progress for {idle_secs}s")]
    StallTimeout {
        run_id: String,
        worker_id: String,
        idle_secs: u64,
    },

    #[error("Cost ceiling exceeded in run {run_id} ({scope}): spent ${spent:.2} of ${ceiling:.2}")]
    CostCeilingExceeded {
        run_id: String,
        scope: String,
        spent: f64,
        ceiling: f64,
    },

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Coordination errors
    #[error("Coordination artifact {path} ignored: {reason}")]
    CoordinationArtifact { path: String, reason: String },

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    // State errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("No active run")]
    NoActiveRun,

    #[error("Invalid transition for worker {worker_id}: {from} -> {to}")]
    InvalidTransition {
        worker_id: String,
        from: String,
        to: String,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl SwarmError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Workspace(_) => ErrorKind::Workspace,
            Self::RunConflict { .. } | Self::MergeConflict { .. } => ErrorKind::Conflict,
            Self::TaskFailure { .. } | Self::Agent(_) => ErrorKind::TaskFailure,
            Self::StallTimeout { .. } => ErrorKind::StallTimeout,
            Self::CostCeilingExceeded { .. } => ErrorKind::CostCeilingExceeded,
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::CoordinationArtifact { .. } => ErrorKind::CoordinationArtifact,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::VcsCommand(_)
            | Self::RunNotFound(_)
            | Self::NoActiveRun
            | Self::InvalidTransition { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias using SwarmError
pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_conflict_names_both_workers() {
        let err = SwarmError::MergeConflict {
            run_id: "20260101-000000-abc123".to_string(),
            left: "worker-1".to_string(),
            right: "worker-2".to_string(),
            files: vec!["src/lib.rs".to_string()],
        };

        let message = err.to_string();
        assert!(message.contains("20260101-000000-abc123"));
        assert!(message.contains("worker-1"));
        assert!(message.contains("worker-2"));
        assert!(message.contains("src/lib.rs"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SwarmError::RunConflict {
                active_run: "r1".into()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            SwarmError::Validation("empty plan".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SwarmError::Workspace("lock".into()).kind(),
            ErrorKind::Workspace
        );
    }
}
