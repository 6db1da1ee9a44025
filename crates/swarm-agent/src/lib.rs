//! # swarm-agent
//!
//! Capability interfaces the orchestration engine consumes, plus a subprocess
//! backend for a coding-agent CLI.
//!
//! The engine never performs reasoning itself. It talks to:
//! - [`AgentCapability`]: executes one task attempt in a worktree
//! - [`PlanningCapability`]: decomposes an objective into a plan
//! - [`ConflictResolver`]: resolves a conflicted merge
//! - [`ReviewCapability`]: semantic review and fix of the integrated result
//!
//! Shell commands agents attempt are screened by a [`CommandGuard`].
//!
//! Agents reach their peers through a [`PeerChannel`] and prove liveness
//! through a [`ProgressReporter`].

mod capability;
mod cli_agent;
mod guards;
mod peer;
mod planner;
mod progress;
mod resolver;
mod review;

pub use capability::{objective_with_context, AgentCapability, AgentOutcome, AgentRequest};
pub use cli_agent::{
    extract_json_object, parse_directives, parse_stream_line, ClaudeCli, Directive, StreamEvent,
};
pub use guards::{Blocked, CommandGuard};
pub use peer::PeerChannel;
pub use planner::PlanningCapability;
pub use progress::{Progress, ProgressReceiver, ProgressReporter};
pub use resolver::{has_conflict_markers, ConflictContext, ConflictFile, ConflictResolver, ResolvedFile};
pub use review::{ReviewCapability, ReviewContext};

/// Re-exported so capability implementors share the engine's token type
pub use tokio_util::sync::CancellationToken;
