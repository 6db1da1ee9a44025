//! # swarm-core
//!
//! Core types for swarm, a parallel coding-agent orchestrator.
//!
//! A run decomposes one objective into a flat [`Plan`] of [`Task`]s. Each task
//! is executed by one worker in its own worktree; the workers' branches are
//! then merged in plan order and delivered behind an oversight policy.
//!
//! ## Layout
//!
//! - [`Run`] / [`WorkerRecord`]: the durable lifecycle records
//! - [`Note`] / [`Message`] / [`PeerStatus`]: coordination artifacts
//! - [`SwarmConfig`]: repository-level `.swarm/config.toml`
//! - [`SwarmError`]: the error taxonomy shared by every crate
//! - [`fail_open`]: helpers for advisory side channels
//! - [`fsutil`]: atomic file replacement

mod artifact;
pub mod config;
mod error;
pub mod fail_open;
pub mod fsutil;
mod run;
mod types;

pub use artifact::{Message, MessageKind, Note, PeerState, PeerStatus};
pub use config::{
    AgentConfig, CommandRule, DeliveryMode, IntegrationConfig, OversightConfig, RunLimits,
    SwarmConfig, WorktreeConfig, SWARM_DIR,
};
pub use error::{ErrorKind, Result, SwarmError};
pub use run::*;
pub use types::*;
