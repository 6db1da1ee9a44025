//! # swarm-orchestrator
//!
//! Parallel agent orchestration engine for swarm.
//!
//! This crate provides:
//! - Durable run state with a single active run per repository
//! - A file-backed coordination bus (notes, messages, status)
//! - Per-worker lifecycle control: retries, escalation, stall detection
//! - Deterministic plan-order integration with conflict resolution
//! - Policy-driven oversight checkpoints and delivery

mod coordination;
mod delivery;
mod integrator;
mod ledger;
mod lifecycle;
mod orchestrator;
mod oversight;
mod plan;
mod session;
mod store;

pub use coordination::{CoordinationBus, WorkerChannel};
pub use delivery::{delivery_for, BranchDelivery, Delivery, GhPrDelivery};
pub use integrator::{attribute_conflict, Integrator};
pub use ledger::RunLedger;
pub use lifecycle::LifecycleController;
pub use orchestrator::{Capabilities, Orchestrator};
pub use oversight::{checkpoint_summary, Approver, GateDecision, NoApprover, OversightGate};
pub use plan::validate_plan;
pub use session::{SessionEvent, SessionLog, SessionRecord};
pub use store::{reconcile, StateStore};
