//! `steward-kernel` – lifecycle, scheduling, authorization and recovery.
//!
//! Every component here is a plain `&mut self` state holder that publishes
//! what it does on the shared [`EventBus`][steward_middleware::EventBus].
//! The runtime crate decides how they are shared and driven.
//!
//! # Modules
//!
//! - [`state_machine`] – [`StateMachine`]: guards the
//!   init/active/paused/shutdown lifecycle and records its history.
//! - [`scheduler`] – [`Scheduler`]: priority queue with dependency
//!   tracking, retries, aging and a logical clock.
//! - [`security`] – [`SecurityManager`]: permission registry, policy engine
//!   with rate limits, and the audit trail.
//! - [`recovery`] – [`RecoveryManager`]: failure detection (heartbeats,
//!   error rates), recovery actions and checkpoints.

pub mod recovery;
pub mod scheduler;
pub mod security;
pub mod state_machine;

pub use recovery::{
    Checkpoint, CheckpointStore, DetectorConfig, FailureDetector, FailureFilter, FailureRecord,
    RecoveryConfig, RecoveryExecutor, RecoveryManager, RecoveryOutcome, RecoveryStatus,
};
pub use scheduler::{FailDisposition, Scheduler, SchedulerConfig, SchedulerStats};
pub use security::{
    AccessDecision, AuditEntry, AuditFilter, AuditLog, AuditSummary, Permission,
    PermissionCategory, PermissionRegistry, Policy, PolicyEngine, RiskLevel, SecurityManager,
};
pub use state_machine::{StateMachine, StateTransition};
