use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EntityKind, KernelState, TaskId, TaskStatus};

/// Kernel-wide error type spanning lifecycle, scheduling, authorization and
/// recovery failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: KernelState, to: KernelState },

    #[error("Queue full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} is already scheduled")]
    DuplicateTask(TaskId),

    #[error("Task {task_id} is terminal ({status})")]
    TaskTerminal { task_id: TaskId, status: TaskStatus },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Access denied for {entity_kind}:{entity_id} on {permission}: {reason}")]
    Unauthorized {
        entity_kind: EntityKind,
        entity_id: String,
        permission: String,
        reason: String,
    },

    #[error("Unknown permission: {0}")]
    PermissionNotFound(String),

    #[error("Permission {0} is already registered")]
    DuplicatePermission(String),

    #[error("No checkpoint for {entity_kind}:{entity_id}")]
    NoCheckpoint {
        entity_kind: EntityKind,
        entity_id: String,
    },

    #[error("Failure record not found: {0}")]
    FailureNotFound(String),

    #[error("Failure record {0} is already resolved")]
    AlreadyResolved(String),

    #[error("Event channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Why a single execution attempt of a task ended unsuccessfully.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("timeout after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("resource limit exceeded: {resource} {value:.1} > {limit:.1}")]
    LimitExceeded {
        resource: String,
        value: f64,
        limit: f64,
    },

    #[error("executor error: {0}")]
    Executor(String),

    #[error("killed")]
    Killed,

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl FailureReason {
    /// Failures that should never be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureReason::Killed | FailureReason::Unauthorized(_))
    }

    /// The snake_case tag the reason serializes under.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::LimitExceeded { .. } => "limit_exceeded",
            FailureReason::Executor(_) => "executor",
            FailureReason::Killed => "killed",
            FailureReason::Unauthorized(_) => "unauthorized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_are_distinguishable() {
        let reasons = [
            FailureReason::Timeout { after_ms: 50 }.to_string(),
            FailureReason::LimitExceeded {
                resource: "memory_mb".into(),
                value: 600.0,
                limit: 512.0,
            }
            .to_string(),
            FailureReason::Executor("boom".into()).to_string(),
            FailureReason::Killed.to_string(),
            FailureReason::Unauthorized("no matching policy".into()).to_string(),
        ];
        assert!(reasons[0].starts_with("timeout"));
        assert!(reasons[1].starts_with("resource limit exceeded: memory_mb"));
        assert!(reasons[2].contains("boom"));
        assert_eq!(reasons[3], "killed");
        assert!(reasons[4].starts_with("unauthorized"));
    }

    #[test]
    fn failure_reasons_serialize_with_their_kind() {
        let json = serde_json::to_value(FailureReason::Executor("boom".into())).unwrap();
        assert_eq!(json["kind"], "executor");
        assert_eq!(json["detail"], "boom");
        let back: FailureReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, FailureReason::Executor("boom".into()));
        let json = serde_json::to_value(FailureReason::Killed).unwrap();
        assert_eq!(json["kind"], "killed");
    }

    #[test]
    fn kernel_error_display() {
        let err = KernelError::InvalidTransition {
            from: KernelState::Init,
            to: KernelState::Paused,
        };
        assert_eq!(err.to_string(), "Invalid transition: init -> paused");

        let err = KernelError::QueueFull { capacity: 2 };
        assert!(err.to_string().contains("capacity 2"));
    }

    #[test]
    fn only_kill_and_denial_are_terminal() {
        assert!(FailureReason::Killed.is_terminal());
        assert!(FailureReason::Unauthorized("x".into()).is_terminal());
        assert!(!FailureReason::Timeout { after_ms: 1 }.is_terminal());
        assert!(!FailureReason::Executor("x".into()).is_terminal());
        assert_eq!(FailureReason::Timeout { after_ms: 1 }.kind(), "timeout");
    }
}
