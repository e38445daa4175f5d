//! Event envelope and payloads routed over the kernel event bus.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EntityKind, FailureReason, KernelState, TaskId};

/// Unified event wrapper for the kernel event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"steward-kernel::scheduler"`
    pub source: String,
    pub payload: EventPayload,
}

impl KernelEvent {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Final or live resource figures for one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub peak_cpu_percent: f32,
    pub peak_memory_mb: f64,
    pub elapsed_ms: u64,
}

/// Which aggregate resource a pressure event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => f.write_str("cpu"),
            ResourceKind::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Warning,
    Critical,
}

/// Category of a detected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Crash,
    Timeout,
    Error,
    ResourceExhaustion,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Crash => "crash",
            FailureKind::Timeout => "timeout",
            FailureKind::Error => "error",
            FailureKind::ResourceExhaustion => "resource_exhaustion",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Restart,
    Reload,
    Skip,
    Escalate,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryAction::Restart => "restart",
            RecoveryAction::Reload => "reload",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// Every kind of data the kernel publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // lifecycle
    StateChanged {
        from: KernelState,
        to: KernelState,
        reason: String,
    },

    // scheduling
    Tick {
        tick: u64,
    },
    TaskSubmitted {
        task_id: TaskId,
        name: String,
        priority: u16,
    },
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskProgress {
        task_id: TaskId,
        progress: f32,
        message: Option<String>,
    },
    TaskCompleted {
        task_id: TaskId,
        usage: Option<UsageSummary>,
    },
    TaskFailed {
        task_id: TaskId,
        source_kind: EntityKind,
        source_id: String,
        reason: FailureReason,
        retry_count: u32,
        will_retry: bool,
        usage: Option<UsageSummary>,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },

    // resources
    Pressure {
        resource: ResourceKind,
        severity: PressureLevel,
        value: f64,
        threshold: f64,
    },
    Adaptation {
        rule: String,
        actions: Vec<String>,
    },

    // security
    Audit {
        entry_id: String,
        entity_kind: EntityKind,
        entity_id: String,
        permission: String,
        allowed: bool,
        reason: String,
    },
    AccessGranted {
        entity_kind: EntityKind,
        entity_id: String,
        permission: String,
        policy: String,
    },
    AccessDenied {
        entity_kind: EntityKind,
        entity_id: String,
        permission: String,
        reason: String,
    },

    // recovery
    FailureDetected {
        record_id: String,
        entity_kind: EntityKind,
        entity_id: String,
        kind: FailureKind,
        severity: Severity,
        action: RecoveryAction,
    },
    Recovered {
        record_id: String,
        action: RecoveryAction,
    },
    RecoveryFailed {
        record_id: String,
        action: RecoveryAction,
        reason: String,
    },
    Escalation {
        record_id: String,
        entity_kind: EntityKind,
        entity_id: String,
        message: String,
    },
    CheckpointSaved {
        entity_kind: EntityKind,
        entity_id: String,
        version: u64,
    },
    CheckpointRestored {
        entity_kind: EntityKind,
        entity_id: String,
        version: u64,
    },
}

impl EventPayload {
    /// The snake_case tag the payload serializes under.
    pub fn kind(&self) -> &'static str {
        use EventPayload::*;
        match self {
            StateChanged { .. } => "state_changed",
            Tick { .. } => "tick",
            TaskSubmitted { .. } => "task_submitted",
            TaskReady { .. } => "task_ready",
            TaskStarted { .. } => "task_started",
            TaskProgress { .. } => "task_progress",
            TaskCompleted { .. } => "task_completed",
            TaskFailed { .. } => "task_failed",
            TaskCancelled { .. } => "task_cancelled",
            Pressure { .. } => "pressure",
            Adaptation { .. } => "adaptation",
            Audit { .. } => "audit",
            AccessGranted { .. } => "access_granted",
            AccessDenied { .. } => "access_denied",
            FailureDetected { .. } => "failure_detected",
            Recovered { .. } => "recovered",
            RecoveryFailed { .. } => "recovery_failed",
            Escalation { .. } => "escalation",
            CheckpointSaved { .. } => "checkpoint_saved",
            CheckpointRestored { .. } => "checkpoint_restored",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_roundtrip_keeps_identity() {
        let event = KernelEvent::new(
            "steward-kernel::scheduler",
            EventPayload::TaskSubmitted {
                task_id: "t-1".into(),
                name: "index".into(),
                priority: 7,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task_submitted\""));
        assert_eq!(event.payload.kind(), "task_submitted");
        let back: KernelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.source, event.source);
    }

    #[test]
    fn severity_orders_by_gravity() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert!(PressureLevel::Critical > PressureLevel::Warning);
    }
}
