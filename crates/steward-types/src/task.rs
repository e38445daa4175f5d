//! The [`Task`] unit of work and its lifecycle.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EntityKind, KernelError};

pub type TaskId = String;

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ────────────────────────────────────────────────────────────────────────────
// TaskStatus
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `true` for completed, failed and cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// `Running -> Pending` is the retry path.  Nothing leaves a terminal
    /// status.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Priority
// ────────────────────────────────────────────────────────────────────────────

/// Base level (1–10) plus a transient boost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    pub base: u8,
    pub boost: u8,
}

impl Priority {
    /// Build a priority, clamping `base` into `1..=10`.
    pub fn new(base: u8) -> Self {
        Self {
            base: base.clamp(MIN_PRIORITY, MAX_PRIORITY),
            boost: 0,
        }
    }

    pub fn effective(&self) -> u16 {
        u16::from(self.base) + u16::from(self.boost)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TaskOptions
// ────────────────────────────────────────────────────────────────────────────

/// Optional knobs accepted by `Scheduler::create_task`.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: Option<u8>,
    pub dependencies: Vec<TaskId>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub required_permissions: Vec<String>,
}

impl TaskOptions {
    pub fn priority(mut self, level: u8) -> Self {
        self.priority = Some(level);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn requires(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Task
// ────────────────────────────────────────────────────────────────────────────

/// A schedulable, possibly dependent unit of work.
///
/// # Example
///
/// ```
/// use steward_types::{EntityKind, Task, TaskStatus};
///
/// let mut task = Task::new("index", "indexing", "agent-1", EntityKind::Agent, serde_json::json!({}));
/// assert_eq!(task.status, TaskStatus::Pending);
/// assert_eq!(task.priority.base, 5);
///
/// task.transition(TaskStatus::Running).unwrap();
/// task.transition(TaskStatus::Completed).unwrap();
/// assert!(task.transition(TaskStatus::Running).is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: String,
    pub source_id: String,
    pub source_kind: EntityKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    /// Permissions the execution engine checks before running the body.
    pub required_permissions: Vec<String>,
    #[serde(with = "crate::duration_ms")]
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        source_id: impl Into<String>,
        source_kind: EntityKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            task_type: task_type.into(),
            source_id: source_id.into(),
            source_kind,
            payload,
            priority: Priority::default(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            required_permissions: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Apply [`TaskOptions`] on top of the defaults.
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        if let Some(level) = options.priority {
            self.priority = Priority::new(level);
        }
        if let Some(timeout) = options.timeout {
            self.timeout = timeout;
        }
        if let Some(retries) = options.max_retries {
            self.max_retries = retries;
        }
        self.dependencies = options.dependencies;
        self.required_permissions = options.required_permissions;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `true` while another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move to `next`, stamping timestamps on the way.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskTerminal`] when the task already finished, or
    /// [`KernelError::InvalidTaskTransition`] for any other illegal move.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), KernelError> {
        if self.status.is_terminal() {
            return Err(KernelError::TaskTerminal {
                task_id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(KernelError::InvalidTaskTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }
}
