//! [`Scheduler`] – priority and dependency aware task queue.
//!
//! The scheduler owns every [`Task`] it has seen.  Queued tasks are ordered by
//! descending effective priority (base + boost) with ties broken by arrival
//! order.  A queued task is *ready* once all of its dependencies sit in the
//! completed set; [`Scheduler::tick`] advances the logical clock, applies
//! aging and re-evaluates readiness.
//!
//! The scheduler never runs anything itself.  Callers either pull work with
//! [`Scheduler::get_next_task`] or ask for a specific id with
//! [`Scheduler::start_task`] and report back through `complete_task`,
//! `fail_task`, `abort_task` or `cancel_task`.
//!
//! A retried task goes back on the queue *held*: it counts against capacity
//! but is not handed out until its hold lapses or [`Scheduler::release_retry`]
//! is called.  A retry that would overflow the queue fails the task instead.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use steward_middleware::EventBus;
use steward_types::{
    EntityKind, EventPayload, FailureReason, KernelError, Task, TaskId, TaskOptions, TaskStatus,
    UsageSummary,
};
use tracing::{debug, info, warn};

const SOURCE: &str = "steward-kernel::scheduler";

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Tunables for [`Scheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on queued (not yet running) tasks.
    pub max_queue_size: usize,
    /// Waiting tasks gain +1 boost every this many ticks.  `0` disables aging.
    pub aging_interval_ticks: u64,
    /// Ceiling for boost accumulated through aging.
    pub max_boost: u8,
    /// Retry `n` is held for `retry_hold_ticks * n` ticks.  `0` holds it
    /// until [`Scheduler::release_retry`]; the execution engine releases
    /// its retries itself once their backoff has passed.
    pub retry_hold_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            aging_interval_ticks: 0,
            max_boost: 5,
            retry_hold_ticks: 0,
        }
    }
}

/// Snapshot of queue and task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub tick: u64,
    pub queued: usize,
    pub ready: usize,
    /// Queued retries still waiting out their hold.
    pub held: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// What [`Scheduler::fail_task`] did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Re-queued; `retry_count` is the new count.
    Retry { retry_count: u32 },
    /// Terminal failure.
    Failed,
    /// The task could have retried but the queue was full, so it failed.
    RetryRejected { capacity: usize },
}

/// Hold value meaning "until released".
const HELD_UNTIL_RELEASED: u64 = u64::MAX;

#[derive(Debug)]
struct QueueEntry {
    id: TaskId,
    seq: u64,
    ready: bool,
    aged_at: u64,
    /// Tick at which a retry hold lapses.  `None` when not held.
    hold: Option<u64>,
}

/// Priority queue plus the registry of all tasks.
pub struct Scheduler {
    config: SchedulerConfig,
    tasks: HashMap<TaskId, Task>,
    queue: Vec<QueueEntry>,
    completed: HashSet<TaskId>,
    clock: u64,
    next_seq: u64,
    bus: EventBus,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Self {
        Self::with_config(bus, SchedulerConfig::default())
    }

    pub fn with_config(bus: EventBus, config: SchedulerConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            queue: Vec::new(),
            completed: HashSet::new(),
            clock: 0,
            next_seq: 0,
            bus,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current logical time.
    pub fn now(&self) -> u64 {
        self.clock
    }

    /// Build a task with defaults overridden by `options`.  Nothing is
    /// queued until [`Scheduler::schedule`] is called.
    pub fn create_task(
        &self,
        name: impl Into<String>,
        task_type: impl Into<String>,
        source_id: impl Into<String>,
        source_kind: EntityKind,
        payload: serde_json::Value,
        options: TaskOptions,
    ) -> Task {
        Task::new(name, task_type, source_id, source_kind, payload).with_options(options)
    }

    /// Enqueue a pending task.
    ///
    /// # Errors
    ///
    /// - [`KernelError::QueueFull`] when the queue is at capacity.
    /// - [`KernelError::DuplicateTask`] when the id is queued or running.
    /// - [`KernelError::TaskTerminal`] when the task already finished.
    pub fn schedule(&mut self, task: Task) -> Result<TaskId, KernelError> {
        if task.is_terminal() {
            return Err(KernelError::TaskTerminal {
                task_id: task.id,
                status: task.status,
            });
        }
        if self.tasks.contains_key(&task.id) {
            return Err(KernelError::DuplicateTask(task.id));
        }
        if self.queue.len() >= self.config.max_queue_size {
            warn!(task_id = %task.id, capacity = self.config.max_queue_size, "queue full");
            return Err(KernelError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let id = task.id.clone();
        let mut task = task;
        task.status = TaskStatus::Pending;
        let name = task.name.clone();
        let priority = task.priority.effective();
        self.tasks.insert(id.clone(), task);
        self.enqueue(id.clone(), None);
        info!(task_id = %id, %name, priority, "task scheduled");
        self.bus.emit(
            SOURCE,
            EventPayload::TaskSubmitted {
                task_id: id.clone(),
                name,
                priority,
            },
        );
        self.refresh_readiness();
        Ok(id)
    }

    /// Advance the logical clock by one unit.
    ///
    /// Applies aging, cancels tasks whose dependencies ended without
    /// completing, then re-evaluates readiness.  Returns the new tick.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        let clock = self.clock;
        for entry in &mut self.queue {
            if entry.hold.is_some_and(|until| until != HELD_UNTIL_RELEASED && clock >= until) {
                entry.hold = None;
            }
        }
        self.apply_aging();
        self.cancel_orphans();
        self.refresh_readiness();
        self.bus.emit(SOURCE, EventPayload::Tick { tick: self.clock });
        self.clock
    }

    /// Pop the highest-priority ready task and mark it running.
    pub fn get_next_task(&mut self) -> Option<Task> {
        let idx = self.best_ready_index()?;
        let entry = self.queue.remove(idx);
        self.dispatch(&entry.id).ok()
    }

    /// Mark the queued task `id` running, provided its dependencies are
    /// complete.  `Ok(None)` means it is still waiting on a dependency or
    /// on a retry hold.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskNotFound`] for unknown ids, or the transition error
    /// when the task is not pending.
    pub fn start_task(&mut self, id: &str) -> Result<Option<Task>, KernelError> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| KernelError::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            if task.is_terminal() {
                return Err(KernelError::TaskTerminal {
                    task_id: id.to_string(),
                    status: task.status,
                });
            }
            return Err(KernelError::InvalidTaskTransition {
                task_id: id.to_string(),
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        if !self.dependencies_met(task) || self.is_held(id) {
            return Ok(None);
        }
        self.queue.retain(|e| e.id != id);
        self.dispatch(id).map(Some)
    }

    /// Lift the hold on a retried task so it can be dispatched.  `false`
    /// when `id` is not a held queue entry.
    pub fn release_retry(&mut self, id: &str) -> bool {
        let Some(entry) = self.queue.iter_mut().find(|e| e.id == id && e.hold.is_some()) else {
            return false;
        };
        entry.hold = None;
        debug!(task_id = %id, "retry released");
        self.refresh_readiness();
        true
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.queue.iter().any(|e| e.id == id && e.hold.is_some())
    }

    /// Record a successful run.
    pub fn complete_task(
        &mut self,
        id: &str,
        result: serde_json::Value,
        usage: Option<UsageSummary>,
    ) -> Result<(), KernelError> {
        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Completed)?;
        task.result = Some(result);
        task.error = None;
        self.completed.insert(id.to_string());
        info!(task_id = %id, "task completed");
        self.bus.emit(
            SOURCE,
            EventPayload::TaskCompleted {
                task_id: id.to_string(),
                usage,
            },
        );
        self.refresh_readiness();
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The task is re-queued, held, with `retry_count + 1` while it is below
    /// `max_retries`, the reason is retryable and the queue has room;
    /// otherwise it fails for good.
    pub fn fail_task(
        &mut self,
        id: &str,
        reason: FailureReason,
        usage: Option<UsageSummary>,
    ) -> Result<FailDisposition, KernelError> {
        let capacity = self.config.max_queue_size;
        let room = self.queue.iter().filter(|e| e.id != id).count() < capacity;
        let task = self.task_mut(id)?;
        if task.is_terminal() {
            return Err(KernelError::TaskTerminal {
                task_id: id.to_string(),
                status: task.status,
            });
        }
        let wants_retry =
            task.status == TaskStatus::Running && task.can_retry() && !reason.is_terminal();
        let retry = wants_retry && room;
        let disposition = if retry {
            task.transition(TaskStatus::Pending)?;
            task.error = Some(reason.to_string());
            task.retry_count += 1;
            FailDisposition::Retry {
                retry_count: task.retry_count,
            }
        } else if wants_retry {
            task.transition(TaskStatus::Failed)?;
            task.error = Some(format!("{reason} (retry rejected: queue full at {capacity})"));
            FailDisposition::RetryRejected { capacity }
        } else {
            task.transition(TaskStatus::Failed)?;
            task.error = Some(reason.to_string());
            FailDisposition::Failed
        };

        let (source_kind, source_id, retry_count) =
            (task.source_kind.clone(), task.source_id.clone(), task.retry_count);
        if retry {
            warn!(task_id = %id, %reason, retry_count, "task failed, retrying");
            let hold = match self.config.retry_hold_ticks {
                0 => HELD_UNTIL_RELEASED,
                ticks => self
                    .clock
                    .saturating_add(ticks.saturating_mul(u64::from(retry_count))),
            };
            self.enqueue(id.to_string(), Some(hold));
        } else if wants_retry {
            warn!(task_id = %id, %reason, retry_count, capacity, "task failed, queue full for retry");
            self.queue.retain(|e| e.id != id);
        } else {
            warn!(task_id = %id, %reason, retry_count, "task failed");
            self.queue.retain(|e| e.id != id);
        }
        self.bus.emit(
            SOURCE,
            EventPayload::TaskFailed {
                task_id: id.to_string(),
                source_kind,
                source_id,
                reason,
                retry_count,
                will_retry: retry,
                usage,
            },
        );
        self.refresh_readiness();
        Ok(disposition)
    }

    /// Fail the task immediately without consuming retries.
    pub fn abort_task(
        &mut self,
        id: &str,
        reason: FailureReason,
        usage: Option<UsageSummary>,
    ) -> Result<(), KernelError> {
        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Failed)?;
        task.error = Some(reason.to_string());
        let (source_kind, source_id, retry_count) =
            (task.source_kind.clone(), task.source_id.clone(), task.retry_count);
        self.queue.retain(|e| e.id != id);
        warn!(task_id = %id, %reason, "task aborted");
        self.bus.emit(
            SOURCE,
            EventPayload::TaskFailed {
                task_id: id.to_string(),
                source_kind,
                source_id,
                reason,
                retry_count,
                will_retry: false,
                usage,
            },
        );
        Ok(())
    }

    /// Cancel a queued or running task.  `Ok(false)` when it already
    /// finished.
    pub fn cancel_task(&mut self, id: &str, reason: impl Into<String>) -> Result<bool, KernelError> {
        let task = self.task_mut(id)?;
        if task.is_terminal() {
            return Ok(false);
        }
        let reason = reason.into();
        task.transition(TaskStatus::Cancelled)?;
        task.error = Some(reason.clone());
        self.queue.retain(|e| e.id != id);
        info!(task_id = %id, %reason, "task cancelled");
        self.bus.emit(
            SOURCE,
            EventPayload::TaskCancelled {
                task_id: id.to_string(),
                reason,
            },
        );
        Ok(true)
    }

    /// Add a transient boost to a queued task.  Cleared when it is
    /// dispatched.  Returns `false` when the task is not queued.
    pub fn boost(&mut self, id: &str, amount: u8) -> bool {
        if !self.queue.iter().any(|e| e.id == id) {
            return false;
        }
        match self.tasks.get_mut(id) {
            Some(task) => {
                task.priority.boost = task.priority.boost.saturating_add(amount);
                debug!(task_id = %id, effective = task.priority.effective(), "task boosted");
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Queued tasks in dispatch order (ready ones first).
    pub fn queued(&self) -> Vec<&Task> {
        let mut entries: Vec<&QueueEntry> = self.queue.iter().collect();
        entries.sort_by(|a, b| self.order_key(b).cmp(&self.order_key(a)));
        entries
            .into_iter()
            .filter_map(|e| self.tasks.get(&e.id))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            tick: self.clock,
            queued: self.queue.len(),
            ready: self.queue.iter().filter(|e| e.ready).count(),
            held: self.queue.iter().filter(|e| e.hold.is_some()).count(),
            ..SchedulerStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Pending => {}
            }
        }
        stats
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, KernelError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| KernelError::TaskNotFound(id.to_string()))
    }

    fn enqueue(&mut self, id: TaskId, hold: Option<u64>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueueEntry {
            id,
            seq,
            ready: false,
            aged_at: self.clock,
            hold,
        });
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|d| self.completed.contains(d))
    }

    /// Higher sorts first: effective priority, then earlier arrival.
    fn order_key(&self, entry: &QueueEntry) -> (bool, u16, std::cmp::Reverse<u64>) {
        let effective = self
            .tasks
            .get(&entry.id)
            .map(|t| t.priority.effective())
            .unwrap_or(0);
        (entry.ready, effective, std::cmp::Reverse(entry.seq))
    }

    fn best_ready_index(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.hold.is_none()
                    && self
                        .tasks
                        .get(&e.id)
                        .is_some_and(|t| self.dependencies_met(t))
            })
            .max_by_key(|(_, e)| self.order_key(e))
            .map(|(i, _)| i)
    }

    fn dispatch(&mut self, id: &str) -> Result<Task, KernelError> {
        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Running)?;
        task.priority.boost = 0;
        let attempt = task.retry_count + 1;
        let snapshot = task.clone();
        debug!(task_id = %id, attempt, "task started");
        self.bus.emit(
            SOURCE,
            EventPayload::TaskStarted {
                task_id: id.to_string(),
                attempt,
            },
        );
        Ok(snapshot)
    }

    fn apply_aging(&mut self) {
        let interval = self.config.aging_interval_ticks;
        if interval == 0 {
            return;
        }
        let (clock, max_boost) = (self.clock, self.config.max_boost);
        for entry in &mut self.queue {
            if clock.saturating_sub(entry.aged_at) < interval {
                continue;
            }
            entry.aged_at = clock;
            if let Some(task) = self.tasks.get_mut(&entry.id) {
                if task.priority.boost < max_boost {
                    task.priority.boost += 1;
                }
            }
        }
    }

    fn cancel_orphans(&mut self) {
        let orphans: Vec<(TaskId, TaskId)> = self
            .queue
            .iter()
            .filter_map(|e| {
                let task = self.tasks.get(&e.id)?;
                task.dependencies
                    .iter()
                    .find(|d| {
                        matches!(
                            self.tasks.get(d.as_str()).map(|t| t.status),
                            Some(TaskStatus::Failed | TaskStatus::Cancelled)
                        )
                    })
                    .map(|dep| (e.id.clone(), dep.clone()))
            })
            .collect();
        for (id, dep) in orphans {
            if let Err(e) = self.cancel_task(&id, format!("dependency {dep} did not complete")) {
                warn!(task_id = %id, error = %e, "failed to cancel orphaned task");
            }
        }
    }

    fn refresh_readiness(&mut self) {
        let mut newly_ready = Vec::new();
        for entry in &mut self.queue {
            let ready = entry.hold.is_none()
                && self
                    .tasks
                    .get(&entry.id)
                    .is_some_and(|t| t.dependencies.iter().all(|d| self.completed.contains(d)));
            if ready && !entry.ready {
                newly_ready.push(entry.id.clone());
            }
            entry.ready = ready;
        }
        for task_id in newly_ready {
            self.bus.emit(SOURCE, EventPayload::TaskReady { task_id });
        }
    }
}
