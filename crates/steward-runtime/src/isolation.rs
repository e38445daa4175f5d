//! One isolated execution of a task body.
//!
//! [`IsolationContext::run`] races the body against the time limit, the
//! periodic budget poll and the [`KillSwitch`].  Whatever wins, usage
//! tracking is stopped exactly once and the final figures come back in the
//! [`ExecutionOutcome`].
//!
//! Cancellation is cooperative: when the kill switch flips, the context stops
//! waiting and drops the body at its current await point.  Blocking code
//! inside the body is not preempted.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use steward_governance::{BudgetManager, ProbeReading, ResourceBudget, UsageProbe, UsageTracker};
use steward_middleware::EventBus;
use steward_types::{EventPayload, FailureReason, Task, UsageSummary, duration_ms};
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};

use crate::lock;

const SOURCE: &str = "steward-runtime::isolation";

/// The future a task body returns.
pub type TaskFuture = BoxFuture<'static, Result<Value, String>>;

/// A task body.  Called once per attempt.
pub type Executor = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as an [`Executor`].
///
/// ```
/// use steward_runtime::executor;
///
/// let body = executor(|ctx| async move { Ok(ctx.payload().clone()) });
/// # let _ = body;
/// ```
pub fn executor<F, Fut>(f: F) -> Executor
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

// ─────────────────────────────────────────────────────────────────────────────
// KillSwitch
// ─────────────────────────────────────────────────────────────────────────────

/// Cooperative cancellation signal shared between the engine and a body.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Flip the switch.  `true` on the first call only.
    pub fn kill(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_killed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the switch has been flipped.
    pub async fn killed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|killed| *killed).await;
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TaskContext
// ─────────────────────────────────────────────────────────────────────────────

/// What a task body sees of the kernel.
#[derive(Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    kill: KillSwitch,
    tracker: Arc<Mutex<UsageTracker>>,
    usage_reported: Arc<Notify>,
    bus: EventBus,
}

impl TaskContext {
    /// Snapshot of the task as it was dispatched.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    /// 1 for the first run, 2 for the first retry, and so on.
    pub fn attempt(&self) -> u32 {
        self.task.retry_count + 1
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill
    }

    pub fn is_cancelled(&self) -> bool {
        self.kill.is_killed()
    }

    pub async fn cancelled(&self) {
        self.kill.killed().await
    }

    /// Report the body's own footprint.  Checked against the budget at once.
    pub fn report_usage(&self, cpu_percent: f32, memory_mb: f64) {
        lock(&self.tracker).report(ProbeReading {
            cpu_percent,
            memory_mb,
        });
        self.usage_reported.notify_one();
    }

    /// Publish progress in `0.0..=1.0`.
    pub fn report_progress(&self, progress: f32, message: Option<&str>) {
        self.bus.emit(
            SOURCE,
            EventPayload::TaskProgress {
                task_id: self.task.id.clone(),
                progress: progress.clamp(0.0, 1.0),
                message: message.map(str::to_string),
            },
        );
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task.id)
            .field("killed", &self.kill.is_killed())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IsolationContext
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub result: Result<Value, FailureReason>,
    pub usage: UsageSummary,
}

pub struct IsolationContext {
    task: Task,
    budget: ResourceBudget,
    probe: Arc<dyn UsageProbe>,
    poll_interval: Duration,
    kill: KillSwitch,
    bus: EventBus,
}

impl IsolationContext {
    pub fn new(
        task: Task,
        budget: ResourceBudget,
        probe: Arc<dyn UsageProbe>,
        poll_interval: Duration,
        kill: KillSwitch,
        bus: EventBus,
    ) -> Self {
        Self {
            task,
            budget,
            probe,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            kill,
            bus,
        }
    }

    /// The tighter of the task timeout and the budget's time ceiling.
    pub fn time_limit(&self) -> Duration {
        self.task.timeout.min(self.budget.max_time)
    }

    #[instrument(skip_all, fields(task_id = %self.task.id, attempt = self.task.retry_count + 1))]
    pub async fn run(self, executor: &Executor) -> ExecutionOutcome {
        let tracker = Arc::new(Mutex::new(UsageTracker::start(self.probe.read())));
        let usage_reported = Arc::new(Notify::new());
        let ctx = TaskContext {
            task: Arc::new(self.task.clone()),
            kill: self.kill.clone(),
            tracker: Arc::clone(&tracker),
            usage_reported: Arc::clone(&usage_reported),
            bus: self.bus.clone(),
        };

        let limit = self.time_limit();
        let result = match catch_unwind(AssertUnwindSafe(|| executor(ctx))) {
            Ok(body) => self.race(body, limit, &tracker, &usage_reported).await,
            Err(_) => Err(panicked()),
        };

        let usage = {
            let mut t = lock(&tracker);
            t.stop().unwrap_or_else(|| t.usage().summary())
        };
        match &result {
            Ok(_) => debug!(elapsed_ms = usage.elapsed_ms, "execution finished"),
            Err(reason) => debug!(%reason, elapsed_ms = usage.elapsed_ms, "execution ended"),
        }
        ExecutionOutcome { result, usage }
    }

    async fn race(
        &self,
        body: TaskFuture,
        limit: Duration,
        tracker: &Mutex<UsageTracker>,
        usage_reported: &Notify,
    ) -> Result<Value, FailureReason> {
        let mut body = AssertUnwindSafe(body).catch_unwind();
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.kill.killed() => return Err(FailureReason::Killed),
                out = &mut body => {
                    return match out {
                        Ok(result) => result.map_err(FailureReason::Executor),
                        Err(_) => Err(panicked()),
                    };
                }
                _ = &mut deadline => {
                    return Err(FailureReason::Timeout {
                        after_ms: duration_ms::saturating(limit),
                    });
                }
                _ = poll.tick() => {
                    let usage = lock(tracker).observe(self.probe.read());
                    if let Some(breach) = BudgetManager::check_footprint(&self.budget, &usage) {
                        return Err(breach.into());
                    }
                }
                _ = usage_reported.notified() => {
                    let usage = lock(tracker).usage();
                    if let Some(breach) = BudgetManager::check_footprint(&self.budget, &usage) {
                        return Err(breach.into());
                    }
                }
            }
        }
    }
}

fn panicked() -> FailureReason {
    warn!("task body panicked");
    FailureReason::Executor("executor panicked".to_string())
}
