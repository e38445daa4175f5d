//! [`ExecutionEngine`] – dispatches submitted tasks and settles their outcomes.
//!
//! Submitted tasks are registered with the [`Scheduler`] and placed on the
//! engine's own dispatch queue, ordered by effective priority and then by
//! submission order.  [`ExecutionEngine::pump`] starts queued tasks while
//! fewer than `max_concurrency` are running and the kernel is operational;
//! the scheduler has the final word on whether a task's dependencies allow it
//! to start.
//!
//! Each started task runs on its own Tokio task:
//!
//! 1. **Admit** – the [`AdmissionGate`] checks permissions and picks the
//!    budget.  A denial fails the task for good.
//! 2. **Execute** – an [`IsolationContext`] races the body against its time
//!    limit, the budget poll and the kill switch.
//! 3. **Settle** – the outcome goes back to the scheduler.  A retryable
//!    failure stays held in the scheduler's queue for
//!    `backoff_base * retry_count`, after which the engine releases it and
//!    queues it again; a killed task ends cancelled.
//!
//! Bus listeners run synchronously while the scheduler is locked and must
//! not call back into the engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_governance::{BudgetUpdate, ResourceGovernor, UsageProbe};
use steward_kernel::{FailDisposition, Scheduler, StateMachine};
use steward_middleware::EventBus;
use steward_types::{FailureReason, KernelError, Task, TaskId};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::gate::AdmissionGate;
use crate::isolation::{ExecutionOutcome, Executor, IsolationContext, KillSwitch};
use crate::{Shared, lock};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks allowed to run at once.
    pub max_concurrency: usize,
    /// How often a running task's footprint is checked.
    #[serde(with = "steward_types::duration_ms")]
    pub poll_interval: Duration,
    /// Retry `n` waits `backoff_base * n`.
    #[serde(with = "steward_types::duration_ms")]
    pub backoff_base: Duration,
    /// How long shutdown waits for cancelled tasks to settle.
    #[serde(with = "steward_types::duration_ms")]
    pub shutdown_grace: Duration,
    /// Measure this process through `sysinfo`.  Otherwise only what task
    /// bodies report counts.
    pub process_probe: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            poll_interval: Duration::from_millis(100),
            backoff_base: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(5),
            process_probe: true,
        }
    }
}

/// Engine counters.  Outcome counters count attempts, not tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub queued: usize,
    pub running: usize,
    pub backing_off: usize,
    pub max_concurrency: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub limit_exceeded: u64,
    pub denied: u64,
}

/// Shared handle on the live concurrency limit.  Never below 1.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit(Arc<AtomicUsize>);

impl ConcurrencyLimit {
    fn new(value: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(value.max(1))))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: usize) -> usize {
        let value = value.max(1);
        self.0.store(value, Ordering::SeqCst);
        value
    }

    /// Lower by `by`, stopping at 1.  Returns the new limit.
    pub fn reduce(&self, by: usize) -> usize {
        self.update(|v| v.saturating_sub(by).max(1))
    }

    /// Raise by `by`, stopping at `ceiling`.  A limit already above the
    /// ceiling is left alone.  Returns the new limit.
    pub fn raise(&self, by: usize, ceiling: usize) -> usize {
        self.update(|v| if v >= ceiling { v } else { v.saturating_add(by).min(ceiling) })
    }

    fn update(&self, f: impl Fn(usize) -> usize) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(f(v).max(1)))
            .unwrap_or_else(|v| v);
        f(previous).max(1)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

struct DispatchEntry {
    task_id: TaskId,
    priority: u16,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    queue: Vec<DispatchEntry>,
    /// Every submitted task that has not settled for good.
    executors: HashMap<TaskId, Executor>,
    running: HashMap<TaskId, KillSwitch>,
    backing_off: HashSet<TaskId>,
    next_seq: u64,
    stats: EngineStats,
}

impl Inner {
    fn enqueue(&mut self, task_id: TaskId, priority: u16) {
        self.queue.retain(|e| e.task_id != task_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(DispatchEntry {
            task_id,
            priority,
            seq,
        });
    }

    fn forget(&mut self, task_id: &str) {
        self.queue.retain(|e| e.task_id != task_id);
        self.executors.remove(task_id);
        self.backing_off.remove(task_id);
    }
}

/// How one attempt ended, from the engine's point of view.
#[derive(Debug, Clone, PartialEq)]
enum Settled {
    Completed,
    Retrying { retry_count: u32 },
    Failed,
    Cancelled,
}

struct Services {
    config: EngineConfig,
    limit: ConcurrencyLimit,
    state: Shared<StateMachine>,
    scheduler: Shared<Scheduler>,
    governor: Shared<ResourceGovernor>,
    gate: AdmissionGate,
    probe: Arc<dyn UsageProbe>,
    bus: EventBus,
    inner: Mutex<Inner>,
    running: watch::Sender<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecutionEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct ExecutionEngine {
    services: Arc<Services>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        bus: EventBus,
        state: Shared<StateMachine>,
        scheduler: Shared<Scheduler>,
        gate: AdmissionGate,
        governor: Shared<ResourceGovernor>,
        probe: Arc<dyn UsageProbe>,
    ) -> Self {
        let (running, _) = watch::channel(0);
        Self {
            services: Arc::new(Services {
                limit: ConcurrencyLimit::new(config.max_concurrency),
                config,
                state,
                scheduler,
                governor,
                gate,
                probe,
                bus,
                inner: Mutex::new(Inner::default()),
                running,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn concurrency_limit(&self) -> ConcurrencyLimit {
        self.services.limit.clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.services.limit.get()
    }

    /// Change the concurrency limit.  Raising it starts waiting tasks at
    /// once; lowering it lets running tasks finish.
    pub fn set_max_concurrency(&self, value: usize) -> usize {
        let previous = self.services.limit.get();
        let value = self.services.limit.set(value);
        info!(previous, current = value, "concurrency limit changed");
        if value > previous {
            self.pump();
        }
        value
    }

    /// Register `task` with the scheduler and queue it for execution.
    ///
    /// `budget`, when given, is merged into the source entity's budget.
    ///
    /// # Errors
    ///
    /// Whatever [`Scheduler::schedule`] rejects: a full queue, a duplicate id
    /// or an already finished task.
    #[instrument(skip_all, fields(task_id = %task.id, name = %task.name))]
    pub fn submit(
        &self,
        task: Task,
        executor: Executor,
        budget: Option<BudgetUpdate>,
    ) -> Result<TaskId, KernelError> {
        let (kind, source, priority) = (
            task.source_kind.clone(),
            task.source_id.clone(),
            task.priority.effective(),
        );
        let id = lock(&self.services.scheduler).schedule(task)?;
        if let Some(update) = budget {
            lock(&self.services.governor)
                .budgets_mut()
                .update(&kind, &source, update);
        }
        {
            let mut inner = lock(&self.services.inner);
            inner.executors.insert(id.clone(), executor);
            inner.enqueue(id.clone(), priority);
        }
        debug!(task_id = %id, priority, "task submitted");
        self.pump();
        Ok(id)
    }

    /// Start queued tasks up to the concurrency limit.  Returns how many
    /// were started.
    pub fn pump(&self) -> usize {
        if !lock(&self.services.state).is_operational() {
            return 0;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no Tokio runtime; dispatch deferred");
            return 0;
        }

        let mut started = Vec::new();
        {
            let mut inner = lock(&self.services.inner);
            let limit = self.services.limit.get();
            inner
                .queue
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

            let mut i = 0;
            while i < inner.queue.len() && inner.running.len() < limit {
                let id = inner.queue[i].task_id.clone();
                let outcome = lock(&self.services.scheduler).start_task(&id);
                match outcome {
                    Ok(Some(task)) => {
                        inner.queue.remove(i);
                        let Some(executor) = inner.executors.get(&id).cloned() else {
                            warn!(task_id = %id, "no executor registered");
                            if let Err(e) = lock(&self.services.scheduler).abort_task(
                                &id,
                                FailureReason::Executor("no executor registered".into()),
                                None,
                            ) {
                                warn!(task_id = %id, error = %e, "failed to abort task without executor");
                            }
                            continue;
                        };
                        let kill = KillSwitch::new();
                        inner.running.insert(id, kill.clone());
                        started.push((task, executor, kill));
                    }
                    // Dependencies not met yet.
                    Ok(None) => i += 1,
                    Err(e) => {
                        debug!(task_id = %id, error = %e, "dropping dispatch entry");
                        inner.forget(&id);
                    }
                }
            }
            self.services.running.send_replace(inner.running.len());
        }

        let count = started.len();
        for (task, executor, kill) in started {
            let engine = self.clone();
            tokio::spawn(async move { engine.execute(task, executor, kill).await });
        }
        count
    }

    /// Cancel a queued, backing-off or running task.
    ///
    /// A running task is signalled through its kill switch and ends
    /// cancelled once its body stops.  `false` for unknown or finished
    /// tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        {
            let mut inner = lock(&self.services.inner);
            if let Some(kill) = inner.running.get(task_id) {
                kill.kill();
                info!(%task_id, "kill signalled");
                return true;
            }
            inner.forget(task_id);
        }
        let cancelled = matches!(
            lock(&self.services.scheduler).cancel_task(task_id, "cancelled"),
            Ok(true)
        );
        if cancelled {
            lock(&self.services.inner).stats.cancelled += 1;
        }
        cancelled
    }

    /// Cancel everything the engine knows about.  Returns how many tasks
    /// were signalled or cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let (running, waiting): (Vec<KillSwitch>, Vec<TaskId>) = {
            let mut inner = lock(&self.services.inner);
            let running = inner.running.values().cloned().collect();
            let waiting: Vec<TaskId> = inner
                .executors
                .keys()
                .filter(|id| !inner.running.contains_key(*id))
                .cloned()
                .collect();
            for id in &waiting {
                inner.forget(id);
            }
            (running, waiting)
        };

        let killed = running.iter().filter(|k| k.kill()).count();
        let cancelled = {
            let mut scheduler = lock(&self.services.scheduler);
            waiting
                .iter()
                .filter(|id| matches!(scheduler.cancel_task(id, reason), Ok(true)))
                .count()
        };
        lock(&self.services.inner).stats.cancelled += cancelled as u64;
        let count = killed + cancelled;
        info!(count, %reason, "engine cancelled all work");
        count
    }

    /// Wait until no task is running.  `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.services.running.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Cancel all work and wait up to `shutdown_grace` for it to settle.
    pub async fn shutdown(&self) -> bool {
        self.cancel_all("shutdown");
        let drained = self.drain(self.services.config.shutdown_grace).await;
        if !drained {
            warn!("engine shutdown grace period elapsed with tasks still running");
        }
        drained
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        lock(&self.services.inner).running.contains_key(task_id)
    }

    pub fn stats(&self) -> EngineStats {
        let inner = lock(&self.services.inner);
        EngineStats {
            queued: inner.queue.len(),
            running: inner.running.len(),
            backing_off: inner.backing_off.len(),
            max_concurrency: self.services.limit.get(),
            ..inner.stats.clone()
        }
    }

    // ── worker ──────────────────────────────────────────────────────────────

    async fn execute(self, task: Task, executor: Executor, kill: KillSwitch) {
        let id = task.id.clone();
        let priority = task.priority.effective();

        let settled = match self.services.gate.admit(&task) {
            Ok(budget) => {
                let isolation = IsolationContext::new(
                    task,
                    budget,
                    Arc::clone(&self.services.probe),
                    self.services.config.poll_interval,
                    kill,
                    self.services.bus.clone(),
                );
                let outcome = isolation.run(&executor).await;
                self.settle(&id, outcome)
            }
            Err(e) => {
                let reason = match e {
                    KernelError::Unauthorized {
                        permission, reason, ..
                    } => FailureReason::Unauthorized(format!("{permission}: {reason}")),
                    other => FailureReason::Unauthorized(other.to_string()),
                };
                warn!(task_id = %id, %reason, "task denied");
                lock(&self.services.inner).stats.denied += 1;
                if let Err(e) = lock(&self.services.scheduler).abort_task(&id, reason, None) {
                    debug!(task_id = %id, error = %e, "denied task already settled");
                }
                Settled::Failed
            }
        };

        {
            let mut inner = lock(&self.services.inner);
            inner.running.remove(&id);
            match &settled {
                Settled::Completed => inner.stats.completed += 1,
                Settled::Failed => inner.stats.failed += 1,
                Settled::Cancelled => inner.stats.cancelled += 1,
                Settled::Retrying { .. } => {
                    inner.stats.retried += 1;
                    inner.backing_off.insert(id.clone());
                }
            }
            if !matches!(settled, Settled::Retrying { .. }) {
                inner.forget(&id);
            }
            self.services.running.send_replace(inner.running.len());
        }

        if let Settled::Retrying { retry_count } = settled {
            let delay = self.services.config.backoff_base * retry_count;
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                engine.requeue(id, priority);
            });
        }
        self.pump();
    }

    fn settle(&self, id: &str, outcome: ExecutionOutcome) -> Settled {
        let ExecutionOutcome { result, usage } = outcome;
        match &result {
            Err(FailureReason::Timeout { .. }) => lock(&self.services.inner).stats.timed_out += 1,
            Err(FailureReason::LimitExceeded { .. }) => {
                lock(&self.services.inner).stats.limit_exceeded += 1
            }
            _ => {}
        }

        let mut scheduler = lock(&self.services.scheduler);
        let settled = match result {
            Ok(value) => scheduler
                .complete_task(id, value, Some(usage))
                .map(|()| Settled::Completed),
            Err(FailureReason::Killed) => scheduler
                .cancel_task(id, "killed")
                .map(|_| Settled::Cancelled),
            Err(reason) => scheduler
                .fail_task(id, reason, Some(usage))
                .map(|d| match d {
                    FailDisposition::Retry { retry_count } => Settled::Retrying { retry_count },
                    FailDisposition::Failed | FailDisposition::RetryRejected { .. } => {
                        Settled::Failed
                    }
                }),
        };
        settled.unwrap_or_else(|e| {
            debug!(task_id = %id, error = %e, "task settled elsewhere");
            Settled::Cancelled
        })
    }

    fn requeue(&self, id: TaskId, priority: u16) {
        {
            let mut inner = lock(&self.services.inner);
            if !inner.backing_off.remove(&id) || !inner.executors.contains_key(&id) {
                return;
            }
            if !lock(&self.services.scheduler).release_retry(&id) {
                debug!(task_id = %id, "retry no longer held");
            }
            inner.enqueue(id.clone(), priority);
        }
        debug!(task_id = %id, "retry queued");
        self.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::executor;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicU32;
    use steward_governance::{GovernanceConfig, NullProbe, StaticSampler};
    use steward_kernel::{Policy, SecurityManager};
    use steward_types::{EntityKind, KernelState, TaskOptions, TaskStatus};

    struct Fixture {
        engine: ExecutionEngine,
        state: Shared<StateMachine>,
        scheduler: Shared<Scheduler>,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let bus = EventBus::default();
        let state = Arc::new(Mutex::new(StateMachine::new(bus.clone())));
        let scheduler = Arc::new(Mutex::new(Scheduler::new(bus.clone())));
        let mut security = SecurityManager::new(bus.clone());
        security.add_policy(Policy::new("agents", EntityKind::Agent).allow("model:*"));
        let security = Arc::new(Mutex::new(security));
        let governor = Arc::new(Mutex::new(ResourceGovernor::new(
            bus.clone(),
            Box::new(StaticSampler::default()),
            GovernanceConfig::default(),
        )));
        let gate = AdmissionGate::new(security, Arc::clone(&governor));
        let engine = ExecutionEngine::new(
            config,
            bus,
            Arc::clone(&state),
            Arc::clone(&scheduler),
            gate,
            governor,
            Arc::new(NullProbe),
        );
        lock(&state)
            .transition(KernelState::Active, "test")
            .unwrap();
        Fixture {
            engine,
            state,
            scheduler,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(5),
            backoff_base: Duration::from_millis(10),
            process_probe: false,
            ..EngineConfig::default()
        }
    }

    fn task(name: &str, options: TaskOptions) -> Task {
        Task::new(name, "generic", "agent-1", EntityKind::Agent, json!({})).with_options(options)
    }

    fn sleeper(ms: u64) -> Executor {
        executor(move |ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!("done")),
                _ = ctx.cancelled() => Err("cancelled".to_string()),
            }
        })
    }

    fn status(f: &Fixture, id: &str) -> Option<TaskStatus> {
        lock(&f.scheduler).status(id)
    }

    async fn settle(f: &Fixture, id: &str) -> Option<TaskStatus> {
        for _ in 0..500 {
            match status(f, id) {
                Some(s) if s.is_terminal() => return Some(s),
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        status(f, id)
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let f = fixture(fast_config());
        let id = f
            .engine
            .submit(task("ok", TaskOptions::default()), sleeper(5), None)
            .unwrap();
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Completed));
        assert_eq!(
            lock(&f.scheduler).task(&id).and_then(|t| t.result.clone()),
            Some(json!("done"))
        );
        let stats = f.engine.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let f = fixture(EngineConfig {
            max_concurrency: 2,
            ..fast_config()
        });
        let ids: Vec<_> = (0..5)
            .map(|i| {
                f.engine
                    .submit(task(&format!("t{i}"), TaskOptions::default()), sleeper(50), None)
                    .unwrap()
            })
            .collect();
        let stats = f.engine.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.queued, 3);
        for id in &ids {
            assert_eq!(settle(&f, id).await, Some(TaskStatus::Completed));
        }
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let f = fixture(EngineConfig {
            max_concurrency: 1,
            ..fast_config()
        });
        let blocker = f
            .engine
            .submit(task("blocker", TaskOptions::default()), sleeper(30), None)
            .unwrap();
        let low = f
            .engine
            .submit(task("low", TaskOptions::default().priority(2)), sleeper(1), None)
            .unwrap();
        let high = f
            .engine
            .submit(task("high", TaskOptions::default().priority(9)), sleeper(1), None)
            .unwrap();
        assert!(f.engine.is_running(&blocker));
        settle(&f, &blocker).await;
        settle(&f, &low).await;
        let scheduler = lock(&f.scheduler);
        let started = |id: &str| scheduler.task(id).and_then(|t| t.started_at);
        assert!(started(&high) <= started(&low));
    }

    #[tokio::test]
    async fn paused_kernel_does_not_dispatch() {
        let f = fixture(fast_config());
        lock(&f.state)
            .transition(KernelState::Paused, "test")
            .unwrap();
        let id = f
            .engine
            .submit(task("t", TaskOptions::default()), sleeper(1), None)
            .unwrap();
        assert_eq!(status(&f, &id), Some(TaskStatus::Pending));
        assert_eq!(f.engine.stats().queued, 1);

        lock(&f.state)
            .transition(KernelState::Active, "test")
            .unwrap();
        assert_eq!(f.engine.pump(), 1);
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn entry_without_executor_is_aborted_on_dispatch() {
        let f = fixture(fast_config());
        lock(&f.state)
            .transition(KernelState::Paused, "test")
            .unwrap();
        let id = f
            .engine
            .submit(task("orphan", TaskOptions::default()), sleeper(1), None)
            .unwrap();
        lock(&f.engine.services.inner).executors.remove(&id);

        lock(&f.state)
            .transition(KernelState::Active, "test")
            .unwrap();
        assert_eq!(f.engine.pump(), 0);
        assert_eq!(status(&f, &id), Some(TaskStatus::Failed));
        let scheduler = lock(&f.scheduler);
        let error = scheduler.task(&id).and_then(|t| t.error.clone()).unwrap();
        assert!(error.contains("no executor registered"));
        assert!(!f.engine.is_running(&id));
    }

    #[tokio::test]
    async fn failing_task_retries_until_ceiling() {
        let f = fixture(fast_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let body = executor(move |_| {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>("flaky".to_string())
            }
        });
        let id = f
            .engine
            .submit(task("flaky", TaskOptions::default().max_retries(2)), body, None)
            .unwrap();
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Failed));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(lock(&f.scheduler).task(&id).map(|t| t.retry_count), Some(2));
        let stats = f.engine.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.backing_off, 0);
    }

    #[tokio::test]
    async fn backing_off_retry_is_held_by_the_scheduler() {
        let f = fixture(EngineConfig {
            backoff_base: Duration::from_millis(200),
            ..fast_config()
        });
        let body = executor(|_| async { Err::<Value, _>("flaky".to_string()) });
        let id = f
            .engine
            .submit(task("flaky", TaskOptions::default().max_retries(1)), body, None)
            .unwrap();
        for _ in 0..100 {
            if f.engine.stats().backing_off == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        {
            let mut scheduler = lock(&f.scheduler);
            assert_eq!(scheduler.status(&id), Some(TaskStatus::Pending));
            assert!(scheduler.is_held(&id));
            assert!(scheduler.get_next_task().is_none());
        }
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Failed));
        assert_eq!(lock(&f.scheduler).task(&id).map(|t| t.retry_count), Some(1));
    }

    #[tokio::test]
    async fn timeout_is_reported_as_failure() {
        let f = fixture(fast_config());
        let id = f
            .engine
            .submit(
                task(
                    "slow",
                    TaskOptions::default()
                        .timeout(Duration::from_millis(20))
                        .max_retries(0),
                ),
                sleeper(5_000),
                None,
            )
            .unwrap();
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Failed));
        let error = lock(&f.scheduler).task(&id).and_then(|t| t.error.clone());
        assert!(error.unwrap_or_default().starts_with("timeout"));
        assert_eq!(f.engine.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn denial_is_terminal_without_retry() {
        let f = fixture(fast_config());
        let ran = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&ran);
        let body = executor(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            async { Ok(Value::Null) }
        });
        let id = f
            .engine
            .submit(task("rm", TaskOptions::default().requires("storage:delete")), body, None)
            .unwrap();
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Failed));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let t = lock(&f.scheduler).task(&id).cloned().unwrap();
        assert_eq!(t.retry_count, 0);
        assert!(t.error.unwrap_or_default().starts_with("unauthorized"));
        assert_eq!(f.engine.stats().denied, 1);
    }

    #[tokio::test]
    async fn submit_budget_limits_execution() {
        let f = fixture(fast_config());
        let body = executor(|ctx| async move {
            ctx.report_usage(1.0, 300.0);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let id = f
            .engine
            .submit(
                task("hog", TaskOptions::default().max_retries(0)),
                body,
                Some(BudgetUpdate {
                    max_memory_mb: Some(100),
                    ..BudgetUpdate::default()
                }),
            )
            .unwrap();
        assert_eq!(settle(&f, &id).await, Some(TaskStatus::Failed));
        let error = lock(&f.scheduler).task(&id).and_then(|t| t.error.clone());
        assert!(error.unwrap_or_default().contains("memory_mb"));
        assert_eq!(f.engine.stats().limit_exceeded, 1);
    }

    #[tokio::test]
    async fn cancel_queued_and_running_tasks() {
        let f = fixture(EngineConfig {
            max_concurrency: 1,
            ..fast_config()
        });
        let running = f
            .engine
            .submit(task("a", TaskOptions::default()), sleeper(5_000), None)
            .unwrap();
        let queued = f
            .engine
            .submit(task("b", TaskOptions::default()), sleeper(5_000), None)
            .unwrap();

        assert!(f.engine.cancel(&queued));
        assert_eq!(status(&f, &queued), Some(TaskStatus::Cancelled));
        assert!(f.engine.cancel(&running));
        assert_eq!(settle(&f, &running).await, Some(TaskStatus::Cancelled));

        assert!(!f.engine.cancel(&running));
        assert!(!f.engine.cancel("missing"));
        assert_eq!(f.engine.stats().cancelled, 2);
    }

    #[tokio::test]
    async fn dependent_task_waits_for_dependency() {
        let f = fixture(fast_config());
        let first = task("first", TaskOptions::default());
        let first_id = first.id.clone();
        let second = f
            .engine
            .submit(task("second", TaskOptions::default().depends_on(&first_id)), sleeper(1), None)
            .unwrap();
        assert_eq!(status(&f, &second), Some(TaskStatus::Pending));
        assert!(!f.engine.is_running(&second));

        f.engine.submit(first, sleeper(10), None).unwrap();
        assert_eq!(settle(&f, &first_id).await, Some(TaskStatus::Completed));
        assert_eq!(settle(&f, &second).await, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let f = fixture(EngineConfig {
            max_concurrency: 1,
            shutdown_grace: Duration::from_secs(2),
            ..fast_config()
        });
        let a = f
            .engine
            .submit(task("a", TaskOptions::default()), sleeper(5_000), None)
            .unwrap();
        let b = f
            .engine
            .submit(task("b", TaskOptions::default()), sleeper(5_000), None)
            .unwrap();
        assert!(f.engine.shutdown().await);
        assert_eq!(status(&f, &a), Some(TaskStatus::Cancelled));
        assert_eq!(status(&f, &b), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn concurrency_limit_floor_and_ceiling() {
        let limit = ConcurrencyLimit::new(3);
        assert_eq!(limit.reduce(1), 2);
        assert_eq!(limit.reduce(5), 1);
        assert_eq!(limit.get(), 1);
        assert_eq!(limit.raise(1, 3), 2);
        assert_eq!(limit.raise(10, 3), 3);
        assert_eq!(limit.set(0), 1);
    }
}
