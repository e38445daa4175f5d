//! [`Kernel`] – one running instance of every service, wired together.
//!
//! The kernel owns the event bus and each component behind its own lock.
//! Components never call each other directly; the kernel connects them:
//!
//! - the **scheduler clock** timer ticks the scheduler and pumps the engine,
//! - the **resource sampler** timer samples the host and runs adaptation,
//!   whose `reduce_concurrency` action lowers the engine's live limit,
//! - the **heartbeat sweep** timer checks every known heartbeat and prunes
//!   idle rate-limit keys,
//! - the **recovery feed** listens to scheduling events and turns task
//!   outcomes into error-rate samples and failure records.  A synchronous
//!   listener hands outcomes to it over an unbounded channel, so none are
//!   lost however far the feed falls behind,
//! - the **journal** and **metrics** listeners record every event.
//!
//! Accessors such as [`Kernel::scheduler`] hand out a lock guard.  Do not
//! hold one across an `.await`, and do not call back into the kernel from a
//! synchronous bus listener.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use steward_governance::{
    AdaptationAction, AdaptationRule, BudgetUpdate, LoadSampler, NullProbe, ProcessProbe,
    ResourceAggregate, ResourceBudget, ResourceGovernor, ResourceSnapshot, SystemSampler,
    UsageProbe,
};
use steward_kernel::{
    AccessDecision, AuditEntry, AuditFilter, AuditSummary, Checkpoint, FailureFilter,
    FailureRecord, Policy, RecoveryManager, Scheduler, SchedulerStats, SecurityManager,
    StateMachine, StateTransition,
};
use steward_middleware::{
    EventBus, EventJournal, RecordedEvent, SubscriptionId, Topic, TopicReceiver,
};
use steward_types::{
    EntityKind, EventPayload, FailureKind, FailureReason, KernelError, KernelEvent, KernelState,
    RecoveryAction, Severity, Task, TaskId, TaskOptions, TaskStatus,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::config::KernelConfig;
use crate::engine::{EngineStats, ExecutionEngine};
use crate::gate::AdmissionGate;
use crate::isolation::Executor;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::timer::IntervalTimer;
use crate::{Shared, lock};

/// Custom adaptation action that raises the concurrency limit back toward
/// its configured value.
pub const RESTORE_CONCURRENCY: &str = "restore_concurrency";

pub struct Kernel {
    config: KernelConfig,
    bus: EventBus,
    state: Shared<StateMachine>,
    scheduler: Shared<Scheduler>,
    security: Shared<SecurityManager>,
    governor: Shared<ResourceGovernor>,
    recovery: Shared<RecoveryManager>,
    engine: ExecutionEngine,
    journal: Shared<EventJournal>,
    metrics: Shared<MetricsCollector>,
    timers: Mutex<Vec<IntervalTimer>>,
    feed: Mutex<Option<SubscriptionId>>,
}

impl Kernel {
    /// A kernel measuring the real host and, when `engine.process_probe` is
    /// set, this process.
    ///
    /// # Errors
    ///
    /// [`KernelError::Config`] when `config` fails validation.
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        let probe: Arc<dyn UsageProbe> = if config.engine.process_probe {
            Arc::new(ProcessProbe::new())
        } else {
            Arc::new(NullProbe)
        };
        Self::with_sources(config, Box::new(SystemSampler::new()), probe)
    }

    /// A kernel with explicit load and usage sources.
    ///
    /// # Errors
    ///
    /// [`KernelError::Config`] when `config` fails validation.
    pub fn with_sources(
        config: KernelConfig,
        sampler: Box<dyn LoadSampler>,
        probe: Arc<dyn UsageProbe>,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        let bus = EventBus::new(config.bus_capacity);
        let journal = shared(EventJournal::new(config.journal_capacity));
        if config.journal_capacity > 0 {
            EventJournal::attach(&journal, &bus);
        }
        let metrics = shared(MetricsCollector::new());
        let sink = Arc::clone(&metrics);
        bus.on_any(move |event| lock(&sink).record_event(event));
        let state = shared(StateMachine::new(bus.clone()));
        let scheduler = shared(Scheduler::with_config(bus.clone(), config.scheduler.clone()));
        let security = shared(SecurityManager::new(bus.clone()));
        let governor = shared(ResourceGovernor::new(
            bus.clone(),
            sampler,
            config.governance.clone(),
        ));
        let recovery = shared(RecoveryManager::with_config(
            bus.clone(),
            config.recovery.clone(),
        ));
        let gate = AdmissionGate::new(Arc::clone(&security), Arc::clone(&governor));
        let engine = ExecutionEngine::new(
            config.engine.clone(),
            bus.clone(),
            Arc::clone(&state),
            Arc::clone(&scheduler),
            gate,
            Arc::clone(&governor),
            probe,
        );

        let kernel = Self {
            config,
            bus,
            state,
            scheduler,
            security,
            governor,
            recovery,
            engine,
            journal,
            metrics,
            timers: Mutex::new(Vec::new()),
            feed: Mutex::new(None),
        };
        kernel.wire_adaptation();
        Ok(kernel)
    }

    fn wire_adaptation(&self) {
        let limit = self.engine.concurrency_limit();
        let ceiling = self.config.engine.max_concurrency;
        let mut governor = lock(&self.governor);
        let adaptive = governor.adaptive_mut();

        let reduce = limit.clone();
        adaptive.on_action(AdaptationAction::ReduceConcurrency, move |_, snapshot| {
            let now = reduce.reduce(1);
            info!(limit = now, cpu = snapshot.cpu_percent, "concurrency reduced");
            Ok(())
        });

        let restore = AdaptationAction::Custom(RESTORE_CONCURRENCY.to_string());
        if self.config.governance.default_rules {
            let below = limit.clone();
            adaptive.add_rule(AdaptationRule::new(
                "load-normal",
                move |s: &ResourceSnapshot| {
                    below.get() < ceiling && s.cpu_percent < 50.0 && s.memory_percent() < 70.0
                },
                vec![restore.clone()],
                Duration::from_secs(30),
            ));
        }
        adaptive.on_action(restore, move |_, _| {
            let now = limit.raise(1, ceiling);
            info!(limit = now, "concurrency restored");
            Ok(())
        });
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Go active, start the timers and the recovery feed, and dispatch
    /// anything already queued.  Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidTransition`] unless the kernel is in `init`.
    pub fn start(&self) -> Result<(), KernelError> {
        let current = self.state();
        if current != KernelState::Init {
            return Err(KernelError::InvalidTransition {
                from: current,
                to: KernelState::Active,
            });
        }
        self.transition(KernelState::Active, "start")?;
        self.start_services();
        self.engine.pump();
        Ok(())
    }

    /// Stop dispatching.  Running tasks continue.
    pub fn pause(&self) -> Result<StateTransition, KernelError> {
        self.transition(KernelState::Paused, "pause")
    }

    /// Back to `active` from `paused` only; use [`start`](Self::start) from
    /// `init`.
    pub fn resume(&self) -> Result<StateTransition, KernelError> {
        let current = self.state();
        if current != KernelState::Paused {
            return Err(KernelError::InvalidTransition {
                from: current,
                to: KernelState::Active,
            });
        }
        let transition = self.transition(KernelState::Active, "resume")?;
        self.engine.pump();
        Ok(transition)
    }

    /// Enter `shutdown`, stop the timers and cancel all work.  Returns
    /// whether every running task settled within the grace period.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidTransition`] when already shut down.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<bool, KernelError> {
        self.transition(KernelState::Shutdown, "shutdown")?;
        self.stop_services();
        let drained = self.engine.shutdown().await;
        info!(drained, "kernel shut down");
        Ok(drained)
    }

    /// Move the state machine directly.  Unlike [`start`](Self::start) and
    /// [`shutdown`](Self::shutdown) this touches nothing else.
    pub fn transition(
        &self,
        target: KernelState,
        reason: &str,
    ) -> Result<StateTransition, KernelError> {
        lock(&self.state).transition(target, reason)
    }

    pub fn state(&self) -> KernelState {
        lock(&self.state).current()
    }

    fn start_services(&self) {
        let mut timers = lock(&self.timers);
        if !timers.is_empty() {
            return;
        }
        let t = &self.config.timers;

        let (scheduler, engine) = (Arc::clone(&self.scheduler), self.engine.clone());
        timers.push(IntervalTimer::start("scheduler-clock", t.tick_interval, move || {
            lock(&scheduler).tick();
            engine.pump();
        }));

        let governor = Arc::clone(&self.governor);
        timers.push(IntervalTimer::start("resource-sampler", t.sample_interval, move || {
            lock(&governor).on_sample();
        }));

        let (recovery, security) = (Arc::clone(&self.recovery), Arc::clone(&self.security));
        timers.push(IntervalTimer::start("heartbeat-sweep", t.heartbeat_interval, move || {
            let found = lock(&recovery).check_heartbeats();
            if !found.is_empty() {
                debug!(count = found.len(), "heartbeat failures recorded");
            }
            let tracked = lock(&security).prune_rate_limits();
            debug!(tracked, "rate-limit keys pruned");
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.bus.on(Topic::Scheduling, move |event| {
            if matches!(
                event.payload,
                EventPayload::TaskCompleted { .. } | EventPayload::TaskFailed { .. }
            ) && tx.send(event.clone()).is_err()
            {
                debug!("recovery feed has stopped");
            }
        });
        let (scheduler, recovery) = (Arc::clone(&self.scheduler), Arc::clone(&self.recovery));
        tokio::spawn(recovery_feed(rx, scheduler, recovery));
        *lock(&self.feed) = Some(listener);
        info!("kernel services started");
    }

    /// Stops the timers.  Unsubscribing the feed listener closes its
    /// channel; the feed drains what is queued and then exits.
    fn stop_services(&self) {
        for mut timer in lock(&self.timers).drain(..) {
            timer.stop();
        }
        if let Some(listener) = lock(&self.feed).take() {
            self.bus.unsubscribe(listener);
        }
    }

    // ── tasks ───────────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        name: &str,
        task_type: &str,
        source_id: &str,
        source_kind: EntityKind,
        payload: Value,
        options: TaskOptions,
    ) -> Task {
        lock(&self.scheduler).create_task(name, task_type, source_id, source_kind, payload, options)
    }

    /// Queue a task with the scheduler only.  Nothing executes it; callers
    /// pull it through [`Scheduler::get_next_task`].
    pub fn schedule(&self, task: Task) -> Result<TaskId, KernelError> {
        lock(&self.scheduler).schedule(task)
    }

    /// Queue a task for execution by the engine.
    pub fn submit(
        &self,
        task: Task,
        executor: Executor,
        budget: Option<BudgetUpdate>,
    ) -> Result<TaskId, KernelError> {
        self.engine.submit(task, executor, budget)
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.engine.cancel(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        lock(&self.scheduler).task(task_id).cloned()
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        lock(&self.scheduler).status(task_id)
    }

    /// Wait until the task reaches a terminal status or `timeout` elapses.
    /// Returns the status at that point; `None` for unknown tasks.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Option<TaskStatus> {
        let mut rx = self.bus.subscribe_to(Topic::Scheduling);
        let wait = async {
            loop {
                match self.task_status(task_id) {
                    Some(s) if !s.is_terminal() => {}
                    other => return other,
                }
                match rx.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return self.task_status(task_id),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(status) => status,
            Err(_) => self.task_status(task_id),
        }
    }

    // ── security & budgets ──────────────────────────────────────────────────

    pub fn check_permission(
        &self,
        kind: &EntityKind,
        id: &str,
        permission: &str,
        resource: Option<&str>,
    ) -> AccessDecision {
        lock(&self.security).check_permission(kind, id, permission, resource)
    }

    pub fn add_policy(&self, policy: Policy) {
        lock(&self.security).add_policy(policy);
    }

    pub fn set_budget(&self, kind: &EntityKind, id: &str, update: BudgetUpdate) -> ResourceBudget {
        lock(&self.governor).budgets_mut().update(kind, id, update)
    }

    pub fn audit_query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        lock(&self.security).audit_query(filter)
    }

    pub fn audit_summary(&self) -> AuditSummary {
        lock(&self.security).audit_summary()
    }

    // ── recovery ────────────────────────────────────────────────────────────

    pub fn detect_failure(
        &self,
        kind: &EntityKind,
        id: &str,
        failure_kind: FailureKind,
        severity: Severity,
        message: &str,
    ) -> FailureRecord {
        lock(&self.recovery).detect_failure(kind, id, failure_kind, severity, message)
    }

    pub fn heartbeat(&self, kind: &EntityKind, id: &str) {
        lock(&self.recovery).heartbeat(kind, id);
    }

    pub fn check_heartbeat(&self, kind: &EntityKind, id: &str) -> Option<FailureRecord> {
        lock(&self.recovery).check_heartbeat(kind, id)
    }

    pub fn record_outcome(&self, kind: &EntityKind, id: &str, success: bool) {
        lock(&self.recovery).record_outcome(kind, id, success);
    }

    pub fn check_error_rate(&self, kind: &EntityKind, id: &str) -> Option<FailureRecord> {
        lock(&self.recovery).check_error_rate(kind, id)
    }

    pub fn recover(
        &self,
        record_id: &str,
        action: Option<RecoveryAction>,
    ) -> Result<FailureRecord, KernelError> {
        lock(&self.recovery).recover(record_id, action)
    }

    pub fn resolve_escalation(
        &self,
        record_id: &str,
        recovered: bool,
    ) -> Result<FailureRecord, KernelError> {
        lock(&self.recovery).resolve_escalation(record_id, recovered)
    }

    pub fn on_restart<F>(&self, kind: EntityKind, handler: F)
    where
        F: Fn(&FailureRecord) -> Result<(), String> + Send + Sync + 'static,
    {
        lock(&self.recovery).executor_mut().on_restart(kind, handler);
    }

    pub fn on_reload<F>(&self, kind: EntityKind, handler: F)
    where
        F: Fn(&FailureRecord, &Checkpoint) -> Result<(), String> + Send + Sync + 'static,
    {
        lock(&self.recovery).executor_mut().on_reload(kind, handler);
    }

    pub fn save_state(&self, kind: &EntityKind, id: &str, state: Value) -> Checkpoint {
        lock(&self.recovery).save_state(kind, id, state)
    }

    pub fn restore_state(&self, kind: &EntityKind, id: &str) -> Option<Checkpoint> {
        lock(&self.recovery).restore_state(kind, id)
    }

    pub fn failures(&self, filter: &FailureFilter) -> Vec<FailureRecord> {
        lock(&self.recovery).failures(filter)
    }

    /// Newest first.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        lock(&self.recovery)
            .checkpoints()
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    // ── observation ─────────────────────────────────────────────────────────

    pub fn scheduler_stats(&self) -> SchedulerStats {
        lock(&self.scheduler).stats()
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Latest host sample, if any was taken.
    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        lock(&self.governor).monitor().latest().copied()
    }

    /// Sample the host now and run adaptation.
    pub fn sample(&self) -> ResourceSnapshot {
        lock(&self.governor).on_sample()
    }

    pub fn aggregate(&self, window: Duration) -> Option<ResourceAggregate> {
        lock(&self.governor).monitor().aggregate(window)
    }

    pub fn subscribe(&self, topic: Topic) -> TopicReceiver {
        self.bus.subscribe_to(topic)
    }

    /// Every metric, with the live queue and engine figures refreshed as
    /// gauges first.
    pub fn metrics(&self) -> MetricsSnapshot {
        let scheduler = self.scheduler_stats();
        let engine = self.engine_stats();
        let mut metrics = lock(&self.metrics);
        metrics.set_gauge("scheduler.queued", scheduler.queued as f64);
        metrics.set_gauge("scheduler.ready", scheduler.ready as f64);
        metrics.set_gauge("scheduler.held", scheduler.held as f64);
        metrics.set_gauge("engine.running", engine.running as f64);
        metrics.set_gauge("engine.backing_off", engine.backing_off as f64);
        metrics.set_gauge("engine.max_concurrency", engine.max_concurrency as f64);
        metrics.snapshot()
    }

    /// [`metrics`](Self::metrics) in Prometheus text format.
    pub fn export_metrics(&self) -> String {
        self.metrics().to_prometheus()
    }

    /// Journaled events whose payload kind is `kind`, e.g. `"task_failed"`.
    pub fn events_by_kind(&self, kind: &str) -> Vec<RecordedEvent> {
        lock(&self.journal).by_kind(kind).into_iter().cloned().collect()
    }

    /// The newest `n` journaled events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<RecordedEvent> {
        lock(&self.journal).tail(n).into_iter().cloned().collect()
    }

    // ── component access ────────────────────────────────────────────────────

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn state_machine(&self) -> MutexGuard<'_, StateMachine> {
        lock(&self.state)
    }

    pub fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        lock(&self.scheduler)
    }

    pub fn security(&self) -> MutexGuard<'_, SecurityManager> {
        lock(&self.security)
    }

    pub fn governor(&self) -> MutexGuard<'_, ResourceGovernor> {
        lock(&self.governor)
    }

    pub fn recovery(&self) -> MutexGuard<'_, RecoveryManager> {
        lock(&self.recovery)
    }

    pub fn journal(&self) -> MutexGuard<'_, EventJournal> {
        lock(&self.journal)
    }

    pub fn metrics_collector(&self) -> MutexGuard<'_, MetricsCollector> {
        lock(&self.metrics)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop_services();
        self.engine.cancel_all("kernel dropped");
    }
}

fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery feed
// ─────────────────────────────────────────────────────────────────────────────

/// How a terminal task failure is recorded.  Kills and denials are not
/// failures of the entity.
pub fn failure_class(reason: &FailureReason) -> Option<(FailureKind, Severity)> {
    match reason {
        FailureReason::Timeout { .. } => Some((FailureKind::Timeout, Severity::Medium)),
        FailureReason::LimitExceeded { .. } => Some((FailureKind::ResourceExhaustion, Severity::High)),
        FailureReason::Executor(_) => Some((FailureKind::Error, Severity::Medium)),
        FailureReason::Killed | FailureReason::Unauthorized(_) => None,
    }
}

async fn recovery_feed(
    mut rx: mpsc::UnboundedReceiver<KernelEvent>,
    scheduler: Shared<Scheduler>,
    recovery: Shared<RecoveryManager>,
) {
    while let Some(event) = rx.recv().await {
        apply_outcome(&event, &scheduler, &recovery);
    }
    debug!("recovery feed stopped");
}

fn apply_outcome(event: &KernelEvent, scheduler: &Shared<Scheduler>, recovery: &Shared<RecoveryManager>) {
    match &event.payload {
        EventPayload::TaskCompleted { task_id, .. } => {
            let source = lock(scheduler)
                .task(task_id)
                .map(|t| (t.source_kind.clone(), t.source_id.clone()));
            if let Some((kind, id)) = source {
                lock(recovery).record_outcome(&kind, &id, true);
            }
        }
        EventPayload::TaskFailed {
            task_id,
            source_kind,
            source_id,
            reason,
            will_retry,
            ..
        } => {
            let Some((kind, severity)) = failure_class(reason) else {
                return;
            };
            let mut recovery = lock(recovery);
            recovery.record_outcome(source_kind, source_id, false);
            if !will_retry {
                recovery.detect_failure(
                    source_kind,
                    source_id,
                    kind,
                    severity,
                    format!("task {task_id} failed: {reason}"),
                );
            }
            recovery.check_error_rate(source_kind, source_id);
        }
        _ => {}
    }
}
