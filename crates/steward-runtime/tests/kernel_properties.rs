//! End-to-end behaviour of a wired kernel.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use steward_governance::{NullProbe, StaticSampler};
use steward_kernel::{AuditFilter, Policy, SchedulerConfig};
use steward_middleware::Topic;
use steward_runtime::{EngineConfig, Kernel, KernelConfig, executor};
use steward_types::{
    EntityKind, EventPayload, FailureReason, KernelError, Severity, TaskOptions, TaskStatus,
};

const AGENT: &str = "agent-1";
const WAIT: Duration = Duration::from_secs(5);

fn kernel_with(config: KernelConfig) -> Kernel {
    Kernel::with_sources(
        config,
        Box::new(StaticSampler::default()),
        Arc::new(NullProbe),
    )
    .unwrap()
}

fn fast_config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.engine = EngineConfig {
        poll_interval: Duration::from_millis(5),
        backoff_base: Duration::from_millis(5),
        process_probe: false,
        ..EngineConfig::default()
    };
    config
}

fn task(kernel: &Kernel, name: &str, options: TaskOptions) -> steward_types::Task {
    kernel.create_task(name, "test", AGENT, EntityKind::Agent, json!({}), options)
}

// ── scheduling ──────────────────────────────────────────────────────────────

#[test]
fn higher_priority_is_handed_out_first() {
    let kernel = kernel_with(KernelConfig::default());
    let low = task(&kernel, "low", TaskOptions::default().priority(3));
    let high = task(&kernel, "high", TaskOptions::default().priority(9));
    kernel.schedule(low.clone()).unwrap();
    kernel.schedule(high.clone()).unwrap();

    let mut scheduler = kernel.scheduler();
    assert_eq!(scheduler.get_next_task().unwrap().id, high.id);
    assert_eq!(scheduler.get_next_task().unwrap().id, low.id);
    assert!(scheduler.get_next_task().is_none());
}

#[test]
fn dependency_gates_eligibility_until_completed() {
    let kernel = kernel_with(KernelConfig::default());
    let first = task(&kernel, "first", TaskOptions::default());
    let second = task(&kernel, "second", TaskOptions::default().depends_on(first.id.clone()));

    kernel.schedule(second.clone()).unwrap();
    assert!(kernel.scheduler().get_next_task().is_none());
    kernel.scheduler().tick();
    assert!(kernel.scheduler().get_next_task().is_none());
    assert_eq!(kernel.task_status(&second.id), Some(TaskStatus::Pending));

    kernel.schedule(first.clone()).unwrap();
    let mut scheduler = kernel.scheduler();
    let next = scheduler.get_next_task().unwrap();
    assert_eq!(next.id, first.id);
    assert!(scheduler.get_next_task().is_none());

    scheduler.complete_task(&first.id, json!("done"), None).unwrap();
    scheduler.tick();
    assert_eq!(scheduler.get_next_task().unwrap().id, second.id);
}

#[test]
fn full_queue_rejects_new_tasks() {
    let mut config = KernelConfig::default();
    config.scheduler = SchedulerConfig {
        max_queue_size: 2,
        ..SchedulerConfig::default()
    };
    let kernel = kernel_with(config);
    kernel.schedule(task(&kernel, "a", TaskOptions::default())).unwrap();
    kernel.schedule(task(&kernel, "b", TaskOptions::default())).unwrap();

    let err = kernel
        .schedule(task(&kernel, "c", TaskOptions::default()))
        .unwrap_err();
    assert!(matches!(err, KernelError::QueueFull { capacity: 2 }));
    assert_eq!(kernel.scheduler_stats().queued, 2);
}

// ── execution ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn finished_tasks_stay_finished() {
    let kernel = kernel_with(fast_config());
    kernel.start().unwrap();
    let t = task(&kernel, "quick", TaskOptions::default());
    let id = kernel
        .submit(t, executor(|_| async { Ok(json!(42)) }), None)
        .unwrap();

    assert_eq!(kernel.wait_for(&id, WAIT).await, Some(TaskStatus::Completed));
    assert_eq!(kernel.task(&id).unwrap().result, Some(json!(42)));

    assert!(!kernel.cancel(&id));
    assert_eq!(kernel.scheduler().cancel_task(&id, "late"), Ok(false));
    let mut finished = kernel.task(&id).unwrap();
    assert!(finished.transition(TaskStatus::Running).is_err());
    assert_eq!(kernel.task_status(&id), Some(TaskStatus::Completed));
    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn timeout_fails_the_task_and_reports_usage_once() {
    let kernel = kernel_with(fast_config());
    let mut events = kernel.subscribe(Topic::Scheduling);
    kernel.start().unwrap();

    let options = TaskOptions::default()
        .timeout(Duration::from_millis(30))
        .max_retries(0);
    let id = kernel
        .submit(
            task(&kernel, "slow", options),
            executor(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }),
            None,
        )
        .unwrap();

    assert_eq!(kernel.wait_for(&id, WAIT).await, Some(TaskStatus::Failed));
    assert!(!kernel.engine().is_running(&id));
    assert!(kernel.task(&id).unwrap().error.unwrap().contains("timeout"));

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let EventPayload::TaskFailed {
            task_id,
            reason,
            usage,
            ..
        } = event.payload
        {
            if task_id == id {
                failures += 1;
                assert!(matches!(reason, FailureReason::Timeout { .. }));
                assert!(usage.is_some());
            }
        }
    }
    assert_eq!(failures, 1);
    assert_eq!(kernel.engine_stats().timed_out, 1);
    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn retries_stop_at_the_ceiling() {
    let kernel = kernel_with(fast_config());
    kernel.start().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);

    let id = kernel
        .submit(
            task(&kernel, "flaky", TaskOptions::default().max_retries(2)),
            executor(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }
            }),
            None,
        )
        .unwrap();

    assert_eq!(kernel.wait_for(&id, WAIT).await, Some(TaskStatus::Failed));
    let finished = kernel.task(&id).unwrap();
    assert_eq!(finished.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(kernel.engine_stats().retried, 2);
    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn task_without_grant_is_denied_and_audited() {
    let kernel = kernel_with(fast_config());
    kernel.start().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);

    let options = TaskOptions::default().requires("storage:write");
    let id = kernel
        .submit(
            task(&kernel, "write", options),
            executor(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            }),
            None,
        )
        .unwrap();

    assert_eq!(kernel.wait_for(&id, WAIT).await, Some(TaskStatus::Failed));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.task(&id).unwrap().retry_count, 0);
    let denied = kernel.audit_query(&AuditFilter {
        allowed: Some(false),
        ..AuditFilter::default()
    });
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].permission, "storage:write");
    kernel.shutdown().await.unwrap();
}

// ── security ────────────────────────────────────────────────────────────────

#[test]
fn unconstrained_policy_grants_and_disabled_permission_denies() {
    let kernel = kernel_with(KernelConfig::default());
    kernel.add_policy(Policy::new("readers", EntityKind::Agent).allow("storage:read"));

    let granted = kernel.check_permission(&EntityKind::Agent, AGENT, "storage:read", None);
    assert!(granted.allowed);
    assert_eq!(granted.policy.as_deref(), Some("readers"));

    kernel
        .security()
        .set_permission_enabled("storage:read", false)
        .unwrap();
    for _ in 0..3 {
        let d = kernel.check_permission(&EntityKind::Agent, AGENT, "storage:read", None);
        assert!(!d.allowed);
    }
    assert_eq!(kernel.audit_summary().denied, 3);
}

// ── recovery ────────────────────────────────────────────────────────────────

#[test]
fn checkpoint_versions_increase_and_state_round_trips() {
    let kernel = kernel_with(KernelConfig::default());
    let state = json!({ "cursor": 17, "seen": ["a", "b"], "nested": { "ok": true } });

    let first = kernel.save_state(&EntityKind::Module, "indexer", json!({}));
    let second = kernel.save_state(&EntityKind::Module, "indexer", state.clone());
    assert_eq!(second.version, first.version + 1);

    let restored = kernel
        .restore_state(&EntityKind::Module, "indexer")
        .unwrap();
    assert_eq!(restored.version, second.version);
    assert_eq!(restored.state, state);
    assert!(kernel.restore_state(&EntityKind::Module, "other").is_none());
}

#[test]
fn stale_heartbeat_is_high_then_critical() {
    let mut config = KernelConfig::default();
    config.recovery.detector.heartbeat_timeout = Duration::from_millis(100);
    let kernel = kernel_with(config);

    kernel.heartbeat(&EntityKind::Agent, AGENT);
    assert!(kernel.check_heartbeat(&EntityKind::Agent, AGENT).is_none());

    std::thread::sleep(Duration::from_millis(130));
    let stale = kernel.check_heartbeat(&EntityKind::Agent, AGENT).unwrap();
    assert_eq!(stale.severity, Severity::High);

    std::thread::sleep(Duration::from_millis(100));
    let dead = kernel.check_heartbeat(&EntityKind::Agent, AGENT).unwrap();
    assert_eq!(dead.severity, Severity::Critical);
    assert!(kernel.check_heartbeat(&EntityKind::Agent, AGENT).is_none());
}
