//! Recovery Manager – failure records, recovery actions and checkpoints.
//!
//! Failures enter through [`RecoveryManager::detect_failure`] or one of the
//! detector checks (heartbeat staleness, error rate).  With auto-recovery on,
//! each new record is handed straight to the [`RecoveryExecutor`]; otherwise
//! it waits for [`RecoveryManager::recover`].  A record's status only moves
//! forward: `pending -> recovered | failed`.

pub mod checkpoint;
pub mod detector;
pub mod executor;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use detector::{DetectorConfig, FailureDetector, FailureRecord, RecoveryStatus, choose_action};
pub use executor::{RecoveryExecutor, RecoveryOutcome};

use std::collections::VecDeque;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use steward_middleware::EventBus;
use steward_types::{EntityKind, EventPayload, FailureKind, KernelError, RecoveryAction, Severity};
use tracing::{error, info, warn};

const SOURCE: &str = "steward-kernel::recovery";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run the chosen action as soon as a failure is recorded.
    pub auto_recovery: bool,
    /// Records kept; the oldest resolved ones are dropped first.
    pub max_records: usize,
    pub detector: DetectorConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recovery: true,
            max_records: 1000,
            detector: DetectorConfig::default(),
        }
    }
}

/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct FailureFilter {
    pub entity_kind: Option<EntityKind>,
    pub entity_id: Option<String>,
    pub kind: Option<FailureKind>,
    pub status: Option<RecoveryStatus>,
    pub min_severity: Option<Severity>,
}

impl FailureFilter {
    fn matches(&self, r: &FailureRecord) -> bool {
        self.entity_kind.as_ref().is_none_or(|k| k == &r.entity_kind)
            && self.entity_id.as_deref().is_none_or(|id| id == r.entity_id)
            && self.kind.is_none_or(|k| k == r.kind)
            && self.status.is_none_or(|s| s == r.status)
            && self.min_severity.is_none_or(|s| r.severity >= s)
    }
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    detector: FailureDetector,
    checkpoints: CheckpointStore,
    executor: RecoveryExecutor,
    records: VecDeque<FailureRecord>,
    bus: EventBus,
}

impl RecoveryManager {
    pub fn new(bus: EventBus) -> Self {
        Self::with_config(bus, RecoveryConfig::default())
    }

    pub fn with_config(bus: EventBus, config: RecoveryConfig) -> Self {
        Self {
            detector: FailureDetector::new(config.detector.clone()),
            config,
            checkpoints: CheckpointStore::new(),
            executor: RecoveryExecutor::new(),
            records: VecDeque::new(),
            bus,
        }
    }

    pub fn auto_recovery(&self) -> bool {
        self.config.auto_recovery
    }

    pub fn set_auto_recovery(&mut self, enabled: bool) {
        self.config.auto_recovery = enabled;
    }

    pub fn executor_mut(&mut self) -> &mut RecoveryExecutor {
        &mut self.executor
    }

    // ── detection ───────────────────────────────────────────────────────────

    /// Record a failure observed by the caller.  Returns the record as it
    /// stands after auto-recovery (if enabled).
    pub fn detect_failure(
        &mut self,
        kind: &EntityKind,
        id: &str,
        failure_kind: FailureKind,
        severity: Severity,
        message: impl Into<String>,
    ) -> FailureRecord {
        let record = self
            .detector
            .detect_failure(kind, id, failure_kind, severity, message);
        self.admit(record)
    }

    pub fn heartbeat(&mut self, kind: &EntityKind, id: &str) {
        self.detector.heartbeat(kind, id);
    }

    pub fn check_heartbeat(&mut self, kind: &EntityKind, id: &str) -> Option<FailureRecord> {
        let record = self.detector.check_heartbeat(kind, id)?;
        Some(self.admit(record))
    }

    /// Sweep every entity that has sent a heartbeat.
    pub fn check_heartbeats(&mut self) -> Vec<FailureRecord> {
        self.detector
            .check_all_heartbeats(Instant::now())
            .into_iter()
            .map(|r| self.admit(r))
            .collect()
    }

    pub fn record_outcome(&mut self, kind: &EntityKind, id: &str, success: bool) {
        self.detector.record_outcome(kind, id, success);
    }

    pub fn check_error_rate(&mut self, kind: &EntityKind, id: &str) -> Option<FailureRecord> {
        let record = self.detector.check_error_rate(kind, id)?;
        Some(self.admit(record))
    }

    pub fn error_rate(&self, kind: &EntityKind, id: &str) -> Option<f64> {
        self.detector.error_rate(kind, id)
    }

    fn admit(&mut self, record: FailureRecord) -> FailureRecord {
        warn!(
            record_id = %record.id,
            entity = %record.entity_id,
            kind = %record.kind,
            severity = %record.severity,
            action = %record.action,
            "failure detected"
        );
        self.bus.emit(
            SOURCE,
            EventPayload::FailureDetected {
                record_id: record.id.clone(),
                entity_kind: record.entity_kind.clone(),
                entity_id: record.entity_id.clone(),
                kind: record.kind,
                severity: record.severity,
                action: record.action,
            },
        );
        let id = record.id.clone();
        self.records.push_back(record.clone());
        self.evict();
        if !self.config.auto_recovery {
            return record;
        }
        match self.recover(&id, None) {
            Ok(updated) => updated,
            Err(e) => {
                error!(record_id = %id, error = %e, "auto-recovery failed to run");
                record
            }
        }
    }

    fn evict(&mut self) {
        while self.records.len() > self.config.max_records.max(1) {
            let victim = self
                .records
                .iter()
                .position(|r| r.status != RecoveryStatus::Pending)
                .unwrap_or(0);
            self.records.remove(victim);
        }
    }

    // ── recovery ────────────────────────────────────────────────────────────

    /// Run `action` (or the record's chosen action) for a pending record.
    ///
    /// # Errors
    ///
    /// [`KernelError::FailureNotFound`] for unknown ids and
    /// [`KernelError::AlreadyResolved`] when the record is no longer pending.
    pub fn recover(
        &mut self,
        record_id: &str,
        action: Option<RecoveryAction>,
    ) -> Result<FailureRecord, KernelError> {
        let idx = self.index_of(record_id)?;
        let record = &mut self.records[idx];
        if record.status != RecoveryStatus::Pending {
            return Err(KernelError::AlreadyResolved(record_id.to_string()));
        }
        let action = action.unwrap_or(record.action);
        record.action = action;
        record.attempts += 1;

        let outcome = self.executor.execute(record, action, &self.checkpoints);
        match outcome {
            RecoveryOutcome::Recovered => {
                record.status = RecoveryStatus::Recovered;
                record.resolved_at = Some(Utc::now());
                info!(%record_id, %action, "recovered");
                self.bus.emit(
                    SOURCE,
                    EventPayload::Recovered {
                        record_id: record_id.to_string(),
                        action,
                    },
                );
            }
            RecoveryOutcome::Reloaded { version } => {
                record.status = RecoveryStatus::Recovered;
                record.resolved_at = Some(Utc::now());
                let (entity_kind, entity_id) = (record.entity_kind.clone(), record.entity_id.clone());
                info!(%record_id, version, "recovered from checkpoint");
                self.bus.emit(
                    SOURCE,
                    EventPayload::CheckpointRestored {
                        entity_kind,
                        entity_id,
                        version,
                    },
                );
                self.bus.emit(
                    SOURCE,
                    EventPayload::Recovered {
                        record_id: record_id.to_string(),
                        action,
                    },
                );
            }
            RecoveryOutcome::Failed(reason) => {
                record.status = RecoveryStatus::Failed;
                record.resolved_at = Some(Utc::now());
                warn!(%record_id, %action, %reason, "recovery failed");
                self.bus.emit(
                    SOURCE,
                    EventPayload::RecoveryFailed {
                        record_id: record_id.to_string(),
                        action,
                        reason,
                    },
                );
            }
            RecoveryOutcome::Escalated => {
                record.escalated = true;
                let message = format!(
                    "{} {} failure needs an operator: {}",
                    record.severity, record.kind, record.message
                );
                let (entity_kind, entity_id) = (record.entity_kind.clone(), record.entity_id.clone());
                error!(%record_id, entity = %entity_id, "failure escalated");
                self.bus.emit(
                    SOURCE,
                    EventPayload::Escalation {
                        record_id: record_id.to_string(),
                        entity_kind,
                        entity_id,
                        message,
                    },
                );
            }
        }
        Ok(self.records[idx].clone())
    }

    /// Close an escalated (or any pending) record by operator decision.
    pub fn resolve_escalation(
        &mut self,
        record_id: &str,
        recovered: bool,
    ) -> Result<FailureRecord, KernelError> {
        let idx = self.index_of(record_id)?;
        let record = &mut self.records[idx];
        if record.status != RecoveryStatus::Pending {
            return Err(KernelError::AlreadyResolved(record_id.to_string()));
        }
        record.resolved_at = Some(Utc::now());
        let action = record.action;
        if recovered {
            record.status = RecoveryStatus::Recovered;
            self.bus.emit(
                SOURCE,
                EventPayload::Recovered {
                    record_id: record_id.to_string(),
                    action,
                },
            );
        } else {
            record.status = RecoveryStatus::Failed;
            self.bus.emit(
                SOURCE,
                EventPayload::RecoveryFailed {
                    record_id: record_id.to_string(),
                    action,
                    reason: "resolved as failed by operator".to_string(),
                },
            );
        }
        info!(%record_id, recovered, "escalation resolved");
        Ok(self.records[idx].clone())
    }

    fn index_of(&self, record_id: &str) -> Result<usize, KernelError> {
        self.records
            .iter()
            .position(|r| r.id == record_id)
            .ok_or_else(|| KernelError::FailureNotFound(record_id.to_string()))
    }

    pub fn failure(&self, record_id: &str) -> Option<&FailureRecord> {
        self.records.iter().find(|r| r.id == record_id)
    }

    /// Matching records, oldest first.
    pub fn failures(&self, filter: &FailureFilter) -> Vec<FailureRecord> {
        self.records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    // ── checkpoints ─────────────────────────────────────────────────────────

    pub fn save_state(
        &mut self,
        kind: &EntityKind,
        id: &str,
        state: serde_json::Value,
    ) -> Checkpoint {
        let checkpoint = self.checkpoints.save(kind, id, state).clone();
        self.bus.emit(
            SOURCE,
            EventPayload::CheckpointSaved {
                entity_kind: kind.clone(),
                entity_id: id.to_string(),
                version: checkpoint.version,
            },
        );
        checkpoint
    }

    /// Latest checkpoint, or `None` when the entity never saved one.
    pub fn restore_state(&self, kind: &EntityKind, id: &str) -> Option<Checkpoint> {
        let checkpoint = self.checkpoints.restore(kind, id)?.clone();
        self.bus.emit(
            SOURCE,
            EventPayload::CheckpointRestored {
                entity_kind: kind.clone(),
                entity_id: id.to_string(),
                version: checkpoint.version,
            },
        );
        Some(checkpoint)
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn remove_checkpoint(&mut self, kind: &EntityKind, id: &str) -> bool {
        self.checkpoints.remove(kind, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use steward_middleware::Topic;

    fn manual() -> RecoveryManager {
        RecoveryManager::with_config(
            EventBus::default(),
            RecoveryConfig {
                auto_recovery: false,
                ..RecoveryConfig::default()
            },
        )
    }

    #[test]
    fn manual_mode_leaves_records_pending() {
        let mut rm = manual();
        let r = rm.detect_failure(&EntityKind::Agent, "a", FailureKind::Timeout, Severity::Low, "slow");
        assert_eq!(r.status, RecoveryStatus::Pending);
        assert_eq!(r.action, RecoveryAction::Skip);
        let r = rm.recover(&r.id, None).unwrap();
        assert_eq!(r.status, RecoveryStatus::Recovered);
        assert_eq!(r.attempts, 1);
        assert!(r.resolved_at.is_some());
    }

    #[test]
    fn status_only_moves_forward() {
        let mut rm = manual();
        let r = rm.detect_failure(&EntityKind::Agent, "a", FailureKind::Crash, Severity::Low, "x");
        let r = rm.recover(&r.id, None).unwrap();
        assert_eq!(r.status, RecoveryStatus::Failed);
        assert!(matches!(
            rm.recover(&r.id, Some(RecoveryAction::Skip)),
            Err(KernelError::AlreadyResolved(_))
        ));
        assert!(matches!(
            rm.resolve_escalation(&r.id, true),
            Err(KernelError::AlreadyResolved(_))
        ));
        assert!(matches!(
            rm.recover("missing", None),
            Err(KernelError::FailureNotFound(_))
        ));
    }

    #[test]
    fn auto_recovery_restarts_via_handler() {
        let mut rm = RecoveryManager::new(EventBus::default());
        let restarted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&restarted);
        rm.executor_mut().on_restart(EntityKind::Module, move |r| {
            log.lock().unwrap().push(r.entity_id.clone());
            Ok(())
        });
        let r = rm.detect_failure(&EntityKind::Module, "indexer", FailureKind::Crash, Severity::High, "segv");
        assert_eq!(r.status, RecoveryStatus::Recovered);
        assert_eq!(*restarted.lock().unwrap(), vec!["indexer".to_string()]);
    }

    #[test]
    fn reload_uses_latest_checkpoint() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Recovery);
        let mut rm = RecoveryManager::new(bus);
        let applied = Arc::new(Mutex::new(None));
        let a = Arc::clone(&applied);
        rm.executor_mut().on_reload(EntityKind::Agent, move |_, cp| {
            *a.lock().unwrap() = Some(cp.state.clone());
            Ok(())
        });
        rm.save_state(&EntityKind::Agent, "a", json!({"step": 1}));
        rm.save_state(&EntityKind::Agent, "a", json!({"step": 2}));
        let r = rm.detect_failure(
            &EntityKind::Agent,
            "a",
            FailureKind::ResourceExhaustion,
            Severity::Medium,
            "oom",
        );
        assert_eq!(r.status, RecoveryStatus::Recovered);
        assert_eq!(*applied.lock().unwrap(), Some(json!({"step": 2})));

        let mut restored_version = None;
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::CheckpointRestored { version, .. } = event.payload {
                restored_version = Some(version);
            }
        }
        assert_eq!(restored_version, Some(2));
    }

    #[test]
    fn reload_without_checkpoint_fails() {
        let mut rm = RecoveryManager::new(EventBus::default());
        rm.executor_mut().on_reload(EntityKind::Agent, |_, _| Ok(()));
        let r = rm.detect_failure(
            &EntityKind::Agent,
            "fresh",
            FailureKind::ResourceExhaustion,
            Severity::Low,
            "oom",
        );
        assert_eq!(r.status, RecoveryStatus::Failed);
    }

    #[test]
    fn critical_failures_escalate_and_wait_for_operator() {
        let bus = EventBus::default();
        let escalations = Arc::new(Mutex::new(0));
        let e = Arc::clone(&escalations);
        bus.on(Topic::Recovery, move |event| {
            if matches!(event.payload, EventPayload::Escalation { .. }) {
                *e.lock().unwrap() += 1;
            }
        });
        let mut rm = RecoveryManager::new(bus);
        let r = rm.detect_failure(&EntityKind::System, "core", FailureKind::Crash, Severity::Critical, "panic");
        assert_eq!(r.action, RecoveryAction::Escalate);
        assert_eq!(r.status, RecoveryStatus::Pending);
        assert!(r.escalated);
        assert_eq!(*escalations.lock().unwrap(), 1);

        let r = rm.resolve_escalation(&r.id, true).unwrap();
        assert_eq!(r.status, RecoveryStatus::Recovered);
    }

    #[test]
    fn restore_state_is_explicit_about_absence() {
        let mut rm = manual();
        assert!(rm.restore_state(&EntityKind::Agent, "a").is_none());
        let cp = rm.save_state(&EntityKind::Agent, "a", json!([1, 2]));
        assert_eq!(cp.version, 1);
        assert_eq!(rm.restore_state(&EntityKind::Agent, "a").unwrap().state, json!([1, 2]));
        assert!(rm.remove_checkpoint(&EntityKind::Agent, "a"));
        assert!(rm.restore_state(&EntityKind::Agent, "a").is_none());
    }

    #[test]
    fn failure_filter() {
        let mut rm = manual();
        rm.detect_failure(&EntityKind::Agent, "a", FailureKind::Error, Severity::Low, "1");
        rm.detect_failure(&EntityKind::Agent, "b", FailureKind::Crash, Severity::High, "2");
        rm.detect_failure(&EntityKind::Module, "m", FailureKind::Timeout, Severity::Critical, "3");

        let agents = rm.failures(&FailureFilter {
            entity_kind: Some(EntityKind::Agent),
            ..FailureFilter::default()
        });
        assert_eq!(agents.len(), 2);
        let severe = rm.failures(&FailureFilter {
            min_severity: Some(Severity::High),
            ..FailureFilter::default()
        });
        assert_eq!(severe.len(), 2);
        let crashes = rm.failures(&FailureFilter {
            kind: Some(FailureKind::Crash),
            status: Some(RecoveryStatus::Pending),
            ..FailureFilter::default()
        });
        assert_eq!(crashes.len(), 1);
    }

    #[test]
    fn error_rate_detection_flows_into_records() {
        let mut rm = manual();
        for _ in 0..10 {
            rm.record_outcome(&EntityKind::Agent, "a", false);
        }
        let r = rm.check_error_rate(&EntityKind::Agent, "a").unwrap();
        assert_eq!(r.kind, FailureKind::Error);
        assert!(rm.failure(&r.id).is_some());
    }

    #[test]
    fn records_are_bounded_preferring_resolved_eviction() {
        let mut rm = RecoveryManager::with_config(
            EventBus::default(),
            RecoveryConfig {
                auto_recovery: false,
                max_records: 2,
                ..RecoveryConfig::default()
            },
        );
        let pending = rm.detect_failure(&EntityKind::Agent, "a", FailureKind::Error, Severity::Low, "1");
        let done = rm.detect_failure(&EntityKind::Agent, "b", FailureKind::Error, Severity::Low, "2");
        rm.recover(&done.id, None).unwrap();
        rm.detect_failure(&EntityKind::Agent, "c", FailureKind::Error, Severity::Low, "3");
        assert!(rm.failure(&pending.id).is_some());
        assert!(rm.failure(&done.id).is_none());
    }
}
