//! [`FailureDetector`] – heartbeat staleness and error-rate detection.
//!
//! Entities (agents, modules, ...) call [`FailureDetector::heartbeat`] at
//! regular intervals and report the outcome of their work with
//! [`FailureDetector::record_outcome`].  The detector turns a stale heartbeat
//! or a sustained error rate into a [`FailureRecord`] whose recovery action
//! is picked by [`choose_action`].
//!
//! The detector does not store records; the recovery manager does.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_types::{EntityKind, FailureKind, RecoveryAction, Severity};
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    Pending,
    Recovered,
    Failed,
}

/// One detected failure and the state of its recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
    pub action: RecoveryAction,
    pub status: RecoveryStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    #[serde(with = "steward_types::duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Number of most recent outcomes kept per entity.
    pub error_window: usize,
    /// Outcomes required before an error rate is judged.
    pub min_samples: usize,
    pub error_rate_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            error_window: 100,
            min_samples: 10,
            error_rate_threshold: 0.5,
        }
    }
}

/// Deterministic mapping from failure to recovery action.
///
/// | condition | action |
/// |---|---|
/// | critical severity | escalate |
/// | crash | restart |
/// | timeout | skip |
/// | resource exhaustion | reload |
/// | error, high | restart |
/// | error, otherwise | skip |
pub fn choose_action(kind: FailureKind, severity: Severity) -> RecoveryAction {
    if severity == Severity::Critical {
        return RecoveryAction::Escalate;
    }
    match kind {
        FailureKind::Crash => RecoveryAction::Restart,
        FailureKind::Timeout => RecoveryAction::Skip,
        FailureKind::ResourceExhaustion => RecoveryAction::Reload,
        FailureKind::Error if severity >= Severity::High => RecoveryAction::Restart,
        FailureKind::Error => RecoveryAction::Skip,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entries
// ────────────────────────────────────────────────────────────────────────────

type EntityKey = (EntityKind, String);

struct HeartbeatEntry {
    last: Instant,
    /// Severity already reported for the current silence.
    reported: Option<Severity>,
}

// ────────────────────────────────────────────────────────────────────────────
// FailureDetector
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use steward_kernel::recovery::FailureDetector;
/// use steward_types::EntityKind;
///
/// let mut detector = FailureDetector::default();
/// detector.heartbeat(&EntityKind::Agent, "planner");
/// assert!(detector.check_heartbeat(&EntityKind::Agent, "planner").is_none());
/// assert!(detector.check_heartbeat(&EntityKind::Agent, "ghost").is_none());
/// ```
#[derive(Default)]
pub struct FailureDetector {
    config: DetectorConfig,
    heartbeats: HashMap<EntityKey, HeartbeatEntry>,
    outcomes: HashMap<EntityKey, VecDeque<bool>>,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            heartbeats: HashMap::new(),
            outcomes: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Build a record for an externally observed failure.
    pub fn detect_failure(
        &self,
        kind: &EntityKind,
        id: &str,
        failure_kind: FailureKind,
        severity: Severity,
        message: impl Into<String>,
    ) -> FailureRecord {
        FailureRecord {
            id: Uuid::new_v4().to_string(),
            entity_kind: kind.clone(),
            entity_id: id.to_string(),
            kind: failure_kind,
            severity,
            message: message.into(),
            action: choose_action(failure_kind, severity),
            status: RecoveryStatus::Pending,
            detected_at: Utc::now(),
            resolved_at: None,
            attempts: 0,
            escalated: false,
        }
    }

    // ── heartbeats ──────────────────────────────────────────────────────────

    /// Record a heartbeat, registering the entity on first contact.
    pub fn heartbeat(&mut self, kind: &EntityKind, id: &str) {
        self.heartbeat_at(kind, id, Instant::now());
    }

    pub fn heartbeat_at(&mut self, kind: &EntityKind, id: &str, at: Instant) {
        self.heartbeats.insert(
            (kind.clone(), id.to_string()),
            HeartbeatEntry {
                last: at,
                reported: None,
            },
        );
    }

    pub fn check_heartbeat(&mut self, kind: &EntityKind, id: &str) -> Option<FailureRecord> {
        self.check_heartbeat_at(kind, id, Instant::now())
    }

    /// `None` for entities that never sent a heartbeat, for fresh ones, and
    /// for silences already reported at the same severity.
    ///
    /// Silence beyond the timeout is a high-severity timeout; beyond twice
    /// the timeout it is critical.
    pub fn check_heartbeat_at(
        &mut self,
        kind: &EntityKind,
        id: &str,
        now: Instant,
    ) -> Option<FailureRecord> {
        let timeout = self.config.heartbeat_timeout;
        let entry = self.heartbeats.get_mut(&(kind.clone(), id.to_string()))?;
        let silent = now.saturating_duration_since(entry.last);
        if silent <= timeout {
            return None;
        }
        let severity = if silent > timeout * 2 {
            Severity::Critical
        } else {
            Severity::High
        };
        if entry.reported.is_some_and(|r| r >= severity) {
            return None;
        }
        entry.reported = Some(severity);
        Some(self.detect_failure(
            kind,
            id,
            FailureKind::Timeout,
            severity,
            format!("no heartbeat for {}ms", silent.as_millis()),
        ))
    }

    /// Check every known entity.
    pub fn check_all_heartbeats(&mut self, now: Instant) -> Vec<FailureRecord> {
        let keys: Vec<EntityKey> = self.heartbeats.keys().cloned().collect();
        keys.into_iter()
            .filter_map(|(kind, id)| self.check_heartbeat_at(&kind, &id, now))
            .collect()
    }

    // ── error rate ──────────────────────────────────────────────────────────

    pub fn record_outcome(&mut self, kind: &EntityKind, id: &str, success: bool) {
        let window = self.config.error_window.max(1);
        let samples = self
            .outcomes
            .entry((kind.clone(), id.to_string()))
            .or_default();
        samples.push_back(success);
        while samples.len() > window {
            samples.pop_front();
        }
    }

    /// Fraction of failures in the current window.
    pub fn error_rate(&self, kind: &EntityKind, id: &str) -> Option<f64> {
        let samples = self.outcomes.get(&(kind.clone(), id.to_string()))?;
        if samples.is_empty() {
            return None;
        }
        let errors = samples.iter().filter(|ok| !**ok).count();
        Some(errors as f64 / samples.len() as f64)
    }

    /// Report an error-rate failure once the window holds at least
    /// `min_samples` outcomes and the rate exceeds the threshold.  Reporting
    /// clears the window.
    pub fn check_error_rate(&mut self, kind: &EntityKind, id: &str) -> Option<FailureRecord> {
        let key = (kind.clone(), id.to_string());
        let count = self.outcomes.get(&key)?.len();
        if count < self.config.min_samples {
            return None;
        }
        let rate = self.error_rate(kind, id)?;
        if rate <= self.config.error_rate_threshold {
            return None;
        }
        let severity = if rate > 0.8 {
            Severity::High
        } else {
            Severity::Medium
        };
        self.outcomes.remove(&key);
        Some(self.detect_failure(
            kind,
            id,
            FailureKind::Error,
            severity,
            format!("error rate {:.0}% over {count} samples", rate * 100.0),
        ))
    }

    /// Drop all tracking state for an entity.
    pub fn forget(&mut self, kind: &EntityKind, id: &str) {
        let key = (kind.clone(), id.to_string());
        self.heartbeats.remove(&key);
        self.outcomes.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT: EntityKind = EntityKind::Agent;

    fn detector() -> FailureDetector {
        FailureDetector::new(DetectorConfig {
            heartbeat_timeout: Duration::from_secs(30),
            ..DetectorConfig::default()
        })
    }

    #[test]
    fn action_table() {
        use FailureKind::*;
        use Severity::*;
        assert_eq!(choose_action(Crash, Critical), RecoveryAction::Escalate);
        assert_eq!(choose_action(Crash, Low), RecoveryAction::Restart);
        assert_eq!(choose_action(Timeout, High), RecoveryAction::Skip);
        assert_eq!(choose_action(ResourceExhaustion, Medium), RecoveryAction::Reload);
        assert_eq!(choose_action(Error, High), RecoveryAction::Restart);
        assert_eq!(choose_action(Error, Medium), RecoveryAction::Skip);
    }

    #[test]
    fn fresh_heartbeat_is_healthy() {
        let mut d = detector();
        let t0 = Instant::now();
        d.heartbeat_at(&AGENT, "a", t0);
        assert!(d.check_heartbeat_at(&AGENT, "a", t0 + Duration::from_secs(30)).is_none());
    }

    #[test]
    fn stale_heartbeat_escalates_with_silence() {
        let mut d = detector();
        let t0 = Instant::now();
        d.heartbeat_at(&AGENT, "a", t0);

        let high = d
            .check_heartbeat_at(&AGENT, "a", t0 + Duration::from_secs(31))
            .unwrap();
        assert_eq!(high.kind, FailureKind::Timeout);
        assert_eq!(high.severity, Severity::High);
        assert_eq!(high.action, RecoveryAction::Skip);

        // Same silence, same severity: reported once.
        assert!(d.check_heartbeat_at(&AGENT, "a", t0 + Duration::from_secs(40)).is_none());

        let critical = d
            .check_heartbeat_at(&AGENT, "a", t0 + Duration::from_secs(61))
            .unwrap();
        assert_eq!(critical.severity, Severity::Critical);
        assert_eq!(critical.action, RecoveryAction::Escalate);
    }

    #[test]
    fn heartbeat_resets_reporting() {
        let mut d = detector();
        let t0 = Instant::now();
        d.heartbeat_at(&AGENT, "a", t0);
        assert!(d.check_heartbeat_at(&AGENT, "a", t0 + Duration::from_secs(31)).is_some());
        let t1 = t0 + Duration::from_secs(32);
        d.heartbeat_at(&AGENT, "a", t1);
        assert!(d.check_heartbeat_at(&AGENT, "a", t1 + Duration::from_secs(5)).is_none());
        assert!(d.check_heartbeat_at(&AGENT, "a", t1 + Duration::from_secs(31)).is_some());
    }

    #[test]
    fn unknown_entities_yield_nothing() {
        let mut d = detector();
        assert!(d.check_heartbeat(&AGENT, "ghost").is_none());
        assert!(d.check_error_rate(&AGENT, "ghost").is_none());
        assert!(d.error_rate(&AGENT, "ghost").is_none());
    }

    #[test]
    fn check_all_reports_only_stale_entities() {
        let mut d = detector();
        let t0 = Instant::now();
        d.heartbeat_at(&AGENT, "old", t0);
        d.heartbeat_at(&EntityKind::Module, "new", t0 + Duration::from_secs(20));
        let stale = d.check_all_heartbeats(t0 + Duration::from_secs(35));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].entity_id, "old");
    }

    #[test]
    fn error_rate_needs_min_samples() {
        let mut d = detector();
        for _ in 0..9 {
            d.record_outcome(&AGENT, "a", false);
        }
        assert!(d.check_error_rate(&AGENT, "a").is_none());
        d.record_outcome(&AGENT, "a", false);
        let record = d.check_error_rate(&AGENT, "a").unwrap();
        assert_eq!(record.kind, FailureKind::Error);
        assert_eq!(record.severity, Severity::High);
        assert_eq!(record.action, RecoveryAction::Restart);
        // Window cleared after reporting.
        assert!(d.error_rate(&AGENT, "a").is_none());
    }

    #[test]
    fn moderate_error_rate_is_medium() {
        let mut d = detector();
        for i in 0..10 {
            d.record_outcome(&AGENT, "a", i % 10 < 3);
        }
        let record = d.check_error_rate(&AGENT, "a").unwrap();
        assert_eq!(record.severity, Severity::Medium);
        assert_eq!(record.action, RecoveryAction::Skip);
    }

    #[test]
    fn rate_at_threshold_is_healthy() {
        let mut d = detector();
        for i in 0..10 {
            d.record_outcome(&AGENT, "a", i % 2 == 0);
        }
        assert_eq!(d.error_rate(&AGENT, "a"), Some(0.5));
        assert!(d.check_error_rate(&AGENT, "a").is_none());
    }

    #[test]
    fn window_is_sliding() {
        let mut d = FailureDetector::new(DetectorConfig {
            error_window: 10,
            ..DetectorConfig::default()
        });
        for _ in 0..10 {
            d.record_outcome(&AGENT, "a", false);
        }
        for _ in 0..10 {
            d.record_outcome(&AGENT, "a", true);
        }
        assert_eq!(d.error_rate(&AGENT, "a"), Some(0.0));
    }
}
