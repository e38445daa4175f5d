//! Append-only audit trail of authorization decisions and security changes.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use steward_types::EntityKind;
use uuid::Uuid;

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

pub const ACTION_CHECK: &str = "permission_check";
pub const ACTION_POLICY_ADDED: &str = "policy_added";
pub const ACTION_POLICY_REMOVED: &str = "policy_removed";
pub const ACTION_PERMISSION_TOGGLED: &str = "permission_toggled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub action: String,
    pub permission: String,
    pub resource: Option<String>,
    pub allowed: bool,
    pub reason: String,
    pub policy: Option<String>,
}

impl AuditEntry {
    pub fn new(
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        action: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            entity_kind,
            entity_id: entity_id.into(),
            action: action.into(),
            permission: permission.into(),
            resource: None,
            allowed: true,
            reason: String::new(),
            policy: None,
        }
    }
}

/// Every field is optional; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_kind: Option<EntityKind>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub permission: Option<String>,
    pub allowed: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, e: &AuditEntry) -> bool {
        self.entity_kind.as_ref().is_none_or(|k| k == &e.entity_kind)
            && self.entity_id.as_deref().is_none_or(|id| id == e.entity_id)
            && self.action.as_deref().is_none_or(|a| a == e.action)
            && self.permission.as_deref().is_none_or(|p| p == e.permission)
            && self.allowed.is_none_or(|a| a == e.allowed)
            && self.since.is_none_or(|s| e.timestamp >= s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub by_entity_kind: BTreeMap<String, usize>,
    pub by_action: BTreeMap<String, usize>,
}

/// Bounded append-only log; the oldest entries fall off once `capacity` is
/// reached.
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&mut self, entry: AuditEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Matching entries, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let mut hits: Vec<AuditEntry> = self
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = hits.len().saturating_sub(limit);
            hits.drain(..skip);
        }
        hits
    }

    /// Counts over the 24 hours preceding `now`.
    pub fn summary_24h(&self, now: DateTime<Utc>) -> AuditSummary {
        let since = now - ChronoDuration::hours(24);
        let mut summary = AuditSummary::default();
        for e in self
            .entries
            .iter()
            .filter(|e| e.timestamp >= since && e.timestamp <= now)
        {
            summary.total += 1;
            if e.allowed {
                summary.allowed += 1;
            } else {
                summary.denied += 1;
            }
            *summary
                .by_entity_kind
                .entry(e.entity_kind.to_string())
                .or_default() += 1;
            *summary.by_action.entry(e.action.clone()).or_default() += 1;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }
}
