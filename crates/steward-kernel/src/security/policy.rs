//! [`PolicyEngine`] – policy matching and constraint evaluation.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use steward_types::EntityKind;
use tracing::{debug, warn};

/// Hours of the day (UTC, `0..24`) during which a policy applies.  A window
/// whose start is after its end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// At most `max_requests` grants per entity in any `per` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    #[serde(with = "steward_types::duration_ms")]
    pub per: Duration,
}

impl RateLimit {
    fn quota(&self) -> Option<Quota> {
        let burst = NonZeroU32::new(self.max_requests)?;
        Quota::with_period(self.per / burst.get()).map(|q| q.allow_burst(burst))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConstraints {
    pub time_window: Option<TimeWindow>,
    /// Allowed resources.  An entry ending in `*` matches by prefix.
    pub resources: Option<Vec<String>>,
    pub rate_limit: Option<RateLimit>,
}

/// Grants a set of permissions to one entity, or to every entity of a kind
/// when `entity_id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub entity_kind: EntityKind,
    pub entity_id: Option<String>,
    /// Exact names, `category:*`, or `*`.
    pub permissions: Vec<String>,
    pub priority: i32,
    #[serde(default)]
    pub constraints: PolicyConstraints,
    pub enabled: bool,
}

impl Policy {
    /// Wildcard policy for every entity of `entity_kind`.
    pub fn new(name: impl Into<String>, entity_kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            entity_kind,
            entity_id: None,
            permissions: Vec::new(),
            priority: 0,
            constraints: PolicyConstraints::default(),
            enabled: true,
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn allow(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn time_window(mut self, start_hour: u32, end_hour: u32) -> Self {
        self.constraints.time_window = Some(TimeWindow {
            start_hour,
            end_hour,
        });
        self
    }

    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints.resources = Some(resources.into_iter().map(Into::into).collect());
        self
    }

    pub fn rate_limit(mut self, max_requests: u32, per: Duration) -> Self {
        self.constraints.rate_limit = Some(RateLimit { max_requests, per });
        self
    }

    pub fn applies_to(&self, kind: &EntityKind, id: &str) -> bool {
        self.enabled
            && &self.entity_kind == kind
            && self.entity_id.as_deref().is_none_or(|own| own == id)
    }

    /// Whether this policy lists `permission`.
    pub fn covers(&self, permission: &str) -> bool {
        let category = permission.split(':').next().unwrap_or(permission);
        self.permissions.iter().any(|p| {
            p == "*"
                || p == permission
                || p.strip_suffix(":*").is_some_and(|c| c == category)
        })
    }
}

fn resource_allowed(patterns: &[String], resource: Option<&str>) -> bool {
    let Some(resource) = resource else {
        return false;
    };
    patterns.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => resource.starts_with(prefix),
        None => p == resource,
    })
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    /// Name of the granting policy.
    pub policy: Option<String>,
}

impl AccessDecision {
    pub fn allow(policy: &str) -> Self {
        Self {
            allowed: true,
            reason: format!("granted by policy {policy}"),
            policy: Some(policy.to_string()),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            policy: None,
        }
    }
}

/// Ordered policy set plus one keyed rate limiter per rate-limited policy.
#[derive(Default)]
pub struct PolicyEngine {
    policies: Vec<Policy>,
    limiters: HashMap<String, DefaultKeyedRateLimiter<String>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace (by name) a policy.
    pub fn add_policy(&mut self, policy: Policy) {
        self.limiters.remove(&policy.name);
        if let Some(limit) = policy.constraints.rate_limit {
            match limit.quota() {
                Some(quota) => {
                    self.limiters
                        .insert(policy.name.clone(), RateLimiter::keyed(quota));
                }
                None => warn!(policy = %policy.name, "rate limit with zero quota never grants"),
            }
        }
        match self.policies.iter_mut().find(|p| p.name == policy.name) {
            Some(existing) => *existing = policy,
            None => self.policies.push(policy),
        }
    }

    pub fn remove_policy(&mut self, name: &str) -> bool {
        self.limiters.remove(name);
        let before = self.policies.len();
        self.policies.retain(|p| p.name != name);
        self.policies.len() != before
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.policies.iter_mut().find(|p| p.name == name) {
            Some(policy) => {
                policy.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Forget rate-limit keys whose quota has fully replenished.  Returns
    /// how many keys are still tracked.
    pub fn prune_rate_limits(&self) -> usize {
        self.limiters
            .values()
            .map(|limiter| {
                limiter.retain_recent();
                limiter.shrink_to_fit();
                limiter.len()
            })
            .sum()
    }

    /// Applicable policies by descending priority; ties keep insertion order.
    pub fn applicable(&self, kind: &EntityKind, id: &str) -> Vec<&Policy> {
        let mut matching: Vec<&Policy> = self
            .policies
            .iter()
            .filter(|p| p.applies_to(kind, id))
            .collect();
        matching.sort_by(|a, b| b.priority.cmp(&a.priority));
        matching
    }

    /// Walk applicable policies and return the first grant, or a default
    /// deny naming the last constraint that failed.
    ///
    /// Constraints are checked in order time window, resource allow-list,
    /// rate limit, so a grant refused for another reason never consumes
    /// rate-limit capacity.
    pub fn evaluate(
        &self,
        kind: &EntityKind,
        id: &str,
        permission: &str,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let mut violation: Option<String> = None;
        for policy in self.applicable(kind, id) {
            if !policy.covers(permission) {
                continue;
            }
            let constraints = &policy.constraints;
            if let Some(window) = constraints.time_window {
                if !window.contains(now) {
                    violation = Some(format!(
                        "policy {} only applies between {:02}:00 and {:02}:00 UTC",
                        policy.name, window.start_hour, window.end_hour
                    ));
                    continue;
                }
            }
            if let Some(patterns) = &constraints.resources {
                if !resource_allowed(patterns, resource) {
                    violation = Some(format!(
                        "resource {} not allowed by policy {}",
                        resource.unwrap_or("<none>"),
                        policy.name
                    ));
                    continue;
                }
            }
            if constraints.rate_limit.is_some() {
                let key = format!("{kind}:{id}");
                let within = self
                    .limiters
                    .get(&policy.name)
                    .is_some_and(|limiter| limiter.check_key(&key).is_ok());
                if !within {
                    violation = Some(format!("rate limit exceeded for policy {}", policy.name));
                    continue;
                }
            }
            debug!(policy = %policy.name, %permission, entity = %id, "policy matched");
            return AccessDecision::allow(&policy.name);
        }
        AccessDecision::deny(violation.unwrap_or_else(|| "no matching policy".to_string()))
    }
}
