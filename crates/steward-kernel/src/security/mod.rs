//! Security Manager – permission registry, policy engine and audit trail.
//!
//! [`SecurityManager::check_permission`] is the single authorization entry
//! point: the permission must exist and be enabled, then the policy engine
//! decides.  Every decision is audited and published on the Security topic.

pub mod audit;
pub mod permissions;
pub mod policy;

pub use audit::{AuditEntry, AuditFilter, AuditLog, AuditSummary};
pub use permissions::{Permission, PermissionCategory, PermissionRegistry, RiskLevel};
pub use policy::{AccessDecision, Policy, PolicyConstraints, PolicyEngine, RateLimit, TimeWindow};

use chrono::{DateTime, Utc};
use steward_middleware::EventBus;
use steward_types::{EntityKind, EventPayload, KernelError};
use tracing::{info, instrument, warn};

const SOURCE: &str = "steward-kernel::security";

pub struct SecurityManager {
    registry: PermissionRegistry,
    policies: PolicyEngine,
    audit: AuditLog,
    bus: EventBus,
}

impl SecurityManager {
    /// Baseline permissions, no policies (everything is denied until a
    /// policy grants it).
    pub fn new(bus: EventBus) -> Self {
        Self::with_registry(bus, PermissionRegistry::with_baseline())
    }

    pub fn with_registry(bus: EventBus, registry: PermissionRegistry) -> Self {
        Self {
            registry,
            policies: PolicyEngine::new(),
            audit: AuditLog::default(),
            bus,
        }
    }

    pub fn check_permission(
        &mut self,
        kind: &EntityKind,
        id: &str,
        permission: &str,
        resource: Option<&str>,
    ) -> AccessDecision {
        self.check_permission_at(kind, id, permission, resource, Utc::now())
    }

    /// [`check_permission`](Self::check_permission) against an explicit
    /// clock, for time-window evaluation.
    #[instrument(skip(self), fields(entity = %id))]
    pub fn check_permission_at(
        &mut self,
        kind: &EntityKind,
        id: &str,
        permission: &str,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let decision = match self.registry.get(permission) {
            None => AccessDecision::deny(format!("unknown permission {permission}")),
            Some(p) if !p.enabled => AccessDecision::deny(format!("permission {permission} is disabled")),
            Some(_) => self.policies.evaluate(kind, id, permission, resource, now),
        };

        let mut entry = AuditEntry::new(kind.clone(), id, audit::ACTION_CHECK, permission);
        entry.timestamp = now;
        entry.resource = resource.map(str::to_string);
        entry.allowed = decision.allowed;
        entry.reason = decision.reason.clone();
        entry.policy = decision.policy.clone();
        let entry_id = entry.id.clone();
        self.audit.append(entry);

        self.bus.emit(
            SOURCE,
            EventPayload::Audit {
                entry_id,
                entity_kind: kind.clone(),
                entity_id: id.to_string(),
                permission: permission.to_string(),
                allowed: decision.allowed,
                reason: decision.reason.clone(),
            },
        );
        if decision.allowed {
            info!(%kind, %permission, policy = ?decision.policy, "access granted");
            self.bus.emit(
                SOURCE,
                EventPayload::AccessGranted {
                    entity_kind: kind.clone(),
                    entity_id: id.to_string(),
                    permission: permission.to_string(),
                    policy: decision.policy.clone().unwrap_or_default(),
                },
            );
        } else {
            warn!(%kind, %permission, reason = %decision.reason, "access denied");
            self.bus.emit(
                SOURCE,
                EventPayload::AccessDenied {
                    entity_kind: kind.clone(),
                    entity_id: id.to_string(),
                    permission: permission.to_string(),
                    reason: decision.reason.clone(),
                },
            );
        }
        decision
    }

    /// `Ok(())` when granted, [`KernelError::Unauthorized`] otherwise.
    pub fn require(
        &mut self,
        kind: &EntityKind,
        id: &str,
        permission: &str,
        resource: Option<&str>,
    ) -> Result<(), KernelError> {
        let decision = self.check_permission(kind, id, permission, resource);
        if decision.allowed {
            Ok(())
        } else {
            Err(KernelError::Unauthorized {
                entity_kind: kind.clone(),
                entity_id: id.to_string(),
                permission: permission.to_string(),
                reason: decision.reason,
            })
        }
    }

    // ── administration ──────────────────────────────────────────────────────

    pub fn register_permission(&mut self, permission: Permission) -> Result<(), KernelError> {
        self.registry.register(permission)
    }

    pub fn set_permission_enabled(&mut self, name: &str, enabled: bool) -> Result<(), KernelError> {
        self.registry.set_enabled(name, enabled)?;
        let mut entry = AuditEntry::new(
            EntityKind::System,
            "security",
            audit::ACTION_PERMISSION_TOGGLED,
            name,
        );
        entry.reason = if enabled { "enabled" } else { "disabled" }.to_string();
        self.audit.append(entry);
        Ok(())
    }

    pub fn add_policy(&mut self, policy: Policy) {
        let mut entry = AuditEntry::new(
            policy.entity_kind.clone(),
            policy.entity_id.clone().unwrap_or_else(|| "*".to_string()),
            audit::ACTION_POLICY_ADDED,
            policy.permissions.join(","),
        );
        entry.policy = Some(policy.name.clone());
        self.audit.append(entry);
        info!(policy = %policy.name, kind = %policy.entity_kind, "policy added");
        self.policies.add_policy(policy);
    }

    pub fn remove_policy(&mut self, name: &str) -> bool {
        let Some(policy) = self.policies.get(name) else {
            return false;
        };
        let mut entry = AuditEntry::new(
            policy.entity_kind.clone(),
            policy.entity_id.clone().unwrap_or_else(|| "*".to_string()),
            audit::ACTION_POLICY_REMOVED,
            policy.permissions.join(","),
        );
        entry.policy = Some(name.to_string());
        self.audit.append(entry);
        self.policies.remove_policy(name)
    }

    pub fn set_policy_enabled(&mut self, name: &str, enabled: bool) -> bool {
        self.policies.set_enabled(name, enabled)
    }

    /// See [`PolicyEngine::prune_rate_limits`].
    pub fn prune_rate_limits(&self) -> usize {
        self.policies.prune_rate_limits()
    }

    pub fn permissions(&self) -> &PermissionRegistry {
        &self.registry
    }

    pub fn policies(&self) -> &[Policy] {
        self.policies.policies()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit.query(filter)
    }

    pub fn audit_summary(&self) -> AuditSummary {
        self.audit.summary_24h(Utc::now())
    }
}
