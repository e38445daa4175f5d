//! [`AdmissionGate`] – the check every task passes before its body runs.
//!
//! Two checks, in order:
//!
//! 1. **Authorization** ([`SecurityManager`]): the task's source entity must
//!    be granted every permission in `required_permissions`.  The first
//!    denial stops the check and is returned as [`KernelError::Unauthorized`].
//!    Each check is audited by the security manager.
//! 2. **Budget** ([`BudgetManager`]): the source entity's budget, or the
//!    default, becomes the ceiling for the execution.
//!
//! When the payload carries a string `resource` field it is passed to the
//! policy engine for resource-constrained policies.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use steward_governance::{GovernanceConfig, ResourceGovernor, StaticSampler};
//! use steward_kernel::{Policy, SecurityManager};
//! use steward_middleware::EventBus;
//! use steward_runtime::AdmissionGate;
//! use steward_types::{EntityKind, Task, TaskOptions};
//!
//! let bus = EventBus::default();
//! let mut security = SecurityManager::new(bus.clone());
//! security.add_policy(Policy::new("agents", EntityKind::Agent).allow("model:invoke"));
//! let governor = ResourceGovernor::new(bus, Box::new(StaticSampler::default()), GovernanceConfig::default());
//! let gate = AdmissionGate::new(Arc::new(Mutex::new(security)), Arc::new(Mutex::new(governor)));
//!
//! let task = Task::new("infer", "model", "a-1", EntityKind::Agent, serde_json::json!({}))
//!     .with_options(TaskOptions::default().requires("model:invoke"));
//! assert!(gate.admit(&task).is_ok());
//!
//! let task = Task::new("rm", "storage", "a-1", EntityKind::Agent, serde_json::json!({}))
//!     .with_options(TaskOptions::default().requires("storage:delete"));
//! assert!(gate.admit(&task).is_err());
//! ```

use steward_governance::{BudgetManager, ResourceBudget, ResourceGovernor};
use steward_kernel::SecurityManager;
use steward_types::{KernelError, Task};

use crate::{Shared, lock};

#[derive(Clone)]
pub struct AdmissionGate {
    security: Shared<SecurityManager>,
    governor: Shared<ResourceGovernor>,
}

impl AdmissionGate {
    pub fn new(security: Shared<SecurityManager>, governor: Shared<ResourceGovernor>) -> Self {
        Self { security, governor }
    }

    /// Authorize `task` and return the budget it runs under.
    ///
    /// # Errors
    ///
    /// [`KernelError::Unauthorized`] for the first permission denied.
    pub fn admit(&self, task: &Task) -> Result<ResourceBudget, KernelError> {
        let resource = Self::resource_of(task);
        {
            let mut security = lock(&self.security);
            for permission in &task.required_permissions {
                security.require(&task.source_kind, &task.source_id, permission, resource)?;
            }
        }
        Ok(self.budget_for(task))
    }

    pub fn budget_for(&self, task: &Task) -> ResourceBudget {
        let governor = lock(&self.governor);
        let budgets: &BudgetManager = governor.budgets();
        budgets.get(&task.source_kind, &task.source_id)
    }

    fn resource_of(task: &Task) -> Option<&str> {
        task.payload.get("resource").and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use serde_json::json;
    use steward_governance::{BudgetUpdate, GovernanceConfig, StaticSampler};
    use steward_kernel::{AuditFilter, Policy};
    use steward_middleware::EventBus;
    use steward_types::{EntityKind, TaskOptions};

    fn gate_with(policies: Vec<Policy>) -> AdmissionGate {
        let bus = EventBus::default();
        let mut security = SecurityManager::new(bus.clone());
        for p in policies {
            security.add_policy(p);
        }
        let governor = ResourceGovernor::new(
            bus,
            Box::new(StaticSampler::default()),
            GovernanceConfig::default(),
        );
        AdmissionGate::new(Arc::new(Mutex::new(security)), Arc::new(Mutex::new(governor)))
    }

    fn task(perms: &[&str], payload: serde_json::Value) -> Task {
        let options = perms
            .iter()
            .fold(TaskOptions::default(), |o, p| o.requires(*p));
        Task::new("t", "generic", "agent-1", EntityKind::Agent, payload).with_options(options)
    }

    #[test]
    fn task_without_requirements_is_admitted_with_default_budget() {
        let gate = gate_with(vec![]);
        let budget = gate.admit(&task(&[], json!({}))).unwrap();
        assert_eq!(budget, ResourceBudget::default());
    }

    #[test]
    fn missing_grant_is_unauthorized() {
        let gate = gate_with(vec![Policy::new("p", EntityKind::Agent).allow("model:invoke")]);
        let err = gate
            .admit(&task(&["model:invoke", "network:fetch"], json!({})))
            .unwrap_err();
        match err {
            KernelError::Unauthorized { permission, .. } => assert_eq!(permission, "network:fetch"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn first_denial_stops_further_checks() {
        let gate = gate_with(vec![]);
        assert!(gate.admit(&task(&["storage:read", "storage:write"], json!({}))).is_err());
        let audited = lock(&gate.security).audit_query(&AuditFilter::default());
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].permission, "storage:read");
    }

    #[test]
    fn payload_resource_feeds_policy_constraints() {
        let gate = gate_with(vec![
            Policy::new("docs-only", EntityKind::Agent)
                .allow("storage:read")
                .resources(["docs"]),
        ]);
        assert!(gate.admit(&task(&["storage:read"], json!({"resource": "docs"}))).is_ok());
        assert!(gate.admit(&task(&["storage:read"], json!({"resource": "secrets"}))).is_err());
    }

    #[test]
    fn entity_budget_overrides_default() {
        let gate = gate_with(vec![]);
        lock(&gate.governor).budgets_mut().update(
            &EntityKind::Agent,
            "agent-1",
            BudgetUpdate {
                max_time: Some(Duration::from_millis(50)),
                ..BudgetUpdate::default()
            },
        );
        let budget = gate.admit(&task(&[], json!({}))).unwrap();
        assert_eq!(budget.max_time, Duration::from_millis(50));
    }
}
