//! [`PermissionRegistry`] – the catalogue of grantable permissions.
//!
//! A permission name has the form `category:action` (for example
//! `storage:write`).  Policies can only grant permissions that exist here and
//! are enabled.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use steward_types::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionCategory {
    System,
    Storage,
    Network,
    Model,
    Agent,
}

impl PermissionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionCategory::System => "system",
            PermissionCategory::Storage => "storage",
            PermissionCategory::Network => "network",
            PermissionCategory::Model => "model",
            PermissionCategory::Agent => "agent",
        }
    }
}

impl fmt::Display for PermissionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    pub category: PermissionCategory,
    pub risk: RiskLevel,
    pub enabled: bool,
    pub description: String,
}

impl Permission {
    pub fn new(
        name: impl Into<String>,
        category: PermissionCategory,
        risk: RiskLevel,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            risk,
            enabled: true,
            description: description.into(),
        }
    }
}

const BASELINE: &[(&str, PermissionCategory, RiskLevel, &str)] = &[
    ("system:read", PermissionCategory::System, RiskLevel::Low, "Read system information"),
    ("system:write", PermissionCategory::System, RiskLevel::High, "Change system settings"),
    ("system:execute", PermissionCategory::System, RiskLevel::Critical, "Execute system commands"),
    ("storage:read", PermissionCategory::Storage, RiskLevel::Low, "Read stored data"),
    ("storage:write", PermissionCategory::Storage, RiskLevel::Medium, "Write stored data"),
    ("storage:delete", PermissionCategory::Storage, RiskLevel::High, "Delete stored data"),
    ("network:fetch", PermissionCategory::Network, RiskLevel::Medium, "Make outbound requests"),
    ("network:listen", PermissionCategory::Network, RiskLevel::High, "Accept inbound connections"),
    ("model:invoke", PermissionCategory::Model, RiskLevel::Low, "Run inference on a loaded model"),
    ("model:load", PermissionCategory::Model, RiskLevel::Medium, "Load or unload models"),
    ("agent:spawn", PermissionCategory::Agent, RiskLevel::Medium, "Start new agents"),
    ("agent:message", PermissionCategory::Agent, RiskLevel::Low, "Message other agents"),
    ("agent:terminate", PermissionCategory::Agent, RiskLevel::High, "Stop other agents"),
];

/// Registry of known permissions keyed by name.
///
/// # Example
///
/// ```
/// use steward_kernel::security::PermissionRegistry;
///
/// let mut registry = PermissionRegistry::with_baseline();
/// assert!(registry.is_enabled("model:invoke"));
/// registry.set_enabled("model:invoke", false).unwrap();
/// assert!(!registry.is_enabled("model:invoke"));
/// ```
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    permissions: BTreeMap<String, Permission>,
}

impl PermissionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the built-in permission set.
    pub fn with_baseline() -> Self {
        let permissions = BASELINE
            .iter()
            .map(|&(name, category, risk, description)| {
                (name.to_string(), Permission::new(name, category, risk, description))
            })
            .collect();
        Self { permissions }
    }

    /// Add a permission.  Names are unique.
    pub fn register(&mut self, permission: Permission) -> Result<(), KernelError> {
        if self.permissions.contains_key(&permission.name) {
            return Err(KernelError::DuplicatePermission(permission.name));
        }
        self.permissions.insert(permission.name.clone(), permission);
        Ok(())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), KernelError> {
        let permission = self
            .permissions
            .get_mut(name)
            .ok_or_else(|| KernelError::PermissionNotFound(name.to_string()))?;
        permission.enabled = enabled;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Permission> {
        self.permissions.get(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.permissions.get(name).is_some_and(|p| p.enabled)
    }

    pub fn list(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.values()
    }

    pub fn by_category(&self, category: PermissionCategory) -> impl Iterator<Item = &Permission> {
        self.permissions
            .values()
            .filter(move |p| p.category == category)
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}
