//! Per-entity resource budgets.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_types::{EntityKind, FailureReason};

use crate::probe::ResourceUsage;

/// Ceilings applied to every execution of an entity's tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBudget {
    pub max_cpu_percent: f32,
    pub max_memory_mb: u64,
    #[serde(with = "steward_types::duration_ms")]
    pub max_time: Duration,
    pub priority_weight: f32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_cpu_percent: 100.0,
            max_memory_mb: 512,
            max_time: Duration::from_secs(300),
            priority_weight: 1.0,
        }
    }
}

/// Partial budget; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetUpdate {
    pub max_cpu_percent: Option<f32>,
    pub max_memory_mb: Option<u64>,
    #[serde(default, with = "option_duration_ms")]
    pub max_time: Option<Duration>,
    pub priority_weight: Option<f32>,
}

impl BudgetUpdate {
    fn apply(self, budget: &mut ResourceBudget) {
        if let Some(cpu) = self.max_cpu_percent {
            budget.max_cpu_percent = cpu;
        }
        if let Some(mem) = self.max_memory_mb {
            budget.max_memory_mb = mem;
        }
        if let Some(time) = self.max_time {
            budget.max_time = time;
        }
        if let Some(weight) = self.priority_weight {
            budget.priority_weight = weight;
        }
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&steward_types::duration_ms::saturating(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// A crossed ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitBreach {
    pub resource: &'static str,
    pub value: f64,
    pub limit: f64,
}

impl From<LimitBreach> for FailureReason {
    fn from(b: LimitBreach) -> Self {
        FailureReason::LimitExceeded {
            resource: b.resource.to_string(),
            value: b.value,
            limit: b.limit,
        }
    }
}

/// One budget per `(kind, id)`, falling back to a default.
///
/// ```
/// use steward_governance::{BudgetManager, BudgetUpdate};
/// use steward_types::EntityKind;
///
/// let mut budgets = BudgetManager::default();
/// let b = budgets.update(&EntityKind::Agent, "a", BudgetUpdate {
///     max_memory_mb: Some(64),
///     ..BudgetUpdate::default()
/// });
/// assert_eq!(b.max_memory_mb, 64);
/// assert_eq!(b.max_cpu_percent, 100.0);
/// ```
#[derive(Debug, Default)]
pub struct BudgetManager {
    budgets: HashMap<(EntityKind, String), ResourceBudget>,
    default: ResourceBudget,
}

impl BudgetManager {
    pub fn with_default(default: ResourceBudget) -> Self {
        Self {
            budgets: HashMap::new(),
            default,
        }
    }

    pub fn default_budget(&self) -> ResourceBudget {
        self.default
    }

    /// The entity's budget, or the default when none is set.
    pub fn get(&self, kind: &EntityKind, id: &str) -> ResourceBudget {
        self.budgets
            .get(&(kind.clone(), id.to_string()))
            .copied()
            .unwrap_or(self.default)
    }

    pub fn has_budget(&self, kind: &EntityKind, id: &str) -> bool {
        self.budgets.contains_key(&(kind.clone(), id.to_string()))
    }

    pub fn set(&mut self, kind: &EntityKind, id: &str, budget: ResourceBudget) {
        self.budgets.insert((kind.clone(), id.to_string()), budget);
    }

    /// Create from the default or merge into the existing budget.
    pub fn update(&mut self, kind: &EntityKind, id: &str, update: BudgetUpdate) -> ResourceBudget {
        let default = self.default;
        let budget = self
            .budgets
            .entry((kind.clone(), id.to_string()))
            .or_insert(default);
        update.apply(budget);
        *budget
    }

    pub fn remove(&mut self, kind: &EntityKind, id: &str) -> bool {
        self.budgets.remove(&(kind.clone(), id.to_string())).is_some()
    }

    /// First ceiling `usage` exceeds: CPU, then memory, then time.
    pub fn check(budget: &ResourceBudget, usage: &ResourceUsage) -> Option<LimitBreach> {
        if let Some(breach) = Self::check_footprint(budget, usage) {
            return Some(breach);
        }
        if usage.elapsed > budget.max_time {
            return Some(LimitBreach {
                resource: "time_ms",
                value: usage.elapsed.as_secs_f64() * 1000.0,
                limit: budget.max_time.as_secs_f64() * 1000.0,
            });
        }
        None
    }

    /// CPU and memory only.  Running executions enforce time separately.
    pub fn check_footprint(budget: &ResourceBudget, usage: &ResourceUsage) -> Option<LimitBreach> {
        if usage.cpu_percent > budget.max_cpu_percent {
            return Some(LimitBreach {
                resource: "cpu_percent",
                value: f64::from(usage.cpu_percent),
                limit: f64::from(budget.max_cpu_percent),
            });
        }
        if usage.memory_mb > budget.max_memory_mb as f64 {
            return Some(LimitBreach {
                resource: "memory_mb",
                value: usage.memory_mb,
                limit: budget.max_memory_mb as f64,
            });
        }
        None
    }
}
