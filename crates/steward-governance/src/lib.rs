//! `steward-governance` – resource accounting and adaptation.
//!
//! - [`sampler`] – [`LoadSampler`] with the `sysinfo`-backed
//!   [`SystemSampler`] and the adjustable [`StaticSampler`].
//! - [`monitor`] – [`ResourceMonitor`]: rolling history, pressure events and
//!   windowed aggregates.
//! - [`adaptive`] – [`AdaptiveController`]: rule-driven system-wide actions.
//! - [`budget`] – [`BudgetManager`]: per-entity ceilings.
//! - [`probe`] – [`UsageProbe`] and [`UsageTracker`] for single executions.
//!
//! [`ResourceGovernor`] bundles monitor, controller and budgets.

pub mod adaptive;
pub mod budget;
pub mod monitor;
pub mod probe;
pub mod sampler;

pub use adaptive::{AdaptationAction, AdaptationRule, AdaptiveController, default_rules};
pub use budget::{BudgetManager, BudgetUpdate, LimitBreach, ResourceBudget};
pub use monitor::{MonitorConfig, PressureEvent, ResourceAggregate, ResourceMonitor};
pub use probe::{NullProbe, ProbeReading, ProcessProbe, ResourceUsage, UsageProbe, UsageTracker};
pub use sampler::{LoadSampler, ResourceSnapshot, StaticSampler, SystemSampler};

use serde::{Deserialize, Serialize};
use steward_middleware::EventBus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub monitor: MonitorConfig,
    pub default_budget: ResourceBudget,
    /// Install [`default_rules`] at construction.
    pub default_rules: bool,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            default_budget: ResourceBudget::default(),
            default_rules: true,
        }
    }
}

pub struct ResourceGovernor {
    monitor: ResourceMonitor,
    adaptive: AdaptiveController,
    budgets: BudgetManager,
}

impl ResourceGovernor {
    pub fn new(bus: EventBus, sampler: Box<dyn LoadSampler>, config: GovernanceConfig) -> Self {
        let adaptive = if config.default_rules {
            AdaptiveController::with_default_rules(bus.clone())
        } else {
            AdaptiveController::new(bus.clone())
        };
        Self {
            monitor: ResourceMonitor::new(bus, sampler, config.monitor),
            adaptive,
            budgets: BudgetManager::with_default(config.default_budget),
        }
    }

    /// Sample the host and run the adaptive rules against the result.
    pub fn on_sample(&mut self) -> ResourceSnapshot {
        let (snapshot, _) = self.monitor.sample();
        self.adaptive.evaluate(&snapshot);
        snapshot
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut ResourceMonitor {
        &mut self.monitor
    }

    pub fn adaptive(&self) -> &AdaptiveController {
        &self.adaptive
    }

    pub fn adaptive_mut(&mut self) -> &mut AdaptiveController {
        &mut self.adaptive
    }

    pub fn budgets(&self) -> &BudgetManager {
        &self.budgets
    }

    pub fn budgets_mut(&mut self) -> &mut BudgetManager {
        &mut self.budgets
    }
}
