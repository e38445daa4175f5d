//! [`KernelConfig`] – every tunable of a kernel instance.
//!
//! All sections default field by field, so a partial document is enough:
//!
//! ```
//! use steward_runtime::KernelConfig;
//!
//! let config: KernelConfig = serde_json::from_str(r#"{
//!     "engine": { "max_concurrency": 8 },
//!     "timers": { "tick_interval": 50 }
//! }"#).unwrap();
//! assert_eq!(config.engine.max_concurrency, 8);
//! assert_eq!(config.scheduler.max_queue_size, 1000);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_governance::GovernanceConfig;
use steward_kernel::{RecoveryConfig, SchedulerConfig};
use steward_middleware::DEFAULT_JOURNAL_CAPACITY;
use steward_types::KernelError;

use crate::engine::EngineConfig;

pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Scheduler clock period.
    #[serde(with = "steward_types::duration_ms")]
    pub tick_interval: Duration,
    /// Host load sampling period.
    #[serde(with = "steward_types::duration_ms")]
    pub sample_interval: Duration,
    /// Heartbeat sweep period.
    #[serde(with = "steward_types::duration_ms")]
    pub heartbeat_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            sample_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    pub governance: GovernanceConfig,
    pub recovery: RecoveryConfig,
    pub timers: TimerConfig,
    /// Capacity of each event bus lane.
    pub bus_capacity: usize,
    /// Events kept by the in-memory journal.  `0` turns journaling off.
    pub journal_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            governance: GovernanceConfig::default(),
            recovery: RecoveryConfig::default(),
            timers: TimerConfig::default(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
        }
    }
}

impl KernelConfig {
    /// Reject values the kernel cannot run with.
    ///
    /// # Errors
    ///
    /// [`KernelError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), KernelError> {
        let fail = |msg: &str| Err(KernelError::Config(msg.to_string()));
        if self.scheduler.max_queue_size == 0 {
            return fail("scheduler.max_queue_size must be at least 1");
        }
        if self.engine.max_concurrency == 0 {
            return fail("engine.max_concurrency must be at least 1");
        }
        if self.engine.poll_interval.is_zero() {
            return fail("engine.poll_interval must be positive");
        }
        let timers = &self.timers;
        if timers.tick_interval.is_zero()
            || timers.sample_interval.is_zero()
            || timers.heartbeat_interval.is_zero()
        {
            return fail("timer intervals must be positive");
        }
        let monitor = &self.governance.monitor;
        if monitor.cpu_warning > monitor.cpu_critical {
            return fail("governance.monitor.cpu_warning exceeds cpu_critical");
        }
        if monitor.memory_warning > monitor.memory_critical {
            return fail("governance.monitor.memory_warning exceeds memory_critical");
        }
        if self.bus_capacity == 0 {
            return fail("bus_capacity must be at least 1");
        }
        Ok(())
    }
}
