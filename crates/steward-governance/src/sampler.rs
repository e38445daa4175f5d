//! Host load sampling.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Aggregate host load at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f32, memory_used_mb: f64, memory_total_mb: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent,
            memory_used_mb,
            memory_total_mb,
        }
    }

    pub fn memory_percent(&self) -> f32 {
        if self.memory_total_mb <= 0.0 {
            return 0.0;
        }
        (self.memory_used_mb / self.memory_total_mb * 100.0) as f32
    }
}

/// Source of [`ResourceSnapshot`]s.
pub trait LoadSampler: Send {
    fn sample(&mut self) -> ResourceSnapshot;
}

/// Real host measurement through `sysinfo`.
///
/// CPU usage is computed between two refreshes, so the very first sample
/// after construction reads as 0 %.
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSnapshot {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        ResourceSnapshot::new(
            self.sys.global_cpu_info().cpu_usage(),
            self.sys.used_memory() as f64 / BYTES_PER_MB,
            self.sys.total_memory() as f64 / BYTES_PER_MB,
        )
    }
}

/// Fixed load, adjustable through any clone of the sampler.  Used on hosts
/// without measurement support and in tests.
///
/// ```
/// use steward_governance::{LoadSampler, StaticSampler};
///
/// let mut sampler = StaticSampler::new(10.0, 40.0);
/// let control = sampler.clone();
/// control.set(95.0, 40.0);
/// assert_eq!(sampler.sample().cpu_percent, 95.0);
/// ```
#[derive(Clone)]
pub struct StaticSampler {
    /// (cpu %, memory %)
    load: Arc<Mutex<(f32, f32)>>,
    total_mb: f64,
}

impl StaticSampler {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self {
            load: Arc::new(Mutex::new((cpu_percent, memory_percent))),
            total_mb: 16_384.0,
        }
    }

    pub fn set(&self, cpu_percent: f32, memory_percent: f32) {
        *self.load.lock().unwrap_or_else(PoisonError::into_inner) = (cpu_percent, memory_percent);
    }
}

impl Default for StaticSampler {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl LoadSampler for StaticSampler {
    fn sample(&mut self) -> ResourceSnapshot {
        let (cpu, memory) = *self.load.lock().unwrap_or_else(PoisonError::into_inner);
        ResourceSnapshot::new(cpu, self.total_mb * f64::from(memory) / 100.0, self.total_mb)
    }
}
