//! Per-execution usage measurement.
//!
//! A [`UsageProbe`] reads the current cost of running work; a
//! [`UsageTracker`] turns successive readings into live and peak figures for
//! one execution and yields the final [`UsageSummary`] exactly once.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use steward_types::{UsageSummary, duration_ms};
use sysinfo::{Pid, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One instantaneous reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading {
    /// Share of the whole host, `0..=100`.
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

pub trait UsageProbe: Send + Sync {
    fn read(&self) -> ProbeReading;
}

/// Always reads zero.  Executions are then bounded only by what tasks report
/// themselves and by their time limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl UsageProbe for NullProbe {
    fn read(&self) -> ProbeReading {
        ProbeReading::default()
    }
}

/// Measures the current process through `sysinfo`.
///
/// Readings cover the whole process, not one task.  With several tasks
/// running at once, each one's [`UsageTracker`] is charged all memory the
/// process gained since that task's baseline, including what its neighbours
/// allocated, and sees the shared CPU figure.  Memory budgets enforced
/// through this probe are therefore conservative under concurrency.
pub struct ProcessProbe {
    sys: Mutex<System>,
    pid: Option<Pid>,
    cores: f32,
}

impl ProcessProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        let mut sys = System::new();
        if let Some(pid) = pid {
            sys.refresh_process(pid);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as f32)
            .unwrap_or(1.0);
        Self {
            sys: Mutex::new(sys),
            pid,
            cores,
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for ProcessProbe {
    fn read(&self) -> ProbeReading {
        let Some(pid) = self.pid else {
            return ProbeReading::default();
        };
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        if !sys.refresh_process(pid) {
            return ProbeReading::default();
        }
        sys.process(pid)
            .map(|p| ProbeReading {
                cpu_percent: (p.cpu_usage() / self.cores).min(100.0),
                memory_mb: p.memory() as f64 / BYTES_PER_MB,
            })
            .unwrap_or_default()
    }
}

/// Live and peak figures of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub peak_cpu_percent: f32,
    pub peak_memory_mb: f64,
    pub elapsed: Duration,
}

impl ResourceUsage {
    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            cpu_percent: self.cpu_percent,
            memory_mb: self.memory_mb,
            peak_cpu_percent: self.peak_cpu_percent,
            peak_memory_mb: self.peak_memory_mb,
            elapsed_ms: duration_ms::saturating(self.elapsed),
        }
    }
}

/// Tracks one execution from start to stop.
///
/// Memory is attributed as growth over the reading taken at start.  When the
/// task reports its own usage, the larger of the reported and probed figure
/// counts.
///
/// ```
/// use steward_governance::{ProbeReading, UsageTracker};
///
/// let mut tracker = UsageTracker::start(ProbeReading { cpu_percent: 0.0, memory_mb: 100.0 });
/// tracker.observe(ProbeReading { cpu_percent: 20.0, memory_mb: 150.0 });
/// assert_eq!(tracker.usage().memory_mb, 50.0);
/// assert!(tracker.stop().is_some());
/// assert!(tracker.stop().is_none());
/// ```
#[derive(Debug)]
pub struct UsageTracker {
    started: Instant,
    baseline_mb: f64,
    probed: ProbeReading,
    reported: ProbeReading,
    usage: ResourceUsage,
    stopped: bool,
}

impl UsageTracker {
    pub fn start(baseline: ProbeReading) -> Self {
        Self {
            started: Instant::now(),
            baseline_mb: baseline.memory_mb,
            probed: ProbeReading::default(),
            reported: ProbeReading::default(),
            usage: ResourceUsage::default(),
            stopped: false,
        }
    }

    /// Fold in a probe reading.
    pub fn observe(&mut self, reading: ProbeReading) -> ResourceUsage {
        self.probed = ProbeReading {
            cpu_percent: reading.cpu_percent,
            memory_mb: (reading.memory_mb - self.baseline_mb).max(0.0),
        };
        self.refresh()
    }

    /// Fold in figures the task reported about itself.
    pub fn report(&mut self, reading: ProbeReading) -> ResourceUsage {
        self.reported = reading;
        self.refresh()
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            elapsed: self.started.elapsed(),
            ..self.usage
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Final summary; `None` on every call after the first.
    pub fn stop(&mut self) -> Option<UsageSummary> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        Some(self.usage().summary())
    }

    fn refresh(&mut self) -> ResourceUsage {
        let cpu = self.probed.cpu_percent.max(self.reported.cpu_percent);
        let memory = self.probed.memory_mb.max(self.reported.memory_mb);
        self.usage.cpu_percent = cpu;
        self.usage.memory_mb = memory;
        self.usage.peak_cpu_percent = self.usage.peak_cpu_percent.max(cpu);
        self.usage.peak_memory_mb = self.usage.peak_memory_mb.max(memory);
        self.usage()
    }
}
