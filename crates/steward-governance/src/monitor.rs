//! [`ResourceMonitor`] – rolling load history and pressure detection.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use steward_middleware::EventBus;
use steward_types::{EventPayload, PressureLevel, ResourceKind};
use tracing::{debug, warn};

use crate::sampler::{LoadSampler, ResourceSnapshot};

const SOURCE: &str = "steward-governance::monitor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Snapshots retained.
    pub history_limit: usize,
    pub cpu_warning: f32,
    pub cpu_critical: f32,
    pub memory_warning: f32,
    pub memory_critical: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_limit: 720,
            cpu_warning: 70.0,
            cpu_critical: 90.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureEvent {
    pub resource: ResourceKind,
    pub severity: PressureLevel,
    pub value: f64,
    pub threshold: f64,
}

/// Average and peak load over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAggregate {
    pub samples: usize,
    pub avg_cpu_percent: f32,
    pub max_cpu_percent: f32,
    pub avg_memory_percent: f32,
    pub max_memory_percent: f32,
}

pub struct ResourceMonitor {
    sampler: Box<dyn LoadSampler>,
    config: MonitorConfig,
    history: VecDeque<(Instant, ResourceSnapshot)>,
    bus: EventBus,
}

impl ResourceMonitor {
    pub fn new(bus: EventBus, sampler: Box<dyn LoadSampler>, config: MonitorConfig) -> Self {
        Self {
            sampler,
            config,
            history: VecDeque::new(),
            bus,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take a sample, record it and publish any pressure it shows.
    pub fn sample(&mut self) -> (ResourceSnapshot, Vec<PressureEvent>) {
        let snapshot = self.sampler.sample();
        let pressure = self.record(snapshot);
        (snapshot, pressure)
    }

    /// Record an externally obtained snapshot.
    pub fn record(&mut self, snapshot: ResourceSnapshot) -> Vec<PressureEvent> {
        self.record_at(snapshot, Instant::now())
    }

    pub fn record_at(&mut self, snapshot: ResourceSnapshot, at: Instant) -> Vec<PressureEvent> {
        self.history.push_back((at, snapshot));
        while self.history.len() > self.config.history_limit.max(1) {
            self.history.pop_front();
        }
        debug!(
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_percent(),
            "resource sample"
        );

        let pressure = self.check_pressure(&snapshot);
        for event in &pressure {
            warn!(
                resource = %event.resource,
                severity = ?event.severity,
                value = event.value,
                threshold = event.threshold,
                "resource pressure"
            );
            self.bus.emit(
                SOURCE,
                EventPayload::Pressure {
                    resource: event.resource,
                    severity: event.severity,
                    value: event.value,
                    threshold: event.threshold,
                },
            );
        }
        pressure
    }

    /// CPU and memory are judged independently; each yields at most one
    /// event at its highest crossed level.
    pub fn check_pressure(&self, snapshot: &ResourceSnapshot) -> Vec<PressureEvent> {
        let c = &self.config;
        [
            (ResourceKind::Cpu, snapshot.cpu_percent, c.cpu_warning, c.cpu_critical),
            (
                ResourceKind::Memory,
                snapshot.memory_percent(),
                c.memory_warning,
                c.memory_critical,
            ),
        ]
        .into_iter()
        .filter_map(|(resource, value, warning, critical)| {
            let (severity, threshold) = if value >= critical {
                (PressureLevel::Critical, critical)
            } else if value >= warning {
                (PressureLevel::Warning, warning)
            } else {
                return None;
            };
            Some(PressureEvent {
                resource,
                severity,
                value: f64::from(value),
                threshold: f64::from(threshold),
            })
        })
        .collect()
    }

    pub fn latest(&self) -> Option<&ResourceSnapshot> {
        self.history.back().map(|(_, s)| s)
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ResourceSnapshot> {
        self.history.iter().map(|(_, s)| s)
    }

    pub fn aggregate(&self, window: Duration) -> Option<ResourceAggregate> {
        self.aggregate_at(window, Instant::now())
    }

    /// `None` when no sample falls inside the window.
    pub fn aggregate_at(&self, window: Duration, now: Instant) -> Option<ResourceAggregate> {
        let recent: Vec<&ResourceSnapshot> = self
            .history
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, s)| s)
            .collect();
        if recent.is_empty() {
            return None;
        }
        let n = recent.len() as f32;
        let (mut cpu_sum, mut cpu_max, mut mem_sum, mut mem_max) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for s in &recent {
            let mem = s.memory_percent();
            cpu_sum += s.cpu_percent;
            mem_sum += mem;
            cpu_max = cpu_max.max(s.cpu_percent);
            mem_max = mem_max.max(mem);
        }
        Some(ResourceAggregate {
            samples: recent.len(),
            avg_cpu_percent: cpu_sum / n,
            max_cpu_percent: cpu_max,
            avg_memory_percent: mem_sum / n,
            max_memory_percent: mem_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::StaticSampler;
    use steward_middleware::Topic;

    fn monitor(bus: EventBus) -> (ResourceMonitor, StaticSampler) {
        let sampler = StaticSampler::new(10.0, 10.0);
        let m = ResourceMonitor::new(bus, Box::new(sampler.clone()), MonitorConfig::default());
        (m, sampler)
    }

    #[test]
    fn quiet_host_has_no_pressure() {
        let (mut m, _) = monitor(EventBus::default());
        let (snap, pressure) = m.sample();
        assert_eq!(snap.cpu_percent, 10.0);
        assert!(pressure.is_empty());
        assert_eq!(m.latest().map(|s| s.cpu_percent), Some(10.0));
    }

    #[test]
    fn cpu_and_memory_are_judged_independently() {
        let (mut m, control) = monitor(EventBus::default());
        control.set(75.0, 96.0);
        let (_, pressure) = m.sample();
        assert_eq!(pressure.len(), 2);
        let cpu = pressure.iter().find(|p| p.resource == ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.severity, PressureLevel::Warning);
        assert_eq!(cpu.threshold, 70.0);
        let mem = pressure.iter().find(|p| p.resource == ResourceKind::Memory).unwrap();
        assert_eq!(mem.severity, PressureLevel::Critical);
        assert_eq!(mem.threshold, 95.0);
    }

    #[test]
    fn pressure_is_published_on_resources_topic() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Resources);
        let (mut m, control) = monitor(bus);
        control.set(91.0, 10.0);
        m.sample();
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::Pressure {
                resource: ResourceKind::Cpu,
                severity: PressureLevel::Critical,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn history_is_bounded() {
        let sampler = StaticSampler::default();
        let mut m = ResourceMonitor::new(
            EventBus::default(),
            Box::new(sampler),
            MonitorConfig {
                history_limit: 3,
                ..MonitorConfig::default()
            },
        );
        for _ in 0..10 {
            m.sample();
        }
        assert_eq!(m.history().count(), 3);
    }

    #[test]
    fn aggregate_covers_trailing_window_only() {
        let (mut m, _) = monitor(EventBus::default());
        let t0 = Instant::now();
        m.record_at(ResourceSnapshot::new(90.0, 0.0, 100.0), t0);
        m.record_at(ResourceSnapshot::new(20.0, 40.0, 100.0), t0 + Duration::from_secs(50));
        m.record_at(ResourceSnapshot::new(40.0, 60.0, 100.0), t0 + Duration::from_secs(60));

        let agg = m
            .aggregate_at(Duration::from_secs(20), t0 + Duration::from_secs(60))
            .unwrap();
        assert_eq!(agg.samples, 2);
        assert_eq!(agg.avg_cpu_percent, 30.0);
        assert_eq!(agg.max_cpu_percent, 40.0);
        assert_eq!(agg.avg_memory_percent, 50.0);
        assert_eq!(agg.max_memory_percent, 60.0);

        assert!(m
            .aggregate_at(Duration::from_secs(5), t0 + Duration::from_secs(600))
            .is_none());
    }
}
