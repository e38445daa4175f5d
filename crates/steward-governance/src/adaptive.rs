//! [`AdaptiveController`] – system-wide reactions to sustained load.
//!
//! Rules are evaluated in order against each snapshot.  A rule whose
//! condition holds and whose cooldown has elapsed fires: every handler
//! registered for each of its actions runs.  Handlers are isolated from one
//! another; an error or panic in one is logged and the rest still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use steward_middleware::EventBus;
use steward_types::EventPayload;
use tracing::{info, warn};

use crate::sampler::ResourceSnapshot;

const SOURCE: &str = "steward-governance::adaptive";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationAction {
    UnloadIdleModules,
    ReduceConcurrency,
    DowngradeModel,
    ThrottleRequests,
    Custom(String),
}

impl fmt::Display for AdaptationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdaptationAction::UnloadIdleModules => f.write_str("unload_idle_modules"),
            AdaptationAction::ReduceConcurrency => f.write_str("reduce_concurrency"),
            AdaptationAction::DowngradeModel => f.write_str("downgrade_model"),
            AdaptationAction::ThrottleRequests => f.write_str("throttle_requests"),
            AdaptationAction::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

pub type Condition = Arc<dyn Fn(&ResourceSnapshot) -> bool + Send + Sync>;

pub type ActionHandler =
    Arc<dyn Fn(&AdaptationAction, &ResourceSnapshot) -> Result<(), String> + Send + Sync>;

pub struct AdaptationRule {
    pub name: String,
    pub condition: Condition,
    pub actions: Vec<AdaptationAction>,
    pub cooldown: Duration,
    last_fired: Option<Instant>,
}

impl AdaptationRule {
    pub fn new<F>(name: impl Into<String>, condition: F, actions: Vec<AdaptationAction>, cooldown: Duration) -> Self
    where
        F: Fn(&ResourceSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            condition: Arc::new(condition),
            actions,
            cooldown,
            last_fired: None,
        }
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_fired
            .is_none_or(|at| now.saturating_duration_since(at) >= self.cooldown)
    }
}

impl fmt::Debug for AdaptationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptationRule")
            .field("name", &self.name)
            .field("actions", &self.actions)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// Built-in rule set.
///
/// | rule | when | actions | cooldown |
/// |---|---|---|---|
/// | `memory-critical` | memory ≥ 95 % | unload idle modules, downgrade model | 60 s |
/// | `cpu-critical` | CPU ≥ 90 % | reduce concurrency, throttle requests | 30 s |
/// | `memory-high` | memory ≥ 80 % | unload idle modules | 120 s |
pub fn default_rules() -> Vec<AdaptationRule> {
    vec![
        AdaptationRule::new(
            "memory-critical",
            |s: &ResourceSnapshot| s.memory_percent() >= 95.0,
            vec![
                AdaptationAction::UnloadIdleModules,
                AdaptationAction::DowngradeModel,
            ],
            Duration::from_secs(60),
        ),
        AdaptationRule::new(
            "cpu-critical",
            |s: &ResourceSnapshot| s.cpu_percent >= 90.0,
            vec![
                AdaptationAction::ReduceConcurrency,
                AdaptationAction::ThrottleRequests,
            ],
            Duration::from_secs(30),
        ),
        AdaptationRule::new(
            "memory-high",
            |s: &ResourceSnapshot| s.memory_percent() >= 80.0,
            vec![AdaptationAction::UnloadIdleModules],
            Duration::from_secs(120),
        ),
    ]
}

pub struct AdaptiveController {
    rules: Vec<AdaptationRule>,
    handlers: HashMap<AdaptationAction, Vec<ActionHandler>>,
    bus: EventBus,
}

impl AdaptiveController {
    /// No rules, no handlers.
    pub fn new(bus: EventBus) -> Self {
        Self {
            rules: Vec::new(),
            handlers: HashMap::new(),
            bus,
        }
    }

    pub fn with_default_rules(bus: EventBus) -> Self {
        let mut controller = Self::new(bus);
        controller.rules = default_rules();
        controller
    }

    pub fn add_rule(&mut self, rule: AdaptationRule) {
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.rules.len() != before
    }

    pub fn rules(&self) -> &[AdaptationRule] {
        &self.rules
    }

    pub fn on_action<F>(&mut self, action: AdaptationAction, handler: F)
    where
        F: Fn(&AdaptationAction, &ResourceSnapshot) -> Result<(), String> + Send + Sync + 'static,
    {
        self.handlers.entry(action).or_default().push(Arc::new(handler));
    }

    pub fn evaluate(&mut self, snapshot: &ResourceSnapshot) -> Vec<String> {
        self.evaluate_at(snapshot, Instant::now())
    }

    /// Returns the names of the rules that fired.
    pub fn evaluate_at(&mut self, snapshot: &ResourceSnapshot, now: Instant) -> Vec<String> {
        let mut fired = Vec::new();
        for rule in &mut self.rules {
            if !rule.cooled_down(now) {
                continue;
            }
            let triggered = catch_unwind(AssertUnwindSafe(|| (rule.condition)(snapshot)))
                .unwrap_or_else(|_| {
                    warn!(rule = %rule.name, "adaptation condition panicked");
                    false
                });
            if !triggered {
                continue;
            }
            rule.last_fired = Some(now);
            info!(rule = %rule.name, actions = ?rule.actions, "adaptation rule fired");

            for action in &rule.actions {
                for handler in self.handlers.get(action).into_iter().flatten() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| handler(action, snapshot)));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(rule = %rule.name, %action, error = %e, "adaptation handler failed"),
                        Err(_) => warn!(rule = %rule.name, %action, "adaptation handler panicked"),
                    }
                }
            }
            self.bus.emit(
                SOURCE,
                EventPayload::Adaptation {
                    rule: rule.name.clone(),
                    actions: rule.actions.iter().map(ToString::to_string).collect(),
                },
            );
            fired.push(rule.name.clone());
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snap(cpu: f32, mem: f64) -> ResourceSnapshot {
        ResourceSnapshot::new(cpu, mem, 100.0)
    }

    #[test]
    fn default_rules_fire_on_matching_load() {
        let mut c = AdaptiveController::with_default_rules(EventBus::default());
        assert!(c.evaluate(&snap(10.0, 10.0)).is_empty());
        let fired = c.evaluate(&snap(95.0, 96.0));
        assert_eq!(fired, vec!["memory-critical", "cpu-critical", "memory-high"]);
    }

    #[test]
    fn cooldown_suppresses_refiring() {
        let mut c = AdaptiveController::new(EventBus::default());
        c.add_rule(AdaptationRule::new(
            "hot",
            |s: &ResourceSnapshot| s.cpu_percent > 50.0,
            vec![AdaptationAction::ReduceConcurrency],
            Duration::from_secs(10),
        ));
        let t0 = Instant::now();
        assert_eq!(c.evaluate_at(&snap(80.0, 0.0), t0).len(), 1);
        assert!(c.evaluate_at(&snap(80.0, 0.0), t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(c.evaluate_at(&snap(80.0, 0.0), t0 + Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn every_handler_for_every_action_runs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut c = AdaptiveController::new(EventBus::default());
        c.add_rule(AdaptationRule::new(
            "r",
            |_: &ResourceSnapshot| true,
            vec![
                AdaptationAction::ReduceConcurrency,
                AdaptationAction::Custom("flush-cache".into()),
            ],
            Duration::ZERO,
        ));
        for tag in ["a", "b"] {
            let calls = Arc::clone(&calls);
            c.on_action(AdaptationAction::ReduceConcurrency, move |action, _| {
                calls.lock().unwrap().push(format!("{tag}:{action}"));
                Ok(())
            });
        }
        let cc = Arc::clone(&calls);
        c.on_action(AdaptationAction::Custom("flush-cache".into()), move |action, _| {
            cc.lock().unwrap().push(action.to_string());
            Ok(())
        });
        c.evaluate(&snap(0.0, 0.0));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["a:reduce_concurrency", "b:reduce_concurrency", "custom:flush-cache"]
        );
    }

    #[test]
    fn failing_handlers_do_not_block_others() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut c = AdaptiveController::new(EventBus::default());
        c.add_rule(AdaptationRule::new(
            "r",
            |_: &ResourceSnapshot| true,
            vec![AdaptationAction::ThrottleRequests],
            Duration::ZERO,
        ));
        c.on_action(AdaptationAction::ThrottleRequests, |_, _| Err("nope".into()));
        c.on_action(AdaptationAction::ThrottleRequests, |_, _| panic!("bug"));
        let r = Arc::clone(&ran);
        c.on_action(AdaptationAction::ThrottleRequests, move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(c.evaluate(&snap(0.0, 0.0)), vec!["r"]);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn adaptation_event_lists_actions() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(steward_middleware::Topic::Resources);
        let mut c = AdaptiveController::with_default_rules(bus);
        c.evaluate(&snap(91.0, 10.0));
        match rx.try_recv().unwrap().payload {
            EventPayload::Adaptation { rule, actions } => {
                assert_eq!(rule, "cpu-critical");
                assert_eq!(actions, vec!["reduce_concurrency", "throttle_requests"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rules_can_be_removed() {
        let mut c = AdaptiveController::with_default_rules(EventBus::default());
        assert!(c.remove_rule("cpu-critical"));
        assert!(!c.remove_rule("cpu-critical"));
        assert!(c.evaluate(&snap(99.0, 0.0)).is_empty());
    }
}
