//! [`StateMachine`] – guards the kernel lifecycle.
//!
//! The kernel moves between [`KernelState`]s along a fixed adjacency table
//! (see [`KernelState::can_transition_to`]).  Every accepted transition is
//! recorded in a bounded history and published on
//! [`Topic::Lifecycle`][steward_middleware::Topic::Lifecycle], where bus
//! listeners observe it synchronously in subscription order.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_middleware::EventBus;
use steward_types::{EventPayload, KernelError, KernelState};
use tracing::{info, warn};

const SOURCE: &str = "steward-kernel::state_machine";

/// Default number of transitions retained in the history log.
pub const DEFAULT_HISTORY_LIMIT: usize = 64;

/// One accepted lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: KernelState,
    pub to: KernelState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Holds the current [`KernelState`] and a bounded transition log.
///
/// # Example
///
/// ```
/// use steward_kernel::state_machine::StateMachine;
/// use steward_middleware::EventBus;
/// use steward_types::KernelState;
///
/// let mut sm = StateMachine::new(EventBus::default());
/// assert!(sm.transition(KernelState::Active, "boot").is_ok());
/// assert!(sm.transition(KernelState::Init, "bogus").is_err());
/// assert_eq!(sm.current(), KernelState::Active);
/// ```
pub struct StateMachine {
    current: KernelState,
    history: VecDeque<StateTransition>,
    history_limit: usize,
    bus: EventBus,
}

impl StateMachine {
    /// Start in [`KernelState::Init`] with the default history bound.
    pub fn new(bus: EventBus) -> Self {
        Self::with_history_limit(bus, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(bus: EventBus, history_limit: usize) -> Self {
        Self {
            current: KernelState::Init,
            history: VecDeque::with_capacity(history_limit.min(DEFAULT_HISTORY_LIMIT)),
            history_limit: history_limit.max(1),
            bus,
        }
    }

    pub fn current(&self) -> KernelState {
        self.current
    }

    pub fn can_transition(&self, target: KernelState) -> bool {
        self.current.can_transition_to(target)
    }

    /// Move to `target`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidTransition`] carrying the unchanged current
    /// state when `target` is not reachable from it.
    pub fn transition(
        &mut self,
        target: KernelState,
        reason: impl Into<String>,
    ) -> Result<StateTransition, KernelError> {
        let reason = reason.into();
        if !self.can_transition(target) {
            warn!(from = %self.current, to = %target, %reason, "rejected state transition");
            return Err(KernelError::InvalidTransition {
                from: self.current,
                to: target,
            });
        }

        let record = StateTransition {
            from: self.current,
            to: target,
            reason,
            at: Utc::now(),
        };
        self.current = target;
        self.history.push_back(record.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        info!(from = %record.from, to = %record.to, reason = %record.reason, "state transition");

        self.bus.emit(
            SOURCE,
            EventPayload::StateChanged {
                from: record.from,
                to: record.to,
                reason: record.reason.clone(),
            },
        );
        Ok(record)
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    /// `true` only while active: the engine dispatches nothing otherwise.
    pub fn is_operational(&self) -> bool {
        self.current == KernelState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use steward_middleware::Topic;

    #[test]
    fn full_lifecycle_walk() {
        let mut sm = StateMachine::new(EventBus::default());
        sm.transition(KernelState::Active, "boot").unwrap();
        sm.transition(KernelState::Paused, "operator").unwrap();
        sm.transition(KernelState::Active, "resume").unwrap();
        sm.transition(KernelState::Shutdown, "exit").unwrap();
        sm.transition(KernelState::Init, "restart").unwrap();
        assert_eq!(sm.current(), KernelState::Init);
        assert_eq!(sm.history().count(), 5);
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let mut sm = StateMachine::new(EventBus::default());
        let err = sm.transition(KernelState::Paused, "too early").unwrap_err();
        assert_eq!(
            err,
            KernelError::InvalidTransition {
                from: KernelState::Init,
                to: KernelState::Paused
            }
        );
        assert_eq!(sm.current(), KernelState::Init);
        assert_eq!(sm.history().count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut sm = StateMachine::with_history_limit(EventBus::default(), 3);
        sm.transition(KernelState::Active, "1").unwrap();
        for n in 0..4 {
            sm.transition(KernelState::Paused, format!("p{n}")).unwrap();
            sm.transition(KernelState::Active, format!("a{n}")).unwrap();
        }
        let reasons: Vec<_> = sm.history().map(|t| t.reason.as_str()).collect();
        assert_eq!(reasons, vec!["a2", "p3", "a3"]);
    }

    #[test]
    fn listeners_observe_transitions_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on(Topic::Lifecycle, move |event| {
                if let EventPayload::StateChanged { to, .. } = &event.payload {
                    seen.lock().unwrap().push(format!("{tag}:{to}"));
                }
            });
        }
        let mut sm = StateMachine::new(bus);
        sm.transition(KernelState::Active, "boot").unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:active".to_string(), "second:active".to_string()]
        );
    }

    #[test]
    fn failing_listener_does_not_abort_transition() {
        let bus = EventBus::default();
        bus.on(Topic::Lifecycle, |_| panic!("listener blew up"));
        let after = Arc::new(Mutex::new(0));
        let a = Arc::clone(&after);
        bus.on(Topic::Lifecycle, move |_| *a.lock().unwrap() += 1);

        let mut sm = StateMachine::new(bus);
        assert!(sm.transition(KernelState::Active, "boot").is_ok());
        assert_eq!(sm.current(), KernelState::Active);
        assert_eq!(*after.lock().unwrap(), 1);
    }

    #[test]
    fn operational_only_when_active() {
        let mut sm = StateMachine::new(EventBus::default());
        assert!(!sm.is_operational());
        sm.transition(KernelState::Active, "boot").unwrap();
        assert!(sm.is_operational());
        sm.transition(KernelState::Paused, "hold").unwrap();
        assert!(!sm.is_operational());
    }
}
