//! `steward-types` – shared vocabulary of the Steward task kernel.
//!
//! Every other crate in the workspace speaks in these types: the
//! [`Task`] unit of work, the [`EntityKind`] of whoever submitted it, the
//! [`KernelState`] lifecycle, the [`KernelEvent`] envelope routed over the
//! event bus, and the single [`KernelError`] enum.

pub mod error;
pub mod event;
pub mod task;

pub use error::{FailureReason, KernelError};
pub use event::{
    EventPayload, FailureKind, KernelEvent, PressureLevel, RecoveryAction, ResourceKind, Severity,
    UsageSummary,
};
pub use task::{Priority, Task, TaskId, TaskOptions, TaskStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of entity that owns a task, a budget, a policy or a failure.
///
/// Budgets, policies, checkpoints and failure records are all keyed by
/// `(EntityKind, entity id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Module,
    User,
    System,
    /// Anything the surrounding application defines on its own.
    Custom(String),
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Agent => write!(f, "agent"),
            EntityKind::Module => write!(f, "module"),
            EntityKind::User => write!(f, "user"),
            EntityKind::System => write!(f, "system"),
            EntityKind::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "agent" => EntityKind::Agent,
            "module" => EntityKind::Module,
            "user" => EntityKind::User,
            "system" => EntityKind::System,
            other => EntityKind::Custom(other.to_string()),
        })
    }
}

/// Lifecycle state of the kernel as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    #[default]
    Init,
    Active,
    Paused,
    Shutdown,
}

impl KernelState {
    /// Fixed adjacency table of the kernel lifecycle.
    ///
    /// | from | to |
    /// |---|---|
    /// | init | active, shutdown |
    /// | active | paused, shutdown |
    /// | paused | active, shutdown |
    /// | shutdown | init |
    pub fn can_transition_to(self, target: KernelState) -> bool {
        use KernelState::*;
        matches!(
            (self, target),
            (Init, Active)
                | (Init, Shutdown)
                | (Active, Paused)
                | (Active, Shutdown)
                | (Paused, Active)
                | (Paused, Shutdown)
                | (Shutdown, Init)
        )
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelState::Init => "init",
            KernelState::Active => "active",
            KernelState::Paused => "paused",
            KernelState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Serialize a [`std::time::Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Whole milliseconds in `d`, saturating at `u64::MAX`.
    pub fn saturating(d: Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(saturating(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn oversized_durations_saturate_to_u64_millis() {
        assert_eq!(duration_ms::saturating(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms::saturating(Duration::MAX), u64::MAX);
        let json = serde_json::to_value(Wrapper { d: Duration::MAX }).unwrap();
        assert_eq!(json["d"], serde_json::json!(u64::MAX));

        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(with = "duration_ms")]
            d: Duration,
        }
    }

    #[test]
    fn lifecycle_adjacency_table() {
        use KernelState::*;
        assert!(Init.can_transition_to(Active));
        assert!(Init.can_transition_to(Shutdown));
        assert!(!Init.can_transition_to(Paused));
        assert!(Active.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Init));
        assert!(Paused.can_transition_to(Active));
        assert!(Shutdown.can_transition_to(Init));
        assert!(!Shutdown.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn entity_kind_parses_known_and_custom_names() {
        assert_eq!("Agent".parse::<EntityKind>().unwrap(), EntityKind::Agent);
        assert_eq!(
            "plugin".parse::<EntityKind>().unwrap(),
            EntityKind::Custom("plugin".into())
        );
        assert_eq!(EntityKind::Module.to_string(), "module");
    }

    #[test]
    fn kernel_state_serializes_lowercase() {
        let json = serde_json::to_string(&KernelState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }
}
