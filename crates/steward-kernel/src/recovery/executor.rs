//! [`RecoveryExecutor`] – runs the recovery action chosen for a failure.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use steward_types::{EntityKind, RecoveryAction};
use tracing::{info, warn};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::detector::FailureRecord;

/// Restarts an entity.  `Err` carries a human-readable reason.
pub type RestartHandler = Box<dyn Fn(&FailureRecord) -> Result<(), String> + Send + Sync>;

/// Re-applies a checkpoint to an entity.
pub type ReloadHandler =
    Box<dyn Fn(&FailureRecord, &Checkpoint) -> Result<(), String> + Send + Sync>;

/// Result of one recovery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Recovered,
    /// Reload succeeded from this checkpoint version.
    Reloaded { version: u64 },
    Failed(String),
    /// Handed to an operator; the record stays pending.
    Escalated,
}

/// Per-entity-kind handler table.
#[derive(Default)]
pub struct RecoveryExecutor {
    restart: HashMap<EntityKind, RestartHandler>,
    reload: HashMap<EntityKind, ReloadHandler>,
}

impl RecoveryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_restart<F>(&mut self, kind: EntityKind, handler: F)
    where
        F: Fn(&FailureRecord) -> Result<(), String> + Send + Sync + 'static,
    {
        self.restart.insert(kind, Box::new(handler));
    }

    pub fn on_reload<F>(&mut self, kind: EntityKind, handler: F)
    where
        F: Fn(&FailureRecord, &Checkpoint) -> Result<(), String> + Send + Sync + 'static,
    {
        self.reload.insert(kind, Box::new(handler));
    }

    pub fn execute(
        &self,
        record: &FailureRecord,
        action: RecoveryAction,
        checkpoints: &CheckpointStore,
    ) -> RecoveryOutcome {
        match action {
            RecoveryAction::Skip => RecoveryOutcome::Recovered,
            RecoveryAction::Escalate => RecoveryOutcome::Escalated,
            RecoveryAction::Restart => {
                let Some(handler) = self.restart.get(&record.entity_kind) else {
                    return RecoveryOutcome::Failed(format!(
                        "no restart handler for {}",
                        record.entity_kind
                    ));
                };
                match guarded(|| handler(record)) {
                    Ok(()) => {
                        info!(entity = %record.entity_id, "entity restarted");
                        RecoveryOutcome::Recovered
                    }
                    Err(reason) => RecoveryOutcome::Failed(reason),
                }
            }
            RecoveryAction::Reload => {
                let Some(checkpoint) = checkpoints.restore(&record.entity_kind, &record.entity_id)
                else {
                    return RecoveryOutcome::Failed(format!(
                        "no checkpoint for {}:{}",
                        record.entity_kind, record.entity_id
                    ));
                };
                let Some(handler) = self.reload.get(&record.entity_kind) else {
                    return RecoveryOutcome::Failed(format!(
                        "no reload handler for {}",
                        record.entity_kind
                    ));
                };
                match guarded(|| handler(record, checkpoint)) {
                    Ok(()) => {
                        info!(entity = %record.entity_id, version = checkpoint.version, "entity reloaded");
                        RecoveryOutcome::Reloaded {
                            version: checkpoint.version,
                        }
                    }
                    Err(reason) => RecoveryOutcome::Failed(reason),
                }
            }
        }
    }
}

/// Run a handler, turning a panic into an error.
fn guarded(f: impl FnOnce() -> Result<(), String>) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        warn!("recovery handler panicked");
        Err("recovery handler panicked".to_string())
    })
}
