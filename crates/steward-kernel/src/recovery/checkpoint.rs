//! Last-write-wins state snapshots keyed by entity.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_types::EntityKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Starts at 1 and grows by one with every save.
    pub version: u64,
    pub state: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// Holds the latest checkpoint of each entity.  No history is kept.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    latest: HashMap<(EntityKind, String), Checkpoint>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entity's checkpoint, bumping its version.
    pub fn save(&mut self, kind: &EntityKind, id: &str, state: serde_json::Value) -> &Checkpoint {
        let checkpoint = |version| Checkpoint {
            entity_kind: kind.clone(),
            entity_id: id.to_string(),
            version,
            state,
            saved_at: Utc::now(),
        };
        match self.latest.entry((kind.clone(), id.to_string())) {
            Entry::Occupied(slot) => {
                let slot = slot.into_mut();
                *slot = checkpoint(slot.version + 1);
                slot
            }
            Entry::Vacant(slot) => slot.insert(checkpoint(1)),
        }
    }

    pub fn restore(&self, kind: &EntityKind, id: &str) -> Option<&Checkpoint> {
        self.latest.get(&(kind.clone(), id.to_string()))
    }

    /// All checkpoints, most recently saved first.
    pub fn list(&self) -> Vec<&Checkpoint> {
        let mut all: Vec<&Checkpoint> = self.latest.values().collect();
        all.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        all
    }

    pub fn remove(&mut self, kind: &EntityKind, id: &str) -> bool {
        self.latest.remove(&(kind.clone(), id.to_string())).is_some()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
