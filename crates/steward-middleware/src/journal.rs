//! [`EventJournal`] – bounded in-memory record of bus traffic.
//!
//! The journal keeps the newest `capacity` events in publish order, each
//! stamped with a sequence number that keeps counting across evictions.
//! Queries select by payload kind, topic or timestamp range, and a
//! [`Replay`] walks the record from any sequence number onward.
//!
//! Nothing is written to disk.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use steward_types::KernelEvent;

use crate::bus::{EventBus, SubscriptionId, Topic};

pub const DEFAULT_JOURNAL_CAPACITY: usize = 1000;

/// One journaled event.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Starts at 1.
    pub sequence: u64,
    pub event: KernelEvent,
}

impl RecordedEvent {
    pub fn kind(&self) -> &'static str {
        self.event.payload.kind()
    }

    pub fn topic(&self) -> Topic {
        Topic::of(&self.event.payload)
    }
}

#[derive(Debug)]
pub struct EventJournal {
    capacity: usize,
    entries: VecDeque<RecordedEvent>,
    next_sequence: u64,
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl EventJournal {
    /// A journal holding at most `capacity` events.  `0` records nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
            next_sequence: 1,
        }
    }

    /// Record every event published on `bus` into `journal`.
    pub fn attach(journal: &Arc<Mutex<EventJournal>>, bus: &EventBus) -> SubscriptionId {
        let journal = Arc::clone(journal);
        bus.on_any(move |event| {
            journal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(event.clone());
        })
    }

    /// Append `event`, evicting the oldest entry when full.  Returns the
    /// sequence number it was given.
    pub fn record(&mut self, event: KernelEvent) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        if self.capacity == 0 {
            return sequence;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RecordedEvent { sequence, event });
        sequence
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total events ever recorded, evicted ones included.
    pub fn recorded(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.front().map(|r| r.sequence)
    }

    pub fn get(&self, sequence: u64) -> Option<&RecordedEvent> {
        let first = self.first_sequence()?;
        let index = usize::try_from(sequence.checked_sub(first)?).ok()?;
        self.entries.get(index)
    }

    pub fn by_kind(&self, kind: &str) -> Vec<&RecordedEvent> {
        self.entries.iter().filter(|r| r.kind() == kind).collect()
    }

    pub fn by_topic(&self, topic: Topic) -> Vec<&RecordedEvent> {
        self.entries.iter().filter(|r| r.topic() == topic).collect()
    }

    /// Events stamped within `[start, end]`.
    pub fn in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&RecordedEvent> {
        self.entries
            .iter()
            .filter(|r| r.event.timestamp >= start && r.event.timestamp <= end)
            .collect()
    }

    /// The newest `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<&RecordedEvent> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    /// Walk the journal from the oldest retained event.
    pub fn replay(&self) -> Replay<'_> {
        Replay {
            entries: &self.entries,
            index: 0,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cursor over a journal snapshot.  Iterates oldest to newest.
pub struct Replay<'a> {
    entries: &'a VecDeque<RecordedEvent>,
    index: usize,
}

impl Replay<'_> {
    /// Position the cursor on `sequence`.  Sequences older than the oldest
    /// retained event land on it; newer ones exhaust the cursor.
    pub fn seek(&mut self, sequence: u64) {
        self.index = self.entries.partition_point(|r| r.sequence < sequence);
    }

    /// Sequence of the event `next` will return.
    pub fn position(&self) -> Option<u64> {
        self.entries.get(self.index).map(|r| r.sequence)
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.index
    }
}

impl<'a> Iterator for Replay<'a> {
    type Item = &'a RecordedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.index)?;
        self.index += 1;
        Some(entry)
    }
}
