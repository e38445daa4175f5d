//! `steward-middleware` – the kernel's event plumbing.
//!
//! Routes [`KernelEvent`][steward_types::KernelEvent]s between components
//! without caring about their meaning.  Components never mutate each other's
//! state; they publish here and react to what they hear.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-partitioned publish/subscribe bus.  Synchronous
//!   listeners are invoked in subscription order with panic isolation, and
//!   async consumers receive the same traffic over Tokio broadcast lanes.
//! - [`journal`] – bounded in-memory event record with kind, topic and time
//!   queries plus a seekable replay cursor.

pub mod bus;
pub mod journal;

pub use bus::{EventBus, Listener, SubscriptionId, Topic, TopicReceiver};
pub use journal::{DEFAULT_JOURNAL_CAPACITY, EventJournal, RecordedEvent, Replay};
