//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Two delivery paths share every published event:
//!
//! * **Listeners** (`on` / `on_any` / `unsubscribe`) – synchronous callbacks
//!   invoked on the publisher's thread, in subscription order.  A listener
//!   that panics is caught and logged; delivery continues with the next one.
//! * **Receivers** (`subscribe_to` / `subscribe`) – [`tokio::sync::broadcast`]
//!   lanes so async consumers can `recv().await` without blocking anyone.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Lifecycle`] | Kernel state transitions |
//! | [`Topic::Scheduling`] | Clock ticks, task submission and completion |
//! | [`Topic::Resources`] | Pressure events and adaptive actions |
//! | [`Topic::Security`] | Audit entries, access granted / denied |
//! | [`Topic::Recovery`] | Failures, recoveries, escalations, checkpoints |

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use steward_types::{EventPayload, KernelEvent};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow receivers).
const DEFAULT_CAPACITY: usize = 256;

/// First-class routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Lifecycle,
    Scheduling,
    Resources,
    Security,
    Recovery,
}

impl Topic {
    /// The lane a payload is routed to.
    pub fn of(payload: &EventPayload) -> Topic {
        use EventPayload::*;
        match payload {
            StateChanged { .. } => Topic::Lifecycle,
            Tick { .. }
            | TaskSubmitted { .. }
            | TaskReady { .. }
            | TaskStarted { .. }
            | TaskProgress { .. }
            | TaskCompleted { .. }
            | TaskFailed { .. }
            | TaskCancelled { .. } => Topic::Scheduling,
            Pressure { .. } | Adaptation { .. } => Topic::Resources,
            Audit { .. } | AccessGranted { .. } | AccessDenied { .. } => Topic::Security,
            FailureDetected { .. }
            | Recovered { .. }
            | RecoveryFailed { .. }
            | Escalation { .. }
            | CheckpointSaved { .. }
            | CheckpointRestored { .. } => Topic::Recovery,
        }
    }
}

/// Synchronous event callback.
pub type Listener = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`]; pass it to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ListenerEntry {
    id: SubscriptionId,
    topic: Option<Topic>,
    listener: Listener,
}

/// Shared event bus.  Clone it cheaply – all clones share the same listener
/// registry and broadcast channels.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use steward_middleware::{EventBus, Topic};
/// use steward_types::{EventPayload, KernelEvent};
///
/// let bus = EventBus::default();
/// let ticks = Arc::new(AtomicUsize::new(0));
/// let seen = Arc::clone(&ticks);
/// let handle = bus.on(Topic::Scheduling, move |_| { seen.fetch_add(1, Ordering::SeqCst); });
///
/// bus.publish(KernelEvent::new("doc", EventPayload::Tick { tick: 1 }));
/// assert_eq!(ticks.load(Ordering::SeqCst), 1);
///
/// assert!(bus.unsubscribe(handle));
/// bus.publish(KernelEvent::new("doc", EventPayload::Tick { tick: 2 }));
/// assert_eq!(ticks.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<Mutex<Vec<ListenerEntry>>>,
    next_id: Arc<AtomicU64>,
    // Global channel
    sender: broadcast::Sender<KernelEvent>,
    // Per-topic channels
    lifecycle: broadcast::Sender<KernelEvent>,
    scheduling: broadcast::Sender<KernelEvent>,
    resources: broadcast::Sender<KernelEvent>,
    security: broadcast::Sender<KernelEvent>,
    recovery: broadcast::Sender<KernelEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity);
        let (scheduling, _) = broadcast::channel(capacity);
        let (resources, _) = broadcast::channel(capacity);
        let (security, _) = broadcast::channel(capacity);
        let (recovery, _) = broadcast::channel(capacity);
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            sender,
            lifecycle,
            scheduling,
            resources,
            security,
            recovery,
        }
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish `event` to its topic.
    ///
    /// Listeners run first, synchronously and in subscription order; then the
    /// event is handed to the topic lane and the global lane.  Returns the
    /// number of listeners and receivers reached.  Reaching nobody is a
    /// normal condition, not an error.
    pub fn publish(&self, event: KernelEvent) -> usize {
        let topic = Topic::of(&event.payload);
        let mut delivered = self.notify_listeners(topic, &event);
        delivered += self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        delivered += self.sender.send(event).unwrap_or(0);
        delivered
    }

    /// Convenience: wrap `payload` in a fresh [`KernelEvent`] and publish it.
    pub fn emit(&self, source: &str, payload: EventPayload) -> usize {
        self.publish(KernelEvent::new(source, payload))
    }

    fn notify_listeners(&self, topic: Topic, event: &KernelEvent) -> usize {
        // Snapshot under the lock, invoke outside it so listeners may
        // subscribe, unsubscribe or publish re-entrantly.
        let targets: Vec<(SubscriptionId, Listener)> = self
            .registry()
            .iter()
            .filter(|e| e.topic.is_none_or(|t| t == topic))
            .map(|e| (e.id, Arc::clone(&e.listener)))
            .collect();

        let mut delivered = 0;
        for (id, listener) in targets {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    warn!(subscription = id.0, ?topic, panic = %msg, "event listener panicked");
                }
            }
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Listener API
    // -----------------------------------------------------------------------

    /// Register a synchronous listener for one topic.
    pub fn on<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&KernelEvent) + Send + Sync + 'static,
    {
        self.register(Some(topic), Arc::new(listener))
    }

    /// Register a synchronous listener for every topic.
    pub fn on_any<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&KernelEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Remove a listener.  Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let before = registry.len();
        registry.retain(|e| e.id != id);
        registry.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registry().len()
    }

    fn register(&self, topic: Option<Topic>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry().push(ListenerEntry {
            id,
            topic,
            listener,
        });
        id
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Receiver API
    // -----------------------------------------------------------------------

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to all events on the global broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.sender.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<KernelEvent> {
        match topic {
            Topic::Lifecycle => &self.lifecycle,
            Topic::Scheduling => &self.scheduling,
            Topic::Resources => &self.resources,
            Topic::Security => &self.security,
            Topic::Recovery => &self.recovery,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<KernelEvent>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(Lagged(n))` means the receiver fell behind and `n` events were
    /// dropped; `Err(Closed)` means the bus has shut down.
    pub async fn recv(&mut self) -> Result<KernelEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<KernelEvent, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use steward_types::KernelState;

    fn tick(n: u64) -> KernelEvent {
        KernelEvent::new("steward-middleware::test", EventPayload::Tick { tick: n })
    }

    fn state_changed() -> KernelEvent {
        KernelEvent::new(
            "steward-middleware::test",
            EventPayload::StateChanged {
                from: KernelState::Init,
                to: KernelState::Active,
                reason: "boot".into(),
            },
        )
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.on(Topic::Scheduling, move |_| order.lock().unwrap().push(n));
        }
        bus.publish(tick(1));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = Arc::clone(&hits);
        bus.on(Topic::Scheduling, move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        bus.on(Topic::Scheduling, |_| panic!("listener failure"));
        let h2 = Arc::clone(&hits);
        bus.on(Topic::Scheduling, move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.publish(tick(1));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(delivered, 2);

        // The bus is still usable afterwards.
        bus.publish(tick(2));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn topic_listener_ignores_other_topics() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on(Topic::Lifecycle, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(tick(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.publish(state_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_any_sees_every_topic() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on_any(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(tick(1));
        bus.publish(state_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.on_any(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(tick(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_publish_reentrantly() {
        let bus = EventBus::default();
        let inner = bus.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on(Topic::Lifecycle, move |_| {
            inner.publish(tick(99));
        });
        bus.on(Topic::Scheduling, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(state_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(tick(1)), 0);
    }

    #[tokio::test]
    async fn topic_receiver_gets_only_its_lane() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut lifecycle = bus.subscribe_to(Topic::Lifecycle);
        let mut scheduling = bus.subscribe_to(Topic::Scheduling);

        bus.publish(tick(7));

        let got = scheduling.recv().await?;
        assert!(matches!(got.payload, EventPayload::Tick { tick: 7 }));
        assert_eq!(scheduling.topic(), Topic::Scheduling);

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), lifecycle.recv()).await;
        assert!(result.is_err(), "lifecycle lane must not see a tick");
        Ok(())
    }

    #[tokio::test]
    async fn global_receiver_sees_everything() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let event = state_changed();
        bus.publish(event.clone());
        assert_eq!(rx.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn slow_receiver_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Scheduling);
        for n in 0..1_000 {
            bus.publish(tick(n));
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
