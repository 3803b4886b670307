//! Event emitter for publishing execution events

use super::subscriber::EventSubscriber;
use super::types::{EventEnvelope, ExecutionEvent};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error};

/// Delivery statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub published: u64,
    pub subscriber_failures: u64,
}

/// Event emitter for publishing events.
///
/// Events go both to a broadcast channel (for ad-hoc receivers) and to every
/// registered subscriber. Publishing awaits all subscribers, so no event is
/// dropped on the floor.
pub struct EventEmitter {
    sender: broadcast::Sender<EventEnvelope>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    sequence: AtomicU64,
    subscriber_failures: AtomicU64,
}

impl EventEmitter {
    /// Create a new event emitter with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
            subscriber_failures: AtomicU64::new(0),
        }
    }

    /// Emitter with a logging subscriber already registered
    pub fn with_logging() -> Self {
        let emitter = Self::default();
        let logging: Arc<dyn EventSubscriber> = Arc::new(super::LoggingSubscriber);
        Self {
            subscribers: RwLock::new(vec![logging]),
            ..emitter
        }
    }

    /// Add a subscriber
    pub async fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        debug!("Event subscriber added: {}", subscriber.name());
        self.subscribers.write().await.push(subscriber);
    }

    /// Publish an event to the channel and all interested subscribers
    pub async fn publish(&self, event: ExecutionEvent) {
        let envelope = EventEnvelope {
            event,
            timestamp: SystemTime::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        // No receivers is not an error
        let _ = self.sender.send(envelope.clone());

        let subscribers = self.subscribers.read().await;
        let interested: Vec<_> = subscribers
            .iter()
            .filter(|subscriber| subscriber.is_interested(&envelope.event))
            .cloned()
            .collect();
        drop(subscribers);

        let deliveries = interested.iter().map(|subscriber| {
            let envelope = &envelope;
            async move {
                if let Err(e) = subscriber.handle_event(envelope).await {
                    self.subscriber_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscriber = subscriber.name(),
                        error = %e,
                        "Event subscriber failed to handle event"
                    );
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }

    /// Create a receiver for the broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of registered subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.sequence.load(Ordering::Relaxed),
            subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
