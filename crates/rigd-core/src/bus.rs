//! Publish/subscribe event bus decoupling daemons from consumers.
//!
//! Delivery is fan-out over a single bounded broadcast channel: publish order
//! is preserved for every subscriber (and therefore per topic), publishing
//! never blocks, and a slow subscriber drops the *oldest* buffered events —
//! observable as [`BusEvent::Lagged`] — instead of stalling producers whose
//! loops sit on hardware timing. Events are transient: a subscriber that
//! joins after publication does not see past events.
//!
//! Subscribers pull from their own [`Subscription`] handle, so a panicking or
//! abandoned consumer can never break publishing for the others.

use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// A single published event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Dot-delimited topic (e.g. `command.completed`, `reading.flipper`).
    pub topic: String,
    /// Payload.
    pub payload: Value,
    /// When the event was published.
    pub timestamp: SystemTime,
    /// Who published it (daemon name or component).
    pub publisher: String,
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A delivered event.
    Event(Event),
    /// This subscriber fell behind; carries the number of events dropped
    /// (oldest first) across all topics before delivery resumed.
    Lagged(u64),
}

/// Cloneable handle to the bus. All clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` events for slow subscribers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(2));
        Self { tx }
    }

    /// Publish an event. Fire-and-forget: never blocks, never fails, even
    /// with zero subscribers.
    pub fn publish(&self, topic: &str, payload: Value) {
        self.publish_as("core", topic, payload);
    }

    /// Publish with an explicit publisher name.
    pub fn publish_as(&self, publisher: &str, topic: &str, payload: Value) {
        trace!(topic, publisher, "publish");
        let _ = self.tx.send(Event {
            topic: topic.to_string(),
            payload,
            timestamp: SystemTime::now(),
            publisher: publisher.to_string(),
        });
    }

    /// Subscribe to topics matching `pattern`.
    ///
    /// Patterns are an exact topic, a trailing-wildcard prefix
    /// (`"command.*"` matches `command.completed` but not `command`), or
    /// `"*"` for everything.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
            pattern: TopicPattern::parse(pattern),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicPattern {
    All,
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::All
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Self::Prefix(format!("{prefix}."))
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(t) => topic == t,
            Self::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

/// One subscriber's handle.
///
/// Dropping the handle unsubscribes; [`Subscription::unsubscribe`] does the
/// same explicitly and is idempotent.
pub struct Subscription {
    rx: Option<broadcast::Receiver<Event>>,
    pattern: TopicPattern,
}

impl Subscription {
    /// Receive the next matching event.
    ///
    /// Returns `None` once the bus is gone or after
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn next(&mut self) -> Option<BusEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if self.pattern.matches(&event.topic) {
                        return Some(BusEvent::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(BusEvent::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next matching event, skipping lag notices.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.next().await? {
                BusEvent::Event(event) => return Some(event),
                BusEvent::Lagged(_) => continue,
            }
        }
    }

    /// Release the subscription. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }
}
