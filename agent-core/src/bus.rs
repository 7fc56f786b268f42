//! In-process publish/subscribe fan-out (spec §4.2).
//!
//! Built directly on [`tokio::sync::broadcast`], the same way the teacher's
//! `lexe-tokio::events_bus::EventsBus<T>` does it: `notify` is best-effort
//! (an error with no active receivers is not a failure worth propagating),
//! and a lagging subscriber drops the oldest unread events rather than
//! stalling the publisher.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{BalanceSnapshot, LedgerEntry};

/// The bus carries a fixed sum-type of events; boundary adapters (e.g. the
/// SSE handler) serialize these as-is.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Bootstrap,
    LedgerEntry(LedgerEntry),
    BalanceSnapshot(BalanceSnapshot),
    QueueUpdate { endpoint: String },
    PaymentStatus { payment_id: String, status: String },
}

/// Default broadcast channel capacity. A lagging subscriber that falls more
/// than this many events behind will observe a gap rather than blocking the
/// publisher.
const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// Cloneable handle to the bus. Call [`EventBus::publish`] to send an event;
/// call [`EventBus::subscribe`] to get a fresh receiver.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_SIZE).0,
        }
    }

    /// Publish an event. A noop if there are currently no subscribers.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// A live subscription to the [`EventBus`]. Dropping it is the (idempotent)
/// unsubscribe.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Waits for the next event. Returns `None` only if the bus itself has
    /// been torn down, which cannot happen while any [`EventBus`] handle
    /// (and therefore its sender) is still alive.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bus subscriber lagged, dropping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn publish_before_subscribe_is_not_observed() {
        let bus = EventBus::new();
        bus.publish(Event::Bootstrap);
        let mut sub = bus.subscribe();
        bus.publish(Event::QueueUpdate {
            endpoint: "market".to_string(),
        });
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, Event::QueueUpdate { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();
        bus.publish(Event::Bootstrap);
        assert!(matches!(sub1.recv().await, Some(Event::Bootstrap)));
        assert!(matches!(sub2.recv().await, Some(Event::Bootstrap)));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::Bootstrap);
    }
}
