//! Lifecycle event types and fan-out
//!
//! Every mutating manager operation emits one [`ProxyEvent`]. Subscribers
//! each own a bounded channel; broadcasting never blocks the publisher, and
//! a subscriber that falls behind loses events only for itself. The enum
//! serializes to the wire schema consumed by the streaming admin API:
//! `{"type": "proxy_started", "timestamp": ..., "proxy_id": ..., "proxy": {...}}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::manager::ProxySnapshot;

/// Buffered events per subscriber before drops set in
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// A proxy lifecycle event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    ProxyAdded {
        timestamp: DateTime<Utc>,
        proxy_id: String,
        proxy: ProxySnapshot,
    },
    ProxyUpdated {
        timestamp: DateTime<Utc>,
        proxy_id: String,
        proxy: ProxySnapshot,
    },
    ProxyStarted {
        timestamp: DateTime<Utc>,
        proxy_id: String,
        proxy: ProxySnapshot,
    },
    ProxyStopped {
        timestamp: DateTime<Utc>,
        proxy_id: String,
        proxy: ProxySnapshot,
    },
    ProxyRemoved {
        timestamp: DateTime<Utc>,
        proxy_id: String,
    },
}

impl ProxyEvent {
    /// Id of the proxy the event concerns
    pub fn proxy_id(&self) -> &str {
        match self {
            ProxyEvent::ProxyAdded { proxy_id, .. }
            | ProxyEvent::ProxyUpdated { proxy_id, .. }
            | ProxyEvent::ProxyStarted { proxy_id, .. }
            | ProxyEvent::ProxyStopped { proxy_id, .. }
            | ProxyEvent::ProxyRemoved { proxy_id, .. } => proxy_id,
        }
    }
}

/// An owned event stream handed out by [`EventBroadcaster::subscribe`]
pub struct EventSubscription {
    id: u64,
    receiver: mpsc::Receiver<ProxyEvent>,
}

impl EventSubscription {
    /// Handle for [`EventBroadcaster::unsubscribe`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<ProxyEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Fan-out of lifecycle events to any number of subscribers
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<ProxyEvent>>>,
    next_id: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with its own bounded buffer
    pub fn subscribe(&self) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.write().insert(id, tx);
        EventSubscription { id, receiver: rx }
    }

    /// Remove a subscriber and close its channel
    pub fn unsubscribe(&self, id: u64) {
        self.write().remove(&id);
    }

    /// Deliver an event to every subscriber without blocking
    ///
    /// A subscriber whose buffer is full loses this event; everyone else
    /// still receives it.
    pub fn broadcast(&self, event: ProxyEvent) {
        let subscribers = self.read();
        for (id, tx) in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                debug!("event subscriber {} is full, dropping {}", id, event.proxy_id());
            }
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, mpsc::Sender<ProxyEvent>>> {
        match self.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, mpsc::Sender<ProxyEvent>>> {
        match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(proxy_id: &str) -> ProxyEvent {
        ProxyEvent::ProxyRemoved {
            timestamp: Utc::now(),
            proxy_id: proxy_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let broadcaster = EventBroadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.broadcast(removed("p1"));

        assert_eq!(a.recv().await.unwrap().proxy_id(), "p1");
        assert_eq!(b.recv().await.unwrap().proxy_id(), "p1");
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_alone() {
        let broadcaster = EventBroadcaster::new();
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for i in 0..EVENT_CHANNEL_CAPACITY {
            broadcaster.broadcast(removed(&format!("p{}", i)));
        }
        // fast drains, slow stays full
        for _ in 0..EVENT_CHANNEL_CAPACITY {
            fast.recv().await.unwrap();
        }

        broadcaster.broadcast(removed("overflow"));

        assert_eq!(fast.recv().await.unwrap().proxy_id(), "overflow");
        for _ in 0..EVENT_CHANNEL_CAPACITY {
            slow.recv().await.unwrap();
        }
        // the overflow event never reached the full subscriber
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let broadcaster = EventBroadcaster::new();
        let mut sub = broadcaster.subscribe();

        broadcaster.broadcast(removed("p1"));
        broadcaster.unsubscribe(sub.id());
        broadcaster.broadcast(removed("p2"));

        assert_eq!(sub.recv().await.unwrap().proxy_id(), "p1");
        assert!(sub.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_schema() {
        let event = removed("p1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "proxy_removed");
        assert_eq!(json["proxy_id"], "p1");
        assert!(json["timestamp"].is_string());
    }
}
