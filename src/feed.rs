// Linepulse - Production-line telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! In-process publish/subscribe
//!
//! A [`Broadcaster`] fans each published event out to every live
//! [`Subscription`]. Subscriptions may be scoped to a topic (a machine id);
//! topic events reach topic subscribers and unscoped subscribers alike.
//!
//! A [`Subscription`] unregisters itself when dropped, so a consumer that
//! returns early or unwinds never leaks a channel.
//!
//! Delivery is at-least-once from the consumer's point of view: the
//! aggregator may re-publish full machine state after a reseed, so
//! subscribers must apply events idempotently.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::pulse::RawPulse;

/// Event on the realtime pulse feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A pulse row was inserted into the store
    Pulse(RawPulse),
    /// The feed session was re-established; events may have been lost
    Reconnected,
}

/// Why a receive returned without an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// Nothing arrived within the timeout
    Timeout,
    /// The broadcaster is gone
    Closed,
}

struct Entry<T> {
    topic: Option<String>,
    sender: Sender<T>,
}

struct Registry<T> {
    next_id: u64,
    entries: HashMap<u64, Entry<T>>,
}

/// Fan-out publisher
pub struct Broadcaster<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> std::fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Clone + Send> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

impl<T: Clone + Send> Broadcaster<T> {
    /// Create a broadcaster with no subscribers
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> Subscription<T> {
        self.register(None)
    }

    /// Subscribe to events for one topic
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> Subscription<T> {
        self.register(Some(topic.into()))
    }

    fn register(&self, topic: Option<String>) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel();
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(id, Entry { topic, sender });
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Publish to unscoped subscribers. Returns the number of deliveries.
    pub fn publish(&self, event: T) -> usize {
        self.deliver(None, event)
    }

    /// Publish to subscribers of `topic` and to unscoped subscribers
    pub fn publish_topic(&self, topic: &str, event: T) -> usize {
        self.deliver(Some(topic), event)
    }

    fn deliver(&self, topic: Option<&str>, event: T) -> usize {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, entry) in registry.entries.iter() {
            let wanted = match (&entry.topic, topic) {
                (None, _) => true,
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
            };
            if !wanted {
                continue;
            }
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        for id in dead {
            registry.entries.remove(&id);
        }
        delivered
    }
}

/// Receiving end of a broadcaster; unsubscribes on drop
pub struct Subscription<T> {
    id: u64,
    receiver: Receiver<T>,
    registry: Weak<Mutex<Registry<T>>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<T> Subscription<T> {
    /// Block until an event arrives or the broadcaster is dropped
    pub fn recv(&self) -> Result<T, RecvError> {
        self.receiver.recv().map_err(|_| RecvError::Closed)
    }

    /// Block for at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RecvError::Timeout,
            RecvTimeoutError::Disconnected => RecvError::Closed,
        })
    }

    /// Next queued event, if any
    pub fn try_recv(&self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    /// Whether the broadcaster still exists
    pub fn is_connected(&self) -> bool {
        self.registry.strong_count() > 0
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entries
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out() {
        let hub: Broadcaster<u32> = Broadcaster::new();
        let a = hub.subscribe();
        let b = hub.subscribe();

        assert_eq!(hub.publish(7), 2);
        assert_eq!(a.try_recv(), Some(7));
        assert_eq!(b.try_recv(), Some(7));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub: Broadcaster<u32> = Broadcaster::new();
        let a = hub.subscribe();
        {
            let _b = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 2);
        }
        assert_eq!(hub.subscriber_count(), 1);
        drop(a);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(1), 0);
    }

    #[test]
    fn test_unsubscribe_on_early_return() {
        fn consume_until(hub: &Broadcaster<u32>, stop_at: u32) -> Result<(), String> {
            let sub = hub.subscribe();
            for event in sub.drain() {
                if event == stop_at {
                    return Err("stopped".to_string());
                }
            }
            Ok(())
        }

        let hub: Broadcaster<u32> = Broadcaster::new();
        assert!(consume_until(&hub, 3).is_ok());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_topic_filtering() {
        let hub: Broadcaster<&'static str> = Broadcaster::new();
        let m1 = hub.subscribe_topic("m1");
        let m2 = hub.subscribe_topic("m2");
        let all = hub.subscribe();

        assert_eq!(hub.publish_topic("m1", "a"), 2);
        assert_eq!(m1.drain(), vec!["a"]);
        assert!(m2.drain().is_empty());
        assert_eq!(all.drain(), vec!["a"]);

        // unscoped publish does not reach topic subscribers
        assert_eq!(hub.publish("b"), 1);
        assert!(m1.drain().is_empty());
    }

    #[test]
    fn test_closed_when_broadcaster_dropped() {
        let hub: Broadcaster<u32> = Broadcaster::new();
        let sub = hub.subscribe();
        hub.publish(1);
        drop(hub);

        assert!(!sub.is_connected());
        assert_eq!(sub.recv(), Ok(1));
        assert_eq!(sub.recv(), Err(RecvError::Closed));
    }

    #[test]
    fn test_recv_timeout() {
        let hub: Broadcaster<u32> = Broadcaster::new();
        let sub = hub.subscribe();
        assert_eq!(
            sub.recv_timeout(Duration::from_millis(10)),
            Err(RecvError::Timeout)
        );
    }
}
