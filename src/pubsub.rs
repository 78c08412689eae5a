//! Topic broadcast between sessions.
//!
//! A session subscribes with a [`Subscriber`] that forwards deliveries into
//! its own message queue, so a broadcast becomes an ordinary info event there.
//! Delivery never blocks the publisher: a subscriber whose queue is full
//! misses the message, and one whose session is gone is removed.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::view::InfoEvent;

/// Identifies one subscribing session across topics.
pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Receiver is alive but could not take the message now.
    Dropped,
    /// Receiver is gone; unsubscribe it.
    Closed,
}

pub trait Subscriber: Send + Sync {
    fn deliver(&self, event: InfoEvent) -> Delivery;
}

pub trait PubSub: Send + Sync {
    fn subscribe(&self, topic: &str, id: SubscriberId, subscriber: Arc<dyn Subscriber>);

    fn unsubscribe(&self, topic: &str, id: SubscriberId);

    /// Remove `id` from every topic.
    fn unsubscribe_all(&self, id: SubscriberId);

    /// Deliver `message` to every subscriber of `topic`; returns how many took it.
    fn publish(&self, topic: &str, message: &Value) -> usize;
}

/// Process-local pub/sub.
#[derive(Default)]
pub struct InMemoryPubSub {
    topics: DashMap<String, Vec<(SubscriberId, Arc<dyn Subscriber>)>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }
}

impl PubSub for InMemoryPubSub {
    fn subscribe(&self, topic: &str, id: SubscriberId, subscriber: Arc<dyn Subscriber>) {
        let mut subs = self.topics.entry(topic.to_string()).or_default();
        if subs.iter().any(|(existing, _)| *existing == id) {
            return;
        }
        subs.push((id, subscriber));
        crate::debug!("pubsub"; "subscriber {} joined '{}'", id, topic);
    }

    fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|(existing, _)| *existing != id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    fn unsubscribe_all(&self, id: SubscriberId) {
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().retain(|(existing, _)| *existing != id);
        }
        self.topics.retain(|_, subs| !subs.is_empty());
    }

    fn publish(&self, topic: &str, message: &Value) -> usize {
        let Some(mut subs) = self.topics.get_mut(topic) else {
            return 0;
        };
        let mut delivered = 0;
        subs.retain(|(id, subscriber)| {
            match subscriber.deliver(InfoEvent::with_payload(topic, message.clone())) {
                Delivery::Delivered => {
                    delivered += 1;
                    true
                }
                Delivery::Dropped => {
                    crate::warn!("pubsub"; "subscriber {} is backed up; dropped message on '{}'", id, topic);
                    true
                }
                Delivery::Closed => false,
            }
        });
        delivered
    }
}

// ============================================================================
// Tests
// ============================================================================
