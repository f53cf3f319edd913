//! A named-topic pub/sub primitive. Variable change notifications and the
//! lifecycle engine's completion events both travel through it.

use std::collections::HashMap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::Value;

/// An event delivered to a [`Subscription`].
#[derive(Clone)]
pub struct Event {
    /// The topic the event was published on.
    pub topic: String,
    /// The payload supplied to [`Emitter::publish`].
    pub value: Value,
}

/// Delivery report for a single publish: how many subscriptions received
/// the event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub receivers: usize,
}

/// Completion handle returned by [`Emitter::publish`]. Resolves once the
/// event has been handed to every live subscriber queue.
pub struct Done(Receiver<Delivery>);

impl Done {
    /// Block until the publish has been fully delivered.
    pub fn wait(&self) -> Delivery {
        self.0.recv().unwrap_or_default()
    }
}

struct Entry {
    id: u64,
    sender: Sender<Event>,
    once: bool,
}

/// A receive endpoint for one topic. Dropping it without unsubscribing is
/// fine; the emitter prunes dead endpoints on the next publish.
pub struct Subscription {
    topic: String,
    id: u64,
    receiver: Receiver<Event>,
}

impl Subscription {
    /// The topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Block until the next event arrives. Returns `None` once the
    /// subscription can no longer receive anything.
    pub fn recv(&self) -> Option<Event> {
        self.receiver.recv().ok()
    }

    /// Like [`recv`](Self::recv) with an upper bound on the wait.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// A minimal topic-keyed event bus: a subscriber list behind a mutex, one
/// unbounded channel per subscription.
#[derive(Default)]
pub struct Emitter {
    topics: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Emitter {
    pub fn new() -> Emitter {
        Emitter::default()
    }

    /// Subscribe to `topic`. The endpoint stays live until unsubscribed or
    /// dropped.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.add(topic, false)
    }

    /// Subscribe to `topic` for a single event. The endpoint is removed as
    /// soon as one event has been delivered to it.
    pub fn subscribe_once(&self, topic: &str) -> Subscription {
        self.add(topic, true)
    }

    fn add(&self, topic: &str, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, atomic::Ordering::Relaxed);
        let (sender, receiver) = unbounded();
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(Entry { id, sender, once });
        Subscription {
            topic: topic.to_owned(),
            id,
            receiver,
        }
    }

    /// Remove `sub` from its topic. A no-op if it was already removed.
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(entries) = topics.get_mut(&sub.topic) {
            entries.retain(|e| e.id != sub.id);
            if entries.is_empty() {
                topics.remove(&sub.topic);
            }
        }
    }

    /// Publish `value` on `topic`. One-shot subscriptions are removed after
    /// delivery, endpoints whose receiver is gone are pruned.
    pub fn publish(&self, topic: &str, value: Value) -> Done {
        let mut receivers = 0;
        let mut topics = self.topics.lock().unwrap();
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|e| {
                let delivered = e
                    .sender
                    .send(Event {
                        topic: topic.to_owned(),
                        value: value.clone(),
                    })
                    .is_ok();
                if delivered {
                    receivers += 1;
                }
                delivered && !e.once
            });
            if entries.is_empty() {
                topics.remove(topic);
            }
        }
        let (done_tx, done_rx) = bounded(1);
        let _ = done_tx.send(Delivery { receivers });
        Done(done_rx)
    }

    /// Deliver `value` to exactly `sub` and remove it, leaving every other
    /// subscription on the topic untouched.
    pub fn settle(&self, sub: &Subscription, value: Value) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(entries) = topics.get_mut(&sub.topic) {
            if let Some(pos) = entries.iter().position(|e| e.id == sub.id) {
                let entry = entries.remove(pos);
                let _ = entry.sender.send(Event {
                    topic: sub.topic.clone(),
                    value,
                });
            }
            if entries.is_empty() {
                topics.remove(&sub.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn val(s: &str) -> Value {
        Arc::new(s.to_owned())
    }

    fn text(event: &Event) -> String {
        event.value.downcast_ref::<String>().cloned().unwrap()
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let em = Emitter::new();
        let a = em.subscribe("t");
        let b = em.subscribe("t");

        let delivery = em.publish("t", val("x")).wait();
        assert_eq!(delivery.receivers, 2);
        assert_eq!(text(&a.recv().unwrap()), "x");
        assert_eq!(text(&b.recv().unwrap()), "x");
    }

    #[test]
    fn topics_are_independent() {
        let em = Emitter::new();
        let a = em.subscribe("a");
        em.publish("b", val("x"));
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn once_subscription_is_removed_after_first_event() {
        let em = Emitter::new();
        let sub = em.subscribe_once("t");

        assert_eq!(em.publish("t", val("first")).wait().receivers, 1);
        assert_eq!(em.publish("t", val("second")).wait().receivers, 0);
        assert_eq!(text(&sub.recv().unwrap()), "first");
        // The channel is disconnected once the emitter let go of it.
        assert!(sub.recv().is_none());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let em = Emitter::new();
        let sub = em.subscribe("t");
        em.unsubscribe(&sub);
        assert_eq!(em.publish("t", val("x")).wait().receivers, 0);
    }

    #[test]
    fn dropped_endpoints_are_pruned() {
        let em = Emitter::new();
        drop(em.subscribe("t"));
        let live = em.subscribe("t");
        assert_eq!(em.publish("t", val("x")).wait().receivers, 1);
        assert_eq!(text(&live.recv().unwrap()), "x");
    }

    #[test]
    fn settle_hits_only_the_given_subscription() {
        let em = Emitter::new();
        let waiting = em.subscribe_once("t");
        let other = em.subscribe_once("t");

        em.settle(&waiting, val("done"));
        assert_eq!(text(&waiting.recv().unwrap()), "done");
        assert!(other.recv_timeout(Duration::from_millis(20)).is_none());

        // The settled endpoint no longer counts as a receiver.
        assert_eq!(em.publish("t", val("x")).wait().receivers, 1);
    }
}
