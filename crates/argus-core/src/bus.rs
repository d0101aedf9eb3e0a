//! In-process pub/sub bus with typed topics and bounded subscribers.
//!
//! Each topic kind carries exactly one payload type, so publishing and
//! subscribing are compile-time checked: the `event` topic carries
//! [`Event`]s, and each `(namespace, subscription)` topic carries
//! [`CheckRequest`]s. Payloads travel as `Arc<T>` so fan-out never clones
//! the document.
//!
//! Delivery is best-effort per subscriber: every subscriber owns a bounded
//! queue, publish never blocks, and a full queue drops the newest message
//! for that subscriber only (a slow subscriber cannot stall the others).
//! Subscribers leave by dropping their [`Subscription`]; the topic prunes
//! closed queues on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

use crate::check::CheckRequest;
use crate::entity::Entity;
use crate::event::Event;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1000;

/// A receiver half registered with a topic.
///
/// Dropping the subscription closes the queue; the topic notices and
/// removes the subscriber on a subsequent publish.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<Arc<T>>,
}

impl<T> Subscription<T> {
    /// Receives the next message, or `None` once unsubscribed from a
    /// dropped topic.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        self.rx.try_recv().ok()
    }

    /// The subscriber id assigned by the topic.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct TopicSubscriber<T> {
    id: u64,
    tx: mpsc::Sender<Arc<T>>,
}

/// A single named channel carrying one payload type.
pub struct Topic<T> {
    name: String,
    buffer: usize,
    subscribers: RwLock<Vec<TopicSubscriber<T>>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
    dropped: AtomicU64,
}

impl<T> Topic<T> {
    /// Creates a topic whose subscribers buffer up to `buffer` messages.
    #[must_use]
    pub fn new(name: impl Into<String>, buffer: usize) -> Self {
        Self {
            name: name.into(),
            buffer: buffer.max(1),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .push(TopicSubscriber { id, tx });
        Subscription { id, rx }
    }

    /// Current live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("bus subscriber lock poisoned")
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Messages dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Fans the message out to every live subscriber.
    ///
    /// Returns the number of subscribers the message was delivered to.
    /// Full subscriber queues drop this message for that subscriber only.
    pub fn publish(&self, msg: Arc<T>) -> usize {
        let snapshot = self.sender_snapshot();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in &snapshot {
            match tx.try_send(Arc::clone(&msg)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(topic = %self.name, subscriber = id, "dropped message: queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        if !closed.is_empty() {
            self.prune(&closed);
        }
        delivered
    }

    /// Delivers the message to exactly one live subscriber, rotating
    /// through them across calls.
    ///
    /// Returns `false` when no subscriber could accept the message; the
    /// caller treats that as a best-effort miss.
    pub fn publish_round_robin(&self, msg: Arc<T>) -> bool {
        let snapshot = self.sender_snapshot();
        if snapshot.is_empty() {
            return false;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut closed = Vec::new();
        let mut sent = false;
        for offset in 0..snapshot.len() {
            let (id, tx) = &snapshot[(start + offset) % snapshot.len()];
            match tx.try_send(Arc::clone(&msg)) {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        if !closed.is_empty() {
            self.prune(&closed);
        }
        sent
    }

    /// Publish reads a snapshot so subscriber registration never contends
    /// with delivery.
    fn sender_snapshot(&self) -> Vec<(u64, mpsc::Sender<Arc<T>>)> {
        self.subscribers
            .read()
            .expect("bus subscriber lock poisoned")
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect()
    }

    fn prune(&self, closed: &[u64]) {
        self.subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .retain(|s| !closed.contains(&s.id));
    }
}

/// Key addressing a `(namespace, subscription)` check-request topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionTopic {
    /// Namespace of the subscription.
    pub namespace: String,
    /// Subscription name.
    pub subscription: String,
}

impl SubscriptionTopic {
    /// Creates a topic key.
    pub fn new(namespace: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            subscription: subscription.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscription:{}:{}", self.namespace, self.subscription)
    }
}

/// The process-wide bus: the event and keepalive-timeout topics plus
/// per-subscription request topics created on demand.
pub struct MessageBus {
    events: Topic<Event>,
    keepalive_timeouts: Topic<Entity>,
    requests: Mutex<HashMap<SubscriptionTopic, Arc<Topic<CheckRequest>>>>,
    buffer: usize,
}

impl MessageBus {
    /// Creates a bus whose subscribers buffer up to `buffer` messages.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            events: Topic::new("event", buffer),
            keepalive_timeouts: Topic::new("keepalive_timeout", buffer),
            requests: Mutex::new(HashMap::new()),
            buffer,
        }
    }

    /// Subscribes to all ingested events.
    pub fn subscribe_events(&self) -> Subscription<Event> {
        self.events.subscribe()
    }

    /// Publishes an ingested event; returns the delivery count.
    pub fn publish_event(&self, event: Arc<Event>) -> usize {
        self.events.publish(event)
    }

    /// Messages dropped on the event topic.
    pub fn event_drops(&self) -> u64 {
        self.events.dropped()
    }

    /// Subscribes to entities whose keepalive TTL expired.
    pub fn subscribe_keepalive_timeouts(&self) -> Subscription<Entity> {
        self.keepalive_timeouts.subscribe()
    }

    /// Announces an expired entity; no subscribers is a no-op.
    pub fn publish_keepalive_timeout(&self, entity: Arc<Entity>) -> usize {
        self.keepalive_timeouts.publish(entity)
    }

    /// Returns the request topic for `(namespace, subscription)`,
    /// creating it on first use.
    pub fn subscription_topic(&self, key: &SubscriptionTopic) -> Arc<Topic<CheckRequest>> {
        let mut topics = self.requests.lock().expect("bus topic lock poisoned");
        Arc::clone(
            topics
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Topic::new(key.to_string(), self.buffer))),
        )
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckConfig;
    use crate::meta::ObjectMeta;

    fn request(name: &str) -> Arc<CheckRequest> {
        Arc::new(CheckRequest {
            config: CheckConfig {
                metadata: ObjectMeta::namespaced("default", name),
                interval: 10,
                ..CheckConfig::default()
            },
            issued: 1,
            proxy_entity_name: String::new(),
        })
    }

    #[test]
    fn fanout_reaches_every_subscriber() {
        let topic: Topic<CheckRequest> = Topic::new("t", 8);
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();

        assert_eq!(topic.publish(request("mem")), 2);
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
    }

    #[test]
    fn round_robin_delivers_to_exactly_one() {
        let topic: Topic<CheckRequest> = Topic::new("t", 8);
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();

        for _ in 0..4 {
            assert!(topic.publish_round_robin(request("mem")));
        }
        let got_a = std::iter::from_fn(|| a.try_recv()).count();
        let got_b = std::iter::from_fn(|| b.try_recv()).count();
        assert_eq!(got_a + got_b, 4);
        assert_eq!(got_a, 2);
        assert_eq!(got_b, 2);
    }

    #[test]
    fn round_robin_without_subscribers_is_a_miss() {
        let topic: Topic<CheckRequest> = Topic::new("t", 8);
        assert!(!topic.publish_round_robin(request("mem")));
    }

    #[test]
    fn full_queue_drops_newest_for_that_subscriber_only() {
        let topic: Topic<CheckRequest> = Topic::new("t", 1);
        let mut slow = topic.subscribe();
        let mut fast = topic.subscribe();

        assert_eq!(topic.publish(request("a")), 2);
        // Drain only the fast subscriber; the slow one's queue stays full.
        assert!(fast.try_recv().is_some());

        assert_eq!(topic.publish(request("b")), 1);
        assert_eq!(topic.dropped(), 1);
        assert!(fast.try_recv().is_some());
        // The slow subscriber still holds only the first message.
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn dropped_subscription_is_pruned_on_publish() {
        let topic: Topic<CheckRequest> = Topic::new("t", 8);
        let sub = topic.subscribe();
        drop(sub);
        assert_eq!(topic.publish(request("mem")), 0);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[test]
    fn keepalive_timeout_topic_fans_out() {
        let bus = MessageBus::new(8);
        // Publishing with no subscribers is a quiet miss.
        assert_eq!(bus.publish_keepalive_timeout(Arc::new(Entity::default())), 0);

        let mut sub = bus.subscribe_keepalive_timeouts();
        assert_eq!(bus.publish_keepalive_timeout(Arc::new(Entity::default())), 1);
        assert!(sub.try_recv().is_some());
    }

    #[test]
    fn subscription_topics_are_shared_by_key() {
        let bus = MessageBus::new(8);
        let key = SubscriptionTopic::new("default", "linux");
        let t1 = bus.subscription_topic(&key);
        let t2 = bus.subscription_topic(&key);
        let mut sub = t1.subscribe();
        t2.publish(request("mem"));
        assert!(sub.try_recv().is_some());
    }
}
