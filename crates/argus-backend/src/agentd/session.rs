//! Per-agent session: the backend half of one transport connection.
//!
//! A session moves through `Handshaking → Running → Draining → Closed`.
//! The handshake requires an `entity_config` message first; on success
//! the agent's entity is reconciled (upsert, `last_seen`, backend labels)
//! and the session subscribes to the entity's subscription topics.
//!
//! While running, the session is the single reader and single writer of
//! its transport. Outbound check requests funnel through a bounded queue
//! with drop-oldest overflow (the scheduler re-fires); direct responses
//! block up to the write timeout and then fail the session. Inbound
//! events that fail validation are counted and dropped, never fatal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use argus_core::bus::{MessageBus, SubscriptionTopic};
use argus_core::entity::Entity;
use argus_core::event::Event;
use argus_core::store::{EntityStore, Store};

use crate::eventd::EventdHandle;
use crate::metrics::BackendMetrics;
use crate::transport::{self, Message, Transport, TransportError};

/// Default depth of the outbound check-request queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 100;

/// Default time an agent has to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the agent's `entity_config`.
    Handshaking,
    /// Authenticated and exchanging messages.
    Running,
    /// No longer accepting outbound work; draining inflight sends.
    Draining,
    /// Terminal.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The handshake failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport failed fatally.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The entity could not be reconciled.
    #[error("entity reconciliation failed: {0}")]
    Entity(String),
}

/// Session tuning knobs, owned by agentd.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Write timeout for transport sends; also drives the ping cadence.
    pub write_timeout: Duration,
    /// Time allowed for the handshake message to arrive.
    pub handshake_timeout: Duration,
    /// Outbound check-request queue depth.
    pub outbound_queue: usize,
    /// Backend-level labels stamped on reconciled entities; the agent's
    /// own labels win on conflict.
    pub labels: std::collections::BTreeMap<String, String>,
    /// Backend-level annotations stamped on reconciled entities.
    pub annotations: std::collections::BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(15),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            labels: std::collections::BTreeMap::new(),
            annotations: std::collections::BTreeMap::new(),
        }
    }
}

/// Bounded outbound queue with drop-oldest overflow.
///
/// Check requests are idempotent snapshots; when the agent cannot drain
/// fast enough the oldest request is the right one to lose, because the
/// scheduler will fire again.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Message>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    /// Creates a queue bounded at `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends a message, evicting the oldest when full.
    pub fn push(&self, msg: Message) {
        {
            let mut inner = self.inner.lock().expect("outbound queue lock poisoned");
            if inner.len() == self.capacity {
                inner.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Waits for the next message.
    pub async fn pop(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            notified.await;
        }
    }

    /// Non-blocking pop, for draining.
    pub fn try_pop(&self) -> Option<Message> {
        self.inner
            .lock()
            .expect("outbound queue lock poisoned")
            .pop_front()
    }

    /// Messages evicted by overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One agent connection on the backend.
pub struct AgentSession<T: Transport> {
    id: String,
    transport: T,
    config: SessionConfig,
    store: Arc<dyn Store>,
    bus: Arc<MessageBus>,
    eventd: EventdHandle,
    metrics: BackendMetrics,
    cancel: CancellationToken,
    state: SessionState,
    invalid_messages: u64,
}

impl<T: Transport> AgentSession<T> {
    /// Creates a session in `Handshaking`.
    pub fn new(
        transport: T,
        config: SessionConfig,
        store: Arc<dyn Store>,
        bus: Arc<MessageBus>,
        eventd: EventdHandle,
        metrics: BackendMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            config,
            store,
            bus,
            eventd,
            metrics,
            cancel,
            state: SessionState::Handshaking,
            invalid_messages: 0,
        }
    }

    /// The session id, for log correlation.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session to completion.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`SessionError`]; a clean shutdown (cancel or
    /// peer close) returns `Ok`.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let entity = match self.handshake().await {
            Ok(entity) => entity,
            Err(err) => {
                self.state = SessionState::Closed;
                self.transport.close().await;
                return Err(err);
            }
        };
        let namespace = entity.metadata.namespace.clone();
        info!(session = %self.id, entity = %entity.metadata, "agent session established");
        self.metrics.session_started(&namespace);
        self.state = SessionState::Running;

        let result = self.running(&entity).await;

        self.state = SessionState::Closed;
        self.transport.close().await;
        self.metrics.session_closed(&namespace);
        info!(
            session = %self.id,
            invalid_messages = self.invalid_messages,
            "agent session closed"
        );
        result
    }

    /// Waits for `entity_config`, reconciles the entity, and returns it.
    async fn handshake(&mut self) -> Result<Entity, SessionError> {
        let msg = match tokio::time::timeout(self.config.handshake_timeout, self.transport.recv())
            .await
        {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => {
                return Err(SessionError::Handshake(
                    "connection closed before handshake".to_string(),
                ))
            }
            Ok(Err(err)) => return Err(SessionError::Transport(err)),
            Err(_) => return Err(SessionError::Handshake("handshake timed out".to_string())),
        };

        if msg.type_ != transport::TYPE_ENTITY_CONFIG {
            return Err(SessionError::Handshake(format!(
                "expected {} message, got {}",
                transport::TYPE_ENTITY_CONFIG,
                msg.type_
            )));
        }
        let mut entity: Entity = serde_json::from_slice(&msg.payload)
            .map_err(|err| SessionError::Handshake(format!("bad entity document: {err}")))?;
        if !entity.metadata.is_complete() {
            return Err(SessionError::Handshake(
                "entity requires namespace and name".to_string(),
            ));
        }

        entity.last_seen = chrono::Utc::now().timestamp();
        for (key, value) in &self.config.labels {
            entity
                .metadata
                .labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (key, value) in &self.config.annotations {
            entity
                .metadata
                .annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.store
            .update_entity(&entity)
            .await
            .map_err(|err| SessionError::Entity(err.to_string()))?;
        Ok(entity)
    }

    /// The `Running` loop: inbound dispatch, outbound drain, liveness.
    async fn running(&mut self, entity: &Entity) -> Result<(), SessionError> {
        let queue = Arc::new(OutboundQueue::new(self.config.outbound_queue));
        let pump_cancel = self.cancel.child_token();
        let pumps = self.spawn_subscription_pumps(entity, &queue, &pump_cancel);

        let ping_interval = self.config.write_timeout / 2;
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_read = tokio::time::Instant::now();

        let result = loop {
            tokio::select! {
                inbound = self.transport.recv() => match inbound {
                    Ok(Some(msg)) => {
                        last_read = tokio::time::Instant::now();
                        if let Err(err) = self.dispatch_inbound(entity, msg).await {
                            break Err(err);
                        }
                    }
                    Ok(None) => {
                        debug!(session = %self.id, "peer closed connection");
                        break Ok(());
                    }
                    Err(err) if err.is_fatal() => break Err(SessionError::Transport(err)),
                    Err(err) => {
                        // Undecodable frame: counted, never fatal.
                        debug!(session = %self.id, error = %err, "invalid frame");
                        self.invalid_messages += 1;
                        self.metrics.event_error("validation");
                    }
                },
                msg = queue.pop() => {
                    if let Err(err) = self
                        .transport
                        .send(msg, self.config.write_timeout)
                        .await
                    {
                        break Err(SessionError::Transport(err));
                    }
                }
                _ = ticker.tick() => {
                    let idle = last_read.elapsed();
                    if idle >= self.config.write_timeout {
                        break Err(SessionError::Transport(TransportError::Closed));
                    }
                    if idle >= ping_interval {
                        let ping = Message::new(transport::TYPE_PING, bytes::Bytes::new());
                        if let Err(err) = self
                            .transport
                            .send(ping, self.config.write_timeout)
                            .await
                        {
                            break Err(SessionError::Transport(err));
                        }
                    }
                }
                () = self.cancel.cancelled() => break Ok(()),
            }
        };

        // Draining: stop accepting outbound work, then flush what is
        // already queued within the grace deadline.
        self.state = SessionState::Draining;
        pump_cancel.cancel();
        for pump in pumps {
            pump.abort();
        }
        if result.is_ok() {
            let deadline = tokio::time::Instant::now() + self.config.write_timeout;
            while let Some(msg) = queue.try_pop() {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                if self
                    .transport
                    .send(msg, self.config.write_timeout)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        result
    }

    /// One pump per subscription topic, funnelling check requests into
    /// the outbound queue.
    fn spawn_subscription_pumps(
        &self,
        entity: &Entity,
        queue: &Arc<OutboundQueue>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let namespace = &entity.metadata.namespace;
        let mut pumps = Vec::new();
        for subscription in entity.effective_subscriptions() {
            let topic = self
                .bus
                .subscription_topic(&SubscriptionTopic::new(namespace, &subscription));
            let mut sub = topic.subscribe();
            let queue = Arc::clone(queue);
            let cancel = cancel.clone();
            let session = self.id.clone();
            pumps.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        request = sub.recv() => {
                            let Some(request) = request else { break };
                            match Message::json(transport::TYPE_CHECK_REQUEST, &*request) {
                                Ok(msg) => queue.push(msg),
                                Err(err) => {
                                    warn!(session = %session, error = %err, "unencodable check request");
                                }
                            }
                        }
                        () = cancel.cancelled() => break,
                    }
                }
            }));
        }
        pumps
    }

    /// Routes one inbound message. Validation failures are counted and
    /// dropped; only direct-response send failures are fatal.
    async fn dispatch_inbound(
        &mut self,
        entity: &Entity,
        msg: Message,
    ) -> Result<(), SessionError> {
        match msg.type_.as_str() {
            transport::TYPE_EVENT | transport::TYPE_KEEPALIVE => {
                match serde_json::from_slice::<Event>(&msg.payload) {
                    Ok(event) if event.validate().is_ok() => {
                        if event.entity.metadata.namespace != entity.metadata.namespace {
                            debug!(session = %self.id, "event namespace mismatch");
                            self.invalid_messages += 1;
                            self.metrics.event_error("validation");
                            return Ok(());
                        }
                        if !self.eventd.submit(event).await {
                            warn!(session = %self.id, "eventd unavailable, dropping event");
                        }
                    }
                    Ok(_) | Err(_) => {
                        self.invalid_messages += 1;
                        self.metrics.event_error("validation");
                    }
                }
                Ok(())
            }
            transport::TYPE_ENTITY_CONFIG => {
                // Agents may re-announce their entity mid-session.
                if let Ok(mut fresh) = serde_json::from_slice::<Entity>(&msg.payload) {
                    if fresh.metadata.namespace == entity.metadata.namespace
                        && fresh.metadata.name == entity.metadata.name
                    {
                        fresh.last_seen = chrono::Utc::now().timestamp();
                        if let Err(err) = self.store.update_entity(&fresh).await {
                            warn!(session = %self.id, error = %err, "entity refresh failed");
                        }
                        return Ok(());
                    }
                }
                self.invalid_messages += 1;
                Ok(())
            }
            transport::TYPE_PING => {
                // Direct response: block up to the write timeout, then
                // the session is fatal.
                let pong = Message::new(transport::TYPE_PONG, bytes::Bytes::new());
                self.transport
                    .send(pong, self.config.write_timeout)
                    .await
                    .map_err(SessionError::Transport)
            }
            transport::TYPE_PONG => Ok(()),
            other => {
                debug!(session = %self.id, type_ = other, "unknown message type");
                self.invalid_messages += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use argus_core::check::{CheckConfig, CheckRequest};
    use argus_core::entity::EntityClass;
    use argus_core::meta::ObjectMeta;
    use argus_core::store::EntityStore;
    use argus_core::EventStore;

    use crate::daemon::Daemon;
    use crate::eventd::Eventd;
    use crate::metrics::MetricsRegistry;
    use crate::store::{MemoryEventStore, MemoryStore};

    /// Channel-backed transport for driving sessions in tests.
    struct FakeTransport {
        incoming: mpsc::Receiver<Message>,
        outgoing: mpsc::Sender<Message>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&mut self, msg: Message, _timeout: Duration) -> Result<(), TransportError> {
            self.outgoing
                .send(msg)
                .await
                .map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
            Ok(self.incoming.recv().await)
        }

        async fn close(&mut self) {}
    }

    struct Harness {
        to_session: mpsc::Sender<Message>,
        from_session: mpsc::Receiver<Message>,
        store: Arc<MemoryStore>,
        event_store: Arc<MemoryEventStore>,
        bus: Arc<MessageBus>,
        eventd: Eventd,
        session: tokio::task::JoinHandle<Result<(), SessionError>>,
        cancel: CancellationToken,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let event_store = Arc::new(MemoryEventStore::new());
        let bus = Arc::new(MessageBus::new(64));
        let metrics = MetricsRegistry::new().unwrap().backend_metrics();

        let mut eventd = Eventd::new(
            2,
            16,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&event_store) as Arc<dyn EventStore>,
            Arc::clone(&bus),
            metrics.clone(),
            None,
        );
        eventd.start().await.unwrap();

        let (to_session, incoming) = mpsc::channel(16);
        let (outgoing, from_session) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let session = AgentSession::new(
            FakeTransport { incoming, outgoing },
            SessionConfig::default(),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bus),
            eventd.handle(),
            metrics,
            cancel.clone(),
        );
        let task = tokio::spawn(session.run());

        Harness {
            to_session,
            from_session,
            store,
            event_store,
            bus,
            eventd,
            session: task,
            cancel,
        }
    }

    fn entity_config() -> Message {
        let entity = Entity {
            metadata: ObjectMeta::namespaced("default", "web01"),
            entity_class: EntityClass::Agent,
            subscriptions: vec!["linux".to_string()],
            last_seen: 0,
        };
        Message::json(transport::TYPE_ENTITY_CONFIG, &entity).unwrap()
    }

    fn agent_event(status: u32) -> Message {
        let event = Event::new(
            Entity {
                metadata: ObjectMeta::namespaced("default", "web01"),
                entity_class: EntityClass::Agent,
                subscriptions: vec!["linux".to_string()],
                last_seen: 0,
            },
            argus_core::check::Check {
                metadata: ObjectMeta::namespaced("default", "http"),
                status,
                ..argus_core::check::Check::default()
            },
            1700000000,
        );
        Message::json(transport::TYPE_EVENT, &event).unwrap()
    }

    #[tokio::test]
    async fn handshake_reconciles_entity() {
        let mut h = harness().await;
        h.to_session.send(entity_config()).await.unwrap();

        // The entity appears in the store with a fresh last_seen.
        for _ in 0..50 {
            if let Some(entity) = h.store.get_entity("default", "web01").await.unwrap() {
                assert!(entity.last_seen > 0);
                h.cancel.cancel();
                h.session.await.unwrap().unwrap();
                h.eventd.stop().await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entity never reconciled");
    }

    #[tokio::test]
    async fn handshake_rejects_other_message_types() {
        let mut h = harness().await;
        h.to_session.send(agent_event(0)).await.unwrap();
        let result = h.session.await.unwrap();
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        h.eventd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn inbound_events_reach_the_event_store() {
        let mut h = harness().await;
        h.to_session.send(entity_config()).await.unwrap();
        h.to_session.send(agent_event(2)).await.unwrap();

        for _ in 0..50 {
            if let Some(event) = h
                .event_store
                .get_event("default", "web01", "http")
                .await
                .unwrap()
            {
                assert_eq!(event.check.status, 2);
                h.cancel.cancel();
                h.session.await.unwrap().unwrap();
                h.eventd.stop().await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event never persisted");
    }

    #[tokio::test]
    async fn malformed_events_are_dropped_not_fatal() {
        let mut h = harness().await;
        h.to_session.send(entity_config()).await.unwrap();
        h.to_session
            .send(Message::new(
                transport::TYPE_EVENT,
                Bytes::from_static(b"not json"),
            ))
            .await
            .unwrap();
        // The session survives and still processes valid traffic.
        h.to_session.send(agent_event(1)).await.unwrap();

        for _ in 0..50 {
            if h.event_store
                .get_event("default", "web01", "http")
                .await
                .unwrap()
                .is_some()
            {
                h.cancel.cancel();
                h.session.await.unwrap().unwrap();
                h.eventd.stop().await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("valid event after malformed one never persisted");
    }

    #[tokio::test]
    async fn check_requests_flow_out_to_the_agent() {
        let mut h = harness().await;
        h.to_session.send(entity_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let topic = h
            .bus
            .subscription_topic(&SubscriptionTopic::new("default", "linux"));
        let request = Arc::new(CheckRequest {
            config: CheckConfig {
                metadata: ObjectMeta::namespaced("default", "mem"),
                interval: 10,
                ..CheckConfig::default()
            },
            issued: 1700000000,
            proxy_entity_name: String::new(),
        });
        assert_eq!(topic.publish(request), 1);

        let msg = tokio::time::timeout(Duration::from_secs(2), h.from_session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.type_, transport::TYPE_CHECK_REQUEST);
        let decoded: CheckRequest = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(decoded.config.metadata.name, "mem");

        h.cancel.cancel();
        h.session.await.unwrap().unwrap();
        h.eventd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn agent_ping_gets_a_pong() {
        let mut h = harness().await;
        h.to_session.send(entity_config()).await.unwrap();
        h.to_session
            .send(Message::new(transport::TYPE_PING, Bytes::new()))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), h.from_session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.type_, transport::TYPE_PONG);

        h.cancel.cancel();
        h.session.await.unwrap().unwrap();
        h.eventd.stop().await.unwrap();
    }

    #[test]
    fn outbound_queue_drops_oldest_on_overflow() {
        let queue = OutboundQueue::new(2);
        for name in ["a", "b", "c"] {
            queue.push(Message::new(name, Bytes::new()));
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().type_, "b");
        assert_eq!(queue.try_pop().unwrap().type_, "c");
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn outbound_queue_pop_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Message::new("x", Bytes::new()));
        let msg = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.type_, "x");
    }
}
