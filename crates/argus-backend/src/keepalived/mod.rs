//! Agent liveness: per-entity keepalive TTL timers.
//!
//! Keepalived subscribes to the event topic. Every passing keepalive
//! event (check name `keepalive`, status 0) resets the entity's deadline
//! to `now + ttl` and refreshes `entity.last_seen` through a worker pool.
//! When a deadline expires, a synthetic keepalive failure is pushed
//! straight into eventd: status 1 on the first expiry, status 2 once a
//! second expiry window passes without a keepalive. A fresh passing
//! keepalive then flows through eventd as the resolution.
//!
//! A TTL of zero disables the timer for that entity. Timers survive
//! backend restarts: on boot the last persisted keepalive event per
//! entity is replayed to re-register its deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::poll_fn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info, warn};

use argus_core::bus::MessageBus;
use argus_core::check::Check;
use argus_core::entity::Entity;
use argus_core::event::{Event, KEEPALIVE_CHECK_NAME};
use argus_core::meta::ObjectMeta;
use argus_core::store::{EntityStore, Store};
use argus_core::EventStore;

use crate::daemon::{Daemon, DaemonError};
use crate::eventd::EventdHandle;
use crate::metrics::BackendMetrics;

/// Per-entity timer state.
struct TimerState {
    key: Key,
    ttl: Duration,
    /// Consecutive expiries without a passing keepalive.
    failures: u32,
}

/// The agent liveness daemon.
pub struct Keepalived {
    workers: usize,
    buffer_size: usize,
    default_ttl: Duration,
    store: Arc<dyn Store>,
    event_store: Arc<dyn EventStore>,
    bus: Arc<MessageBus>,
    eventd: EventdHandle,
    metrics: BackendMetrics,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Keepalived {
    /// Creates the daemon; no tasks run until [`Daemon::start`].
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        workers: usize,
        buffer_size: usize,
        default_ttl: Duration,
        store: Arc<dyn Store>,
        event_store: Arc<dyn EventStore>,
        bus: Arc<MessageBus>,
        eventd: EventdHandle,
        metrics: BackendMetrics,
    ) -> Self {
        Self {
            workers: workers.max(1),
            buffer_size: buffer_size.max(1),
            default_ttl,
            store,
            event_store,
            bus,
            eventd,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Daemon for Keepalived {
    fn name(&self) -> &'static str {
        "keepalived"
    }

    async fn start(&mut self) -> Result<(), DaemonError> {
        // Replay persisted keepalives before accepting live traffic so a
        // restart cannot forget a silent agent.
        let replayed = self
            .event_store
            .list_keepalives()
            .await
            .map_err(|err| DaemonError::StartFailed {
                daemon: "keepalived",
                reason: format!("keepalive replay failed: {err}"),
            })?;

        let (work_tx, work_rx) = mpsc::channel::<Entity>(self.buffer_size);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        for _ in 0..self.workers {
            let store = Arc::clone(&self.store);
            let rx = Arc::clone(&shared_rx);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let entity = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            entity = rx.recv() => entity,
                            () = cancel.cancelled() => None,
                        }
                    };
                    let Some(entity) = entity else { break };
                    if let Err(err) = store.update_entity(&entity).await {
                        warn!(entity = %entity.metadata, error = %err, "last_seen update failed");
                    }
                }
            }));
        }

        let sub = self.bus.subscribe_events();
        let monitor = Monitor {
            default_ttl: self.default_ttl,
            bus: Arc::clone(&self.bus),
            eventd: self.eventd.clone(),
            metrics: self.metrics.clone(),
            work_tx,
        };
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(monitor.run(sub, replayed, cancel)));

        info!(workers = self.workers, "keepalived started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("keepalived stopped");
        Ok(())
    }
}

struct Monitor {
    default_ttl: Duration,
    bus: Arc<MessageBus>,
    eventd: EventdHandle,
    metrics: BackendMetrics,
    work_tx: mpsc::Sender<Entity>,
}

impl Monitor {
    async fn run(
        self,
        mut sub: argus_core::bus::Subscription<Event>,
        replayed: Vec<Event>,
        cancel: CancellationToken,
    ) {
        let mut timers: DelayQueue<(String, String)> = DelayQueue::new();
        let mut states: HashMap<(String, String), TimerState> = HashMap::new();
        let mut entities: HashMap<(String, String), Entity> = HashMap::new();
        let now = chrono::Utc::now().timestamp();

        for event in replayed {
            let Some(ttl) = keepalive_ttl(&event, self.default_ttl) else {
                continue;
            };
            let id = entity_id(&event);
            // The remaining window is whatever the persisted timestamp
            // still covers; an already-expired deadline fires immediately.
            let elapsed = (now - event.timestamp).max(0) as u64;
            let remaining = ttl
                .checked_sub(Duration::from_secs(elapsed))
                .unwrap_or(Duration::ZERO);
            let key = timers.insert(id.clone(), remaining);
            let failures = event.check.status.min(2);
            states.insert(id.clone(), TimerState { key, ttl, failures });
            entities.insert(id, event.entity.clone());
            debug!(entity = %event.entity.metadata, ?remaining, "keepalive timer replayed");
        }

        loop {
            tokio::select! {
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    if event.is_keepalive() {
                        self.observe_keepalive(&event, &mut timers, &mut states, &mut entities).await;
                    }
                }
                id = next_expiry(&mut timers) => {
                    self.expire(&id, &mut timers, &mut states, &entities).await;
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("keepalive monitor exited");
    }

    /// Resets the entity's deadline on a passing keepalive; synthesised
    /// failures (non-zero status) never reset anything.
    async fn observe_keepalive(
        &self,
        event: &Event,
        timers: &mut DelayQueue<(String, String)>,
        states: &mut HashMap<(String, String), TimerState>,
        entities: &mut HashMap<(String, String), Entity>,
    ) {
        if event.check.status != 0 {
            return;
        }
        let id = entity_id(event);
        let Some(ttl) = keepalive_ttl(event, self.default_ttl) else {
            // TTL moved to zero: liveness tracking disabled.
            if let Some(state) = states.remove(&id) {
                timers.remove(&state.key);
                entities.remove(&id);
            }
            return;
        };

        match states.entry(id.clone()) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                state.ttl = ttl;
                state.failures = 0;
                timers.reset(&state.key, ttl);
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let key = timers.insert(id.clone(), ttl);
                vacant.insert(TimerState {
                    key,
                    ttl,
                    failures: 0,
                });
            }
        }

        let mut entity = event.entity.clone();
        entity.last_seen = event.timestamp;
        entities.insert(id, entity.clone());
        if self.work_tx.send(entity).await.is_err() {
            debug!("keepalived worker pool closed");
        }
    }

    /// A deadline passed: synthesise a keepalive failure and re-arm for
    /// the next window.
    async fn expire(
        &self,
        id: &(String, String),
        timers: &mut DelayQueue<(String, String)>,
        states: &mut HashMap<(String, String), TimerState>,
        entities: &HashMap<(String, String), Entity>,
    ) {
        let Some(state) = states.get_mut(id) else {
            return;
        };
        state.failures = state.failures.saturating_add(1);
        let status = if state.failures == 1 { 1 } else { 2 };
        state.key = timers.insert(id.clone(), state.ttl);

        let Some(entity) = entities.get(id) else {
            return;
        };
        self.metrics.keepalive_timeout();
        warn!(entity = %entity.metadata, status, "keepalive TTL expired");
        self.bus.publish_keepalive_timeout(Arc::new(entity.clone()));

        let event = failure_event(entity, state.ttl, status);
        if !self.eventd.submit(event).await {
            warn!("eventd rejected synthetic keepalive failure");
        }
    }
}

/// Resolves to the next expired timer key. Pending while the queue is
/// empty; inserts from other select branches are picked up because the
/// future is recreated on every loop iteration.
async fn next_expiry(timers: &mut DelayQueue<(String, String)>) -> (String, String) {
    poll_fn(|cx| match timers.poll_expired(cx) {
        std::task::Poll::Ready(Some(expired)) => std::task::Poll::Ready(expired.into_inner()),
        std::task::Poll::Ready(None) | std::task::Poll::Pending => std::task::Poll::Pending,
    })
    .await
}

fn entity_id(event: &Event) -> (String, String) {
    (
        event.entity.metadata.namespace.clone(),
        event.entity.metadata.name.clone(),
    )
}

/// The TTL governing an entity's timer, or `None` when tracking is
/// disabled (`ttl == 0`).
fn keepalive_ttl(event: &Event, default_ttl: Duration) -> Option<Duration> {
    match event.check.ttl {
        0 => None,
        ttl if ttl > 0 => Some(Duration::from_secs(ttl as u64)),
        _ => Some(default_ttl),
    }
}

/// Builds the synthetic failure event pushed through eventd.
fn failure_event(entity: &Entity, ttl: Duration, status: u32) -> Event {
    let now = chrono::Utc::now().timestamp();
    let check = Check {
        metadata: ObjectMeta::namespaced(&entity.metadata.namespace, KEEPALIVE_CHECK_NAME),
        status,
        output: format!(
            "no keepalive received from {} within {} seconds",
            entity.metadata.name,
            ttl.as_secs()
        ),
        executed: now,
        issued: now,
        ttl: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        ..Check::default()
    };
    Event::new(entity.clone(), check, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::entity::EntityClass;

    fn keepalive_event(status: u32, ttl: i64, timestamp: i64) -> Event {
        let entity = Entity {
            metadata: ObjectMeta::namespaced("default", "web01"),
            entity_class: EntityClass::Agent,
            subscriptions: vec!["linux".to_string()],
            last_seen: 0,
        };
        let check = Check {
            metadata: ObjectMeta::namespaced("default", KEEPALIVE_CHECK_NAME),
            status,
            ttl,
            ..Check::default()
        };
        Event::new(entity, check, timestamp)
    }

    #[test]
    fn ttl_zero_disables_tracking() {
        let event = keepalive_event(0, 0, 100);
        assert!(keepalive_ttl(&event, Duration::from_secs(120)).is_none());
    }

    #[test]
    fn positive_ttl_wins_over_default() {
        let event = keepalive_event(0, 20, 100);
        assert_eq!(
            keepalive_ttl(&event, Duration::from_secs(120)),
            Some(Duration::from_secs(20))
        );
    }

    #[test]
    fn failure_event_carries_reason_and_status() {
        let entity = keepalive_event(0, 20, 100).entity;
        let event = failure_event(&entity, Duration::from_secs(20), 1);
        assert!(event.is_keepalive());
        assert_eq!(event.check.status, 1);
        assert!(event.check.output.contains("web01"));
        assert!(event.check.output.contains("20 seconds"));
        assert_eq!(event.check.ttl, 20);
    }
}
