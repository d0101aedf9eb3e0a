//! Event ingest: streak accounting, silencing, persistence, publication.
//!
//! Eventd owns a fixed pool of workers, each with its own bounded input
//! queue. Arriving events are partitioned by a hash of their
//! `(namespace, entity, check)` key, so all events for one key land on
//! the same worker and are processed in arrival order; between keys there
//! is no ordering guarantee.
//!
//! Per event the worker loads the previous event for the key, rolls the
//! history ring forward, recomputes the occurrence streak, applies
//! silencing, persists, and publishes on the event topic. Transient store
//! failures are retried with exponential backoff; permanent failures drop
//! the event with a counter increment and never stall the pool.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_core::bus::MessageBus;
use argus_core::check::{HistoryPoint, HISTORY_BOUND};
use argus_core::event::Event;
use argus_core::silenced::Silenced;
use argus_core::store::{SelectionPredicate, SilencedStore, Store};
use argus_core::EventStore;

use crate::daemon::{Daemon, DaemonError};
use crate::eventlog::EventLogWriter;
use crate::metrics::BackendMetrics;

/// Store write attempts before an event is dropped.
const STORE_ATTEMPTS: u32 = 3;

/// Base delay of the write retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Page size used when scanning silencing entries.
const SILENCED_PAGE_SIZE: u64 = 250;

/// Submission handle held by agent sessions and keepalived.
///
/// Routes each event to the worker owning its key so per-key arrival
/// order is preserved end to end.
#[derive(Clone)]
pub struct EventdHandle {
    workers: Arc<Vec<mpsc::Sender<Event>>>,
}

impl EventdHandle {
    /// Queues an event for ingest, waiting for buffer space.
    ///
    /// Returns `false` if eventd has shut down.
    pub async fn submit(&self, event: Event) -> bool {
        let key = event.key();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)] // modulo worker count
        let index = (hasher.finish() % self.workers.len() as u64) as usize;
        self.workers[index].send(event).await.is_ok()
    }
}

/// Everything one worker needs, shared by the pool.
struct WorkerContext {
    store: Arc<dyn Store>,
    event_store: Arc<dyn EventStore>,
    bus: Arc<MessageBus>,
    metrics: BackendMetrics,
    event_log: Option<EventLogWriter>,
}

/// The event ingest daemon.
pub struct Eventd {
    workers: usize,
    buffer_size: usize,
    ctx: Arc<WorkerContext>,
    handle: EventdHandle,
    receivers: Vec<mpsc::Receiver<Event>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Eventd {
    /// Creates an eventd pool. The input channels exist immediately (so
    /// other daemons can be built against [`Eventd::handle`]) but no
    /// worker runs until [`Daemon::start`].
    #[must_use]
    pub fn new(
        workers: usize,
        buffer_size: usize,
        store: Arc<dyn Store>,
        event_store: Arc<dyn EventStore>,
        bus: Arc<MessageBus>,
        metrics: BackendMetrics,
        event_log: Option<EventLogWriter>,
    ) -> Self {
        let workers = workers.max(1);
        let buffer_size = buffer_size.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(buffer_size);
            senders.push(tx);
            receivers.push(rx);
        }
        Self {
            workers,
            buffer_size,
            ctx: Arc::new(WorkerContext {
                store,
                event_store,
                bus,
                metrics,
                event_log,
            }),
            handle: EventdHandle {
                workers: Arc::new(senders),
            },
            receivers,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// The submission handle.
    #[must_use]
    pub fn handle(&self) -> EventdHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Daemon for Eventd {
    fn name(&self) -> &'static str {
        "eventd"
    }

    async fn start(&mut self) -> Result<(), DaemonError> {
        for (index, rx) in self.receivers.drain(..).enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(worker_loop(index, rx, ctx, cancel)));
        }
        info!(workers = self.workers, buffer = self.buffer_size, "eventd started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("eventd stopped");
        Ok(())
    }
}

async fn worker_loop(
    index: usize,
    mut rx: mpsc::Receiver<Event>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            () = cancel.cancelled() => {
                // Refuse new submissions, then drain what is buffered.
                rx.close();
                match rx.recv().await {
                    Some(event) => event,
                    None => break,
                }
            }
        };
        ingest(&ctx, event).await;
    }
    debug!(worker = index, "eventd worker exited");
}

/// Runs the full ingest sequence for one event.
async fn ingest(ctx: &WorkerContext, mut event: Event) {
    let started = std::time::Instant::now();
    if let Err(reason) = event.validate() {
        debug!(reason = %reason, "dropping invalid event");
        ctx.metrics.event_error("validation");
        return;
    }

    let (namespace, entity, check) = event.key();
    let previous = match ctx
        .event_store
        .get_event(&namespace, &entity, &check)
        .await
    {
        Ok(previous) => previous,
        Err(err) => {
            warn!(%namespace, %entity, %check, error = %err, "previous event read failed");
            ctx.metrics.event_error("store");
            return;
        }
    };

    apply_streak(&mut event, previous.as_ref());

    if let Err(err) = apply_silencing(ctx.store.as_ref(), &mut event).await {
        // Silencing is advisory; failure to evaluate never drops the event.
        warn!(%namespace, %entity, %check, error = %err, "silencing evaluation failed");
    }

    if !persist_with_retry(ctx.event_store.as_ref(), &event).await {
        ctx.metrics.event_error("store");
        return;
    }

    let event = Arc::new(event);
    ctx.bus.publish_event(Arc::clone(&event));
    if let Some(log) = &ctx.event_log {
        log.log(Arc::clone(&event)).await;
    }
    ctx.metrics
        .event_processed(event.check.status, started.elapsed().as_secs_f64());
}

/// Rolls history, occurrences, and the watermark forward from the
/// previous event for the same key.
///
/// The history ring holds prior statuses only: the previous event's
/// status is appended, the current one is not. A fresh key starts with an
/// empty ring and an occurrence count of one.
pub fn apply_streak(event: &mut Event, previous: Option<&Event>) {
    match previous {
        Some(prev) => {
            let mut history = prev.check.history.clone();
            history.push(HistoryPoint {
                status: prev.check.status,
                executed: prev.timestamp,
            });
            if history.len() > HISTORY_BOUND {
                let excess = history.len() - HISTORY_BOUND;
                history.drain(..excess);
            }
            event.check.history = history;

            if event.check.status == prev.check.status {
                event.check.occurrences = prev.check.occurrences + 1;
                event.check.occurrences_watermark = prev
                    .check
                    .occurrences_watermark
                    .max(event.check.occurrences);
            } else {
                event.check.occurrences = 1;
                event.check.occurrences_watermark = 1;
            }
        }
        None => {
            event.check.history = Vec::new();
            event.check.occurrences = 1;
            event.check.occurrences_watermark = 1;
        }
    }
}

/// Matches silencing entries against the event, honouring begin times and
/// deleting expire-on-resolve entries once the event resolves.
async fn apply_silencing(store: &dyn Store, event: &mut Event) -> Result<(), argus_core::StoreError> {
    let namespace = event.entity.metadata.namespace.clone();
    let now = chrono::Utc::now().timestamp();

    let mut matched: Vec<Silenced> = Vec::new();
    let mut pred = SelectionPredicate::with_limit(SILENCED_PAGE_SIZE);
    loop {
        let page = store.list_silenced(&namespace, &mut pred).await?;
        let short = (page.len() as u64) < SILENCED_PAGE_SIZE;
        matched.extend(page.into_iter().filter(|entry| entry.matches(event, now)));
        if pred.continue_token.is_empty() || short {
            break;
        }
    }

    let mut silenced = Vec::new();
    for entry in matched {
        if event.check.status == 0 && entry.expire_on_resolve {
            debug!(entry = %entry.metadata, "expiring silencing entry on resolve");
            store.delete_silenced(&namespace, &entry.metadata.name).await?;
            continue;
        }
        silenced.push(entry.metadata.name.clone());
    }
    silenced.sort();
    silenced.dedup();
    event.silenced = silenced;
    Ok(())
}

/// Persists the event, retrying transient failures with exponential
/// backoff. Returns `false` once the event is dropped.
async fn persist_with_retry(event_store: &dyn EventStore, event: &Event) -> bool {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=STORE_ATTEMPTS {
        match event_store.update_event(event).await {
            Ok(()) => return true,
            Err(err) if err.is_transient() && attempt < STORE_ATTEMPTS => {
                debug!(attempt, error = %err, "transient event write failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                warn!(key = ?event.key(), error = %err, "dropping event after failed writes");
                return false;
            }
        }
    }
    false
}
