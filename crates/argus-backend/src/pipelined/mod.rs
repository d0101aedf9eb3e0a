//! The event pipeline: filter, mutate, and handle every ingested event.
//!
//! Pipelined subscribes to the event topic with a fixed worker pool. Per
//! event it resolves the check's handlers, expanding `set` handlers
//! transitively (cycles are logged and broken; each unique handler runs
//! at most once), then runs each leaf handler concurrently:
//!
//! 1. silenced events are skipped unless the handler opts in,
//! 2. the handler's filter list gates dispatch (`deny` filters
//!    short-circuit, every `allow` filter must pass),
//! 3. the mutator builds the payload (failure drops the event for that
//!    handler only),
//! 4. dispatch runs with per-handler timeouts, fire-and-forget.

pub mod exec;
pub mod filter;
pub mod mutator;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_core::bus::MessageBus;
use argus_core::event::Event;
use argus_core::filter::{builtin, FilterAction};
use argus_core::handler::{Handler, HandlerType};
use argus_core::store::{EventFilterStore, HandlerStore, Store};

use crate::daemon::{Daemon, DaemonError};
use crate::metrics::BackendMetrics;

use filter::Expression;

/// Wall-clock budget for evaluating one handler's filter list.
const FILTER_DEADLINE: Duration = Duration::from_secs(1);

/// Timeout for handlers that do not configure one.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// The per-event handler fan-out daemon.
pub struct Pipelined {
    workers: usize,
    buffer_size: usize,
    bus: Arc<MessageBus>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Shared state for event processing.
pub struct PipelineContext {
    store: Arc<dyn Store>,
    metrics: BackendMetrics,
    backend_host: String,
}

impl PipelineContext {
    /// Creates a processing context.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, metrics: BackendMetrics, backend_host: String) -> Self {
        Self {
            store,
            metrics,
            backend_host,
        }
    }
}

impl Pipelined {
    /// Creates the daemon; no tasks run until [`Daemon::start`].
    #[must_use]
    pub fn new(
        workers: usize,
        buffer_size: usize,
        store: Arc<dyn Store>,
        bus: Arc<MessageBus>,
        metrics: BackendMetrics,
        backend_host: String,
    ) -> Self {
        Self {
            workers: workers.max(1),
            buffer_size: buffer_size.max(1),
            bus,
            ctx: Arc::new(PipelineContext::new(store, metrics, backend_host)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Daemon for Pipelined {
    fn name(&self) -> &'static str {
        "pipelined"
    }

    async fn start(&mut self) -> Result<(), DaemonError> {
        let (tx, rx) = mpsc::channel::<Arc<Event>>(self.buffer_size);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..self.workers {
            let ctx = Arc::clone(&self.ctx);
            let rx = Arc::clone(&shared_rx);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            event = rx.recv() => event,
                            () = cancel.cancelled() => None,
                        }
                    };
                    let Some(event) = event else { break };
                    process_event(&ctx, event).await;
                }
            }));
        }

        let mut sub = self.bus.subscribe_events();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        }));

        info!(workers = self.workers, buffer = self.buffer_size, "pipelined started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("pipelined stopped");
        Ok(())
    }
}

/// Decision for one handler after filter evaluation.
#[derive(Debug, PartialEq, Eq)]
enum FilterDecision {
    /// Dispatch proceeds.
    Allow,
    /// The named filter stopped the event.
    Drop(String),
}

/// Processes one event end to end: expansion, filtering, mutation,
/// dispatch. Handler executions are spawned fire-and-forget.
pub async fn process_event(ctx: &Arc<PipelineContext>, event: Arc<Event>) {
    let handlers = expand_handlers(
        ctx.store.as_ref(),
        &event.entity.metadata.namespace,
        &event.check.handlers,
    )
    .await;
    if handlers.is_empty() {
        debug!(key = ?event.key(), "no handlers resolved for event");
        return;
    }

    for handler in handlers {
        let ctx = Arc::clone(ctx);
        let event = Arc::clone(&event);
        tokio::spawn(async move {
            run_handler(&ctx, &handler, &event).await;
        });
    }
}

/// Runs one leaf handler for one event.
async fn run_handler(ctx: &PipelineContext, handler: &Handler, event: &Arc<Event>) {
    let type_label = handler_type_label(handler.type_);

    if event.is_silenced() && !handler.handle_silenced {
        debug!(handler = %handler.metadata, "skipping silenced event");
        ctx.metrics.handler_executed(type_label, "filtered");
        return;
    }

    match evaluate_filters(ctx, handler, event).await {
        FilterDecision::Allow => {}
        FilterDecision::Drop(filter) => {
            debug!(handler = %handler.metadata, filter = %filter, "event filtered");
            ctx.metrics.handler_executed(type_label, "filtered");
            return;
        }
    }

    let payload = match mutator::mutate(
        event,
        &handler.mutator,
        ctx.store.as_ref(),
        &ctx.backend_host,
    )
    .await
    {
        Ok(payload) => payload,
        Err(err) => {
            // Mutation failure drops the event for this handler only.
            warn!(handler = %handler.metadata, error = %err, "mutator failed");
            ctx.metrics.handler_executed(type_label, "error");
            return;
        }
    };

    let timeout = if handler.timeout == 0 {
        DEFAULT_HANDLER_TIMEOUT
    } else {
        Duration::from_secs(u64::from(handler.timeout))
    };

    let result = match (&handler.type_, &handler.socket) {
        (HandlerType::Pipe, _) => {
            exec::dispatch_pipe(&handler.command, &ctx.backend_host, &payload, timeout).await
        }
        (HandlerType::Tcp, Some(socket)) => exec::dispatch_tcp(socket, &payload, timeout).await,
        (HandlerType::Udp, Some(socket)) => exec::dispatch_udp(socket, &payload).await,
        (HandlerType::Tcp | HandlerType::Udp, None) => {
            warn!(handler = %handler.metadata, "socket handler without a socket");
            ctx.metrics.handler_executed(type_label, "error");
            return;
        }
        (HandlerType::Set, _) => {
            // Sets are flattened during expansion and never dispatched.
            return;
        }
    };

    match result {
        Ok(()) => ctx.metrics.handler_executed(type_label, "ok"),
        Err(exec::ExecError::Timeout(_)) => {
            warn!(handler = %handler.metadata, "handler timed out");
            ctx.metrics.handler_executed(type_label, "timeout");
        }
        Err(err) => {
            // Per-handler, non-fatal: other handlers proceed.
            warn!(handler = %handler.metadata, error = %err, "handler failed");
            ctx.metrics.handler_executed(type_label, "error");
        }
    }
}

const fn handler_type_label(t: HandlerType) -> &'static str {
    match t {
        HandlerType::Pipe => "pipe",
        HandlerType::Tcp => "tcp",
        HandlerType::Udp => "udp",
        HandlerType::Set => "set",
    }
}

/// Expands handler names into unique leaf handlers, flattening `set`
/// handlers depth-first. A handler already on the expansion path is a
/// cycle: it is logged and skipped, so each unique handler appears at
/// most once.
pub async fn expand_handlers(
    store: &dyn Store,
    namespace: &str,
    names: &[String],
) -> Vec<Handler> {
    let mut seen = HashSet::new();
    let mut path = Vec::new();
    let mut leaves = Vec::new();
    for name in names {
        expand_into(store, namespace, name, &mut seen, &mut path, &mut leaves).await;
    }
    leaves
}

fn expand_into<'a>(
    store: &'a dyn Store,
    namespace: &'a str,
    name: &'a str,
    seen: &'a mut HashSet<String>,
    path: &'a mut Vec<String>,
    leaves: &'a mut Vec<Handler>,
) -> BoxFuture<'a, ()> {
    async move {
        if path.iter().any(|p| p == name) {
            warn!(handler = name, "handler set cycle detected, breaking");
            return;
        }
        if !seen.insert(name.to_string()) {
            return;
        }
        let handler = match store.get_handler(namespace, name).await {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                debug!(handler = name, namespace, "handler not found");
                return;
            }
            Err(err) => {
                warn!(handler = name, error = %err, "handler lookup failed");
                return;
            }
        };
        if handler.type_ == HandlerType::Set {
            path.push(name.to_string());
            let members = handler.handlers.clone();
            for member in &members {
                expand_into(store, namespace, member, seen, path, leaves).await;
            }
            path.pop();
        } else {
            leaves.push(handler);
        }
    }
    .boxed()
}

/// Evaluates the handler's filter list against the event.
async fn evaluate_filters(
    ctx: &PipelineContext,
    handler: &Handler,
    event: &Arc<Event>,
) -> FilterDecision {
    if handler.filters.is_empty() {
        return FilterDecision::Allow;
    }
    let deadline = Instant::now() + FILTER_DEADLINE;
    let doc = match serde_json::to_value(&**event) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(error = %err, "event not serializable for filtering");
            return FilterDecision::Drop("serialization".to_string());
        }
    };

    for name in &handler.filters {
        let allowed = match name.as_str() {
            builtin::IS_INCIDENT => event.is_incident() || event.is_resolution(),
            builtin::HAS_METRICS => event.has_metrics(),
            builtin::NOT_SILENCED => !event.is_silenced(),
            stored => match stored_filter_allows(ctx, stored, event, &doc, deadline).await {
                Some(allowed) => allowed,
                // Unresolvable filters fail closed.
                None => false,
            },
        };
        if !allowed {
            return FilterDecision::Drop(name.clone());
        }
    }
    FilterDecision::Allow
}

/// Evaluates one stored filter; `None` when it cannot be resolved.
async fn stored_filter_allows(
    ctx: &PipelineContext,
    name: &str,
    event: &Arc<Event>,
    doc: &serde_json::Value,
    deadline: Instant,
) -> Option<bool> {
    let namespace = &event.entity.metadata.namespace;
    let stored = match ctx.store.get_event_filter(namespace, name).await {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            debug!(filter = name, namespace = %namespace, "filter not found");
            return None;
        }
        Err(err) => {
            warn!(filter = name, error = %err, "filter lookup failed");
            return None;
        }
    };

    let mut matched = true;
    for source in &stored.expressions {
        let expr = match Expression::parse(source) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(filter = name, error = %err, "unparseable filter expression");
                matched = false;
                break;
            }
        };
        match expr.evaluate(doc, deadline) {
            Ok(true) => {}
            Ok(false) => {
                matched = false;
                break;
            }
            Err(err) => {
                debug!(filter = name, error = %err, "filter expression error");
                matched = false;
                break;
            }
        }
    }

    Some(match stored.action {
        FilterAction::Allow => matched,
        FilterAction::Deny => !matched,
    })
}
