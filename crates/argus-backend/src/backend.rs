//! Backend assembly: stores, bus, metrics, and daemon lifecycle.
//!
//! The backend wires every subsystem from one [`BackendConfig`] and runs
//! them under a single cancellation root. Startup order is ingest-first
//! (eventd, keepalived, pipelined, schedulerd, agentd) so no daemon ever
//! observes a missing downstream; shutdown walks the same order in
//! reverse and drains within the grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use argus_core::bus::MessageBus;
use argus_core::queue::Queue;
use argus_core::store::Store;
use argus_core::EventStore;

use crate::agentd::{Agentd, SessionConfig};
use crate::config::BackendConfig;
use crate::daemon::{Daemon, DaemonError};
use crate::eventd::{Eventd, EventdHandle};
use crate::eventlog::EventLog;
use crate::graphql::Loaders;
use crate::keepalived::Keepalived;
use crate::metrics::{new_shared_registry, MetricsError, SharedMetrics};
use crate::pipelined::Pipelined;
use crate::schedulerd::{single_member, Schedulerd};
use crate::store::{MemoryEventStore, MemoryQueue, MemoryStore};

/// Grace period for daemon shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Backend construction and runtime failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A daemon failed to start or stop.
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    /// Metrics registration failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// The event log file could not be opened.
    #[error("event log setup failed: {0}")]
    EventLog(std::io::Error),
}

/// The assembled backend.
pub struct Backend {
    member_id: String,
    cancel: CancellationToken,
    store: Arc<dyn Store>,
    event_store: Arc<dyn EventStore>,
    queue: Arc<dyn Queue>,
    bus: Arc<MessageBus>,
    eventd_handle: EventdHandle,
    /// Keeps the scheduler membership channel alive; clustered builds
    /// replace this with the member watch.
    _members_tx: tokio::sync::watch::Sender<Vec<String>>,
    daemons: Vec<Box<dyn Daemon>>,
    agentd: Agentd,
    metrics_registry: SharedMetrics,
    metrics_addr: Option<SocketAddr>,
    metrics_task: Option<tokio::task::JoinHandle<()>>,
    event_log: Option<EventLog>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("member_id", &self.member_id)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Builds the backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] for unusable configuration and
    /// setup errors for the metrics registry or event log.
    pub async fn new(config: BackendConfig) -> Result<Self, BackendError> {
        config.validate().map_err(BackendError::Config)?;

        let member_id = format!("backend-{}", Uuid::new_v4());
        let cancel = CancellationToken::new();

        // The shipped configuration store is the in-memory one; the
        // contract keeps etcd pluggable without core changes.
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let event_store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());

        let bus_buffer = config
            .eventd_buffer_size
            .max(config.keepalived_buffer_size)
            .max(config.pipelined_buffer_size);
        let bus = Arc::new(MessageBus::new(bus_buffer));

        let metrics_registry = new_shared_registry()?;
        let metrics = metrics_registry.backend_metrics();

        let event_log = if config.event_log_file.is_empty() {
            None
        } else {
            Some(
                EventLog::open(
                    &config.event_log_file,
                    config.event_log_buffer_size,
                    config.event_log_buffer_wait,
                )
                .await
                .map_err(BackendError::EventLog)?,
            )
        };

        let eventd = Eventd::new(
            config.eventd_workers,
            config.eventd_buffer_size,
            Arc::clone(&store),
            Arc::clone(&event_store),
            Arc::clone(&bus),
            metrics.clone(),
            event_log.as_ref().map(EventLog::writer),
        );
        let eventd_handle = eventd.handle();

        let keepalived = Keepalived::new(
            config.keepalived_workers,
            config.keepalived_buffer_size,
            config.keepalive_ttl,
            Arc::clone(&store),
            Arc::clone(&event_store),
            Arc::clone(&bus),
            eventd_handle.clone(),
            metrics.clone(),
        );

        let backend_host = config.agent_host.clone();
        let pipelined = Pipelined::new(
            config.pipelined_workers,
            config.pipelined_buffer_size,
            Arc::clone(&store),
            Arc::clone(&bus),
            metrics.clone(),
            backend_host,
        );

        let (members_tx, members_rx) = single_member(&member_id);
        let schedulerd = Schedulerd::new(
            member_id.clone(),
            members_rx,
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&bus),
            metrics.clone(),
        );

        let agentd = Agentd::new(
            format!("{}:{}", config.agent_host, config.agent_port),
            SessionConfig {
                write_timeout: config.agent_write_timeout,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
                ..SessionConfig::default()
            },
            Arc::clone(&store),
            Arc::clone(&bus),
            eventd_handle.clone(),
            metrics,
        );

        let metrics_addr = if config.no_metrics {
            None
        } else {
            Some(([127, 0, 0, 1], config.metrics_port).into())
        };

        Ok(Self {
            member_id,
            cancel,
            store,
            event_store,
            queue,
            bus,
            eventd_handle,
            _members_tx: members_tx,
            daemons: vec![
                Box::new(eventd),
                Box::new(keepalived),
                Box::new(pipelined),
                Box::new(schedulerd),
            ],
            agentd,
            metrics_registry,
            metrics_addr,
            metrics_task: None,
            event_log,
        })
    }

    /// The cancellation root; cancel it to begin shutdown.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// This backend's member id in the scheduler ring.
    #[must_use]
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// The configuration store handle.
    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// The event store handle.
    #[must_use]
    pub fn event_store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.event_store)
    }

    /// The ad-hoc request queue handle.
    #[must_use]
    pub fn queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue)
    }

    /// The in-process bus handle.
    #[must_use]
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// The eventd submission handle (API surfaces ingest through this).
    #[must_use]
    pub fn eventd(&self) -> EventdHandle {
        self.eventd_handle.clone()
    }

    /// Builds a fresh per-request loader set for graph resolution.
    #[must_use]
    pub fn loaders(&self) -> Loaders {
        Loaders::new(Arc::clone(&self.store), Arc::clone(&self.event_store))
    }

    /// The bound agent listener address, once started. Port 0 in the
    /// configuration makes this the way to discover the real port.
    #[must_use]
    pub fn agent_addr(&self) -> Option<SocketAddr> {
        self.agentd.local_addr()
    }

    /// Starts every daemon (ingest-first) and the metrics server.
    ///
    /// # Errors
    ///
    /// Returns the first startup failure.
    pub async fn start(&mut self) -> Result<(), BackendError> {
        for daemon in &mut self.daemons {
            daemon.start().await?;
        }
        self.agentd.start().await?;

        self.metrics_task = self.metrics_addr.map(|addr| {
            let registry = Arc::clone(&self.metrics_registry);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = run_metrics_server(registry, addr, cancel).await {
                    error!(error = %err, "metrics server error");
                }
            })
        });
        info!(member = %self.member_id, "backend running");
        Ok(())
    }

    /// Stops every daemon in reverse order and drains the event log.
    /// Shutdown failures are logged, never returned.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.cancel.cancel();
        stop_with_grace(&mut self.agentd).await;
        for daemon in self.daemons.iter_mut().rev() {
            stop_with_grace(daemon.as_mut()).await;
        }
        if let Some(task) = self.metrics_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(event_log) = self.event_log.take() {
            event_log.shutdown().await;
        }
        info!("backend shutdown complete");
    }

    /// Starts, runs until the cancellation root fires, then shuts down.
    ///
    /// # Errors
    ///
    /// Returns the first startup failure; shutdown failures are logged.
    pub async fn run(mut self) -> Result<(), BackendError> {
        self.start().await?;
        self.cancel.cancelled().await;
        self.shutdown().await;
        Ok(())
    }
}

async fn stop_with_grace(daemon: &mut dyn Daemon) {
    match tokio::time::timeout(SHUTDOWN_GRACE, daemon.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(daemon = daemon.name(), error = %err, "daemon stop failed"),
        Err(_) => warn!(daemon = daemon.name(), "daemon did not stop within grace period"),
    }
}

/// Serves the Prometheus registry at `/metrics` on localhost.
async fn run_metrics_server(
    registry: SharedMetrics,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let handler = {
        let registry = Arc::clone(&registry);
        move || {
            let registry = Arc::clone(&registry);
            async move {
                match registry.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(err) => {
                        error!(error = %err, "failed to encode metrics");
                        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
                    }
                }
            }
        }
    };

    let app = Router::new().route("/metrics", get(handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStoreKind;

    fn quiet_config() -> BackendConfig {
        BackendConfig {
            agent_host: "127.0.0.1".to_string(),
            agent_port: 0,
            no_metrics: true,
            dev_mode: true,
            eventd_workers: 2,
            keepalived_workers: 2,
            pipelined_workers: 2,
            ..BackendConfig::default()
        }
    }

    #[tokio::test]
    async fn backend_starts_and_shuts_down() {
        let backend = Backend::new(quiet_config()).await.unwrap();
        let cancel = backend.cancellation();
        let run = tokio::spawn(backend.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(15), run)
            .await
            .expect("shutdown within grace")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_config_fails_construction() {
        let config = BackendConfig {
            config_store: ConfigStoreKind::Postgres,
            ..quiet_config()
        };
        let err = Backend::new(config).await.unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
