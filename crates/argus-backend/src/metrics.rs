//! Prometheus metrics for backend health observability.
//!
//! One [`BackendMetrics`] handle is shared by every subsystem; the
//! registry is exported in Prometheus text format by the metrics HTTP
//! server in [`crate::backend`].
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `argus_sessions_active` | Gauge | `namespace` |
//! | `argus_eventd_events_total` | Counter | `status` |
//! | `argus_eventd_errors_total` | Counter | `kind` |
//! | `argus_eventd_latency_seconds` | Histogram | - |
//! | `argus_keepalived_timeouts_total` | Counter | - |
//! | `argus_pipelined_executions_total` | Counter | `handler_type`, `status` |
//! | `argus_schedulerd_ticks_total` | Counter | `schedule` |
//! | `argus_bus_dropped_total` | Counter | `topic_kind` |

use std::sync::Arc;

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for eventd ingest latency (seconds).
pub const EVENTD_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Errors during metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric failed to register (e.g. duplicate name).
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// The registry could not be encoded.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Backend health metrics.
///
/// All metrics use interior mutability; the struct is `Clone`, `Send`,
/// and `Sync` and is handed to each subsystem at construction.
#[derive(Clone)]
pub struct BackendMetrics {
    sessions_active: GaugeVec,
    eventd_events_total: CounterVec,
    eventd_errors_total: CounterVec,
    eventd_latency: Histogram,
    keepalived_timeouts_total: Counter,
    pipelined_executions_total: CounterVec,
    schedulerd_ticks_total: CounterVec,
    bus_dropped_total: CounterVec,
}

impl BackendMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any family fails to register.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let sessions_active = GaugeVec::new(
            Opts::new("argus_sessions_active", "Active agent sessions"),
            &["namespace"],
        )?;
        registry.register(Box::new(sessions_active.clone()))?;

        let eventd_events_total = CounterVec::new(
            Opts::new("argus_eventd_events_total", "Events ingested by status"),
            &["status"],
        )?;
        registry.register(Box::new(eventd_events_total.clone()))?;

        let eventd_errors_total = CounterVec::new(
            Opts::new("argus_eventd_errors_total", "Events dropped by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(eventd_errors_total.clone()))?;

        let eventd_latency = Histogram::with_opts(
            HistogramOpts::new("argus_eventd_latency_seconds", "Event ingest latency")
                .buckets(EVENTD_LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(eventd_latency.clone()))?;

        let keepalived_timeouts_total = Counter::with_opts(Opts::new(
            "argus_keepalived_timeouts_total",
            "Keepalive TTL expiries",
        ))?;
        registry.register(Box::new(keepalived_timeouts_total.clone()))?;

        let pipelined_executions_total = CounterVec::new(
            Opts::new(
                "argus_pipelined_executions_total",
                "Handler executions by type and outcome",
            ),
            &["handler_type", "status"],
        )?;
        registry.register(Box::new(pipelined_executions_total.clone()))?;

        let schedulerd_ticks_total = CounterVec::new(
            Opts::new(
                "argus_schedulerd_ticks_total",
                "Scheduler ticks by schedule kind",
            ),
            &["schedule"],
        )?;
        registry.register(Box::new(schedulerd_ticks_total.clone()))?;

        let bus_dropped_total = CounterVec::new(
            Opts::new(
                "argus_bus_dropped_total",
                "Bus messages dropped on full subscriber queues",
            ),
            &["topic_kind"],
        )?;
        registry.register(Box::new(bus_dropped_total.clone()))?;

        Ok(Self {
            sessions_active,
            eventd_events_total,
            eventd_errors_total,
            eventd_latency,
            keepalived_timeouts_total,
            pipelined_executions_total,
            schedulerd_ticks_total,
            bus_dropped_total,
        })
    }

    /// A session entered `Running`.
    pub fn session_started(&self, namespace: &str) {
        self.sessions_active.with_label_values(&[namespace]).inc();
    }

    /// A session reached `Closed`.
    pub fn session_closed(&self, namespace: &str) {
        self.sessions_active.with_label_values(&[namespace]).dec();
    }

    /// An event was persisted and published.
    pub fn event_processed(&self, status: u32, latency_seconds: f64) {
        self.eventd_events_total
            .with_label_values(&[&status.to_string()])
            .inc();
        self.eventd_latency.observe(latency_seconds);
    }

    /// An event was dropped (`validation`, `store`, ...).
    pub fn event_error(&self, kind: &str) {
        self.eventd_errors_total.with_label_values(&[kind]).inc();
    }

    /// A keepalive TTL expired.
    pub fn keepalive_timeout(&self) {
        self.keepalived_timeouts_total.inc();
    }

    /// A handler execution finished (`status`: `ok`, `error`, `timeout`,
    /// `filtered`).
    pub fn handler_executed(&self, handler_type: &str, status: &str) {
        self.pipelined_executions_total
            .with_label_values(&[handler_type, status])
            .inc();
    }

    /// A scheduler fired (`schedule`: `interval`, `cron`, `adhoc`).
    pub fn scheduler_tick(&self, schedule: &str) {
        self.schedulerd_ticks_total
            .with_label_values(&[schedule])
            .inc();
    }

    /// Bus messages were dropped on a full subscriber queue.
    pub fn bus_dropped(&self, topic_kind: &str, count: u64) {
        #[allow(clippy::cast_precision_loss)] // drop counts are far below 2^52
        self.bus_dropped_total
            .with_label_values(&[topic_kind])
            .inc_by(count as f64);
    }
}

/// Registry plus the backend metrics handle.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: BackendMetrics,
}

/// Shared handle passed across subsystems.
pub type SharedMetrics = Arc<MetricsRegistry>;

impl MetricsRegistry {
    /// Creates a registry with all backend metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let metrics = BackendMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// The backend metrics handle.
    #[must_use]
    pub fn backend_metrics(&self) -> BackendMetrics {
        self.metrics.clone()
    }

    /// Encodes all families in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Creates the shared metrics registry.
///
/// # Errors
///
/// Returns an error if any metric fails to register.
pub fn new_shared_registry() -> MetricsResult<SharedMetrics> {
    Ok(Arc::new(MetricsRegistry::new()?))
}
