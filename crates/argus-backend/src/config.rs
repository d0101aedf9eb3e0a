//! Backend configuration.
//!
//! Flags, a YAML/JSON config file, and `ARGUS_BACKEND_*` environment
//! variables all funnel into [`BackendConfig`]; components receive the
//! struct (or a slice of it) at construction time and never consult
//! process-wide state.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which configuration store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStoreKind {
    /// In-process store, no external dependencies (dev mode).
    #[default]
    Memory,
    /// etcd-backed store (recognised; adapter not shipped in this build).
    Etcd,
    /// Postgres-backed store (not supported yet).
    Postgres,
}

/// Top-level backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Agent listener host.
    #[serde(default = "default_agent_host")]
    pub agent_host: String,

    /// Agent listener port.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Timeout for writes to agent sessions.
    #[serde(default = "default_agent_write_timeout")]
    #[serde(with = "humantime_serde")]
    pub agent_write_timeout: Duration,

    /// Workers spawned for processing incoming events.
    #[serde(default = "default_workers")]
    pub eventd_workers: usize,

    /// Incoming events that can be buffered.
    #[serde(default = "default_buffer_size")]
    pub eventd_buffer_size: usize,

    /// Workers spawned for processing incoming keepalives.
    #[serde(default = "default_workers")]
    pub keepalived_workers: usize,

    /// Incoming keepalives that can be buffered.
    #[serde(default = "default_buffer_size")]
    pub keepalived_buffer_size: usize,

    /// Workers spawned for handling events through the pipeline.
    #[serde(default = "default_workers")]
    pub pipelined_workers: usize,

    /// Events awaiting handling that can be buffered.
    #[serde(default = "default_buffer_size")]
    pub pipelined_buffer_size: usize,

    /// Event log file path; empty disables event logging.
    #[serde(default)]
    pub event_log_file: String,

    /// Event log ring buffer size.
    ///
    /// A serialized event takes a minimum of around 1300 bytes, so a full
    /// buffer at the default size can require about 130MB of memory.
    #[serde(default = "default_event_log_buffer_size")]
    pub event_log_buffer_size: usize,

    /// How long a producer waits on a full event log buffer before
    /// dropping the event. Too low discards events under load; too high
    /// backpressures ingest and the agent sessions feeding it.
    #[serde(default = "default_event_log_buffer_wait")]
    #[serde(with = "humantime_serde")]
    pub event_log_buffer_wait: Duration,

    /// Default keepalive TTL when an agent does not set one.
    #[serde(default = "default_keepalive_ttl")]
    #[serde(with = "humantime_serde")]
    pub keepalive_ttl: Duration,

    /// Prometheus metrics HTTP port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Disable the metrics HTTP endpoint.
    #[serde(default)]
    pub no_metrics: bool,

    /// Configuration store selection.
    #[serde(default)]
    pub config_store: ConfigStoreKind,

    /// Single-node developer mode: in-memory stores, no external
    /// dependencies.
    #[serde(default)]
    pub dev_mode: bool,

    /// Labels applied to entities created by this backend.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations applied to entities created by this backend.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_agent_host() -> String {
    "[::]".to_string()
}

const fn default_agent_port() -> u16 {
    8081
}

const fn default_agent_write_timeout() -> Duration {
    Duration::from_secs(15)
}

const fn default_workers() -> usize {
    100
}

const fn default_buffer_size() -> usize {
    1000
}

const fn default_event_log_buffer_size() -> usize {
    100_000
}

const fn default_event_log_buffer_wait() -> Duration {
    Duration::from_millis(10)
}

const fn default_keepalive_ttl() -> Duration {
    Duration::from_secs(120)
}

const fn default_metrics_port() -> u16 {
    9100
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            agent_host: default_agent_host(),
            agent_port: default_agent_port(),
            agent_write_timeout: default_agent_write_timeout(),
            eventd_workers: default_workers(),
            eventd_buffer_size: default_buffer_size(),
            keepalived_workers: default_workers(),
            keepalived_buffer_size: default_buffer_size(),
            pipelined_workers: default_workers(),
            pipelined_buffer_size: default_buffer_size(),
            event_log_file: String::new(),
            event_log_buffer_size: default_event_log_buffer_size(),
            event_log_buffer_wait: default_event_log_buffer_wait(),
            keepalive_ttl: default_keepalive_ttl(),
            metrics_port: default_metrics_port(),
            no_metrics: false,
            config_store: ConfigStoreKind::default(),
            dev_mode: false,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint. The
    /// Postgres configuration store is recognised but rejected until an
    /// adapter ships.
    pub fn validate(&self) -> Result<(), String> {
        if self.config_store == ConfigStoreKind::Postgres {
            return Err("postgres config store not supported yet".to_string());
        }
        if self.config_store == ConfigStoreKind::Etcd && !self.dev_mode {
            return Err("etcd config store adapter is not included in this build".to_string());
        }
        if self.eventd_workers == 0 || self.keepalived_workers == 0 || self.pipelined_workers == 0 {
            return Err("worker counts must be at least 1".to_string());
        }
        if self.agent_write_timeout.is_zero() {
            return Err("agent write timeout must be non-zero".to_string());
        }
        Ok(())
    }
}
