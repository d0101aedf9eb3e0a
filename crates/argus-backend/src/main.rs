//! argus-backend - monitoring backend daemon.
//!
//! The binary parses flags (plus an optional config file and
//! `ARGUS_BACKEND_*` environment variables), initialises logging,
//! assembles the [`Backend`], and runs it until SIGINT/SIGTERM.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use argus_backend::config::ConfigStoreKind;
use argus_backend::{Backend, BackendConfig};

/// argus backend - monitoring and observability daemon
#[derive(Parser, Debug)]
#[command(name = "argus-backend")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a backend configuration file (JSON)
    #[arg(short, long, env = "ARGUS_BACKEND_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Agent listener host
    #[arg(long, env = "ARGUS_BACKEND_AGENT_HOST")]
    agent_host: Option<String>,

    /// Agent listener port
    #[arg(long, env = "ARGUS_BACKEND_AGENT_PORT")]
    agent_port: Option<u16>,

    /// Timeout in seconds for agent writes
    #[arg(long, env = "ARGUS_BACKEND_AGENT_WRITE_TIMEOUT")]
    agent_write_timeout: Option<u64>,

    /// Number of workers spawned for processing incoming events
    #[arg(long, env = "ARGUS_BACKEND_EVENTD_WORKERS")]
    eventd_workers: Option<usize>,

    /// Number of incoming events that can be buffered
    #[arg(long, env = "ARGUS_BACKEND_EVENTD_BUFFER_SIZE")]
    eventd_buffer_size: Option<usize>,

    /// Number of workers spawned for processing incoming keepalives
    #[arg(long, env = "ARGUS_BACKEND_KEEPALIVED_WORKERS")]
    keepalived_workers: Option<usize>,

    /// Number of incoming keepalives that can be buffered
    #[arg(long, env = "ARGUS_BACKEND_KEEPALIVED_BUFFER_SIZE")]
    keepalived_buffer_size: Option<usize>,

    /// Number of workers spawned for handling events through the pipeline
    #[arg(long, env = "ARGUS_BACKEND_PIPELINED_WORKERS")]
    pipelined_workers: Option<usize>,

    /// Number of events awaiting handling that can be buffered
    #[arg(long, env = "ARGUS_BACKEND_PIPELINED_BUFFER_SIZE")]
    pipelined_buffer_size: Option<usize>,

    /// Path to the event log file
    #[arg(long, env = "ARGUS_BACKEND_EVENT_LOG_FILE")]
    event_log_file: Option<String>,

    /// Buffer size of the event logger
    #[arg(long, env = "ARGUS_BACKEND_EVENT_LOG_BUFFER_SIZE")]
    event_log_buffer_size: Option<usize>,

    /// Full buffer wait time in milliseconds
    #[arg(long, env = "ARGUS_BACKEND_EVENT_LOG_BUFFER_WAIT")]
    event_log_buffer_wait_ms: Option<u64>,

    /// Configuration store type [memory, etcd, postgres]
    #[arg(long, env = "ARGUS_BACKEND_CONFIG_STORE")]
    config_store: Option<String>,

    /// Start in single-node developer mode, no external dependencies
    #[arg(long)]
    dev: bool,

    /// Port for the Prometheus metrics HTTP endpoint
    #[arg(long, env = "ARGUS_BACKEND_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Disable the Prometheus metrics HTTP endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Entity labels map (key=value, repeatable)
    #[arg(long, value_parser = parse_key_value)]
    labels: Vec<(String, String)>,

    /// Entity annotations map (key=value, repeatable)
    #[arg(long, value_parser = parse_key_value)]
    annotations: Vec<(String, String)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "ARGUS_BACKEND_LOG_LEVEL")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long, env = "ARGUS_BACKEND_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

/// Layers flags over the config file over defaults.
fn build_config(args: &Args) -> Result<BackendConfig> {
    let mut config = match &args.config_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => BackendConfig::default(),
    };

    if let Some(host) = &args.agent_host {
        config.agent_host = host.clone();
    }
    if let Some(port) = args.agent_port {
        config.agent_port = port;
    }
    if let Some(secs) = args.agent_write_timeout {
        config.agent_write_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = args.eventd_workers {
        config.eventd_workers = n;
    }
    if let Some(n) = args.eventd_buffer_size {
        config.eventd_buffer_size = n;
    }
    if let Some(n) = args.keepalived_workers {
        config.keepalived_workers = n;
    }
    if let Some(n) = args.keepalived_buffer_size {
        config.keepalived_buffer_size = n;
    }
    if let Some(n) = args.pipelined_workers {
        config.pipelined_workers = n;
    }
    if let Some(n) = args.pipelined_buffer_size {
        config.pipelined_buffer_size = n;
    }
    if let Some(path) = &args.event_log_file {
        config.event_log_file = path.clone();
    }
    if let Some(n) = args.event_log_buffer_size {
        config.event_log_buffer_size = n;
    }
    if let Some(ms) = args.event_log_buffer_wait_ms {
        config.event_log_buffer_wait = Duration::from_millis(ms);
    }
    if let Some(kind) = &args.config_store {
        config.config_store = match kind.as_str() {
            "memory" => ConfigStoreKind::Memory,
            "etcd" => ConfigStoreKind::Etcd,
            "postgres" => ConfigStoreKind::Postgres,
            other => anyhow::bail!("unknown config store type {other:?}"),
        };
    }
    if args.dev {
        config.dev_mode = true;
        config.config_store = ConfigStoreKind::Memory;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    if args.no_metrics {
        config.no_metrics = true;
    }
    config.labels = args.labels.iter().cloned().collect::<BTreeMap<_, _>>();
    config.annotations = args.annotations.iter().cloned().collect::<BTreeMap<_, _>>();

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = build_config(&args)?;
    let backend = Backend::new(config)
        .await
        .context("failed to assemble backend")?;
    let cancel = backend.cancellation();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "failed to register SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        cancel.cancel();
    });

    backend.run().await.context("backend exited with error")
}
