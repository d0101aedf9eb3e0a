//! Check configuration, scheduled requests, and execution snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::meta::ObjectMeta;

/// Number of history points retained on a check (previous statuses).
pub const HISTORY_BOUND: usize = 21;

/// Validation failures for a [`CheckConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckValidationError {
    /// Namespace or name missing.
    #[error("check metadata requires namespace and name")]
    IncompleteMetadata,

    /// Neither `interval` nor `cron` was set.
    #[error("check {0} must set either interval or cron")]
    NoSchedule(String),

    /// Both `interval` and `cron` were set.
    #[error("check {0} must set interval or cron, not both")]
    AmbiguousSchedule(String),

    /// Interval below the 1 second minimum.
    #[error("check {0} interval must be at least 1 second")]
    IntervalTooSmall(String),

    /// Cron expression failed to parse.
    #[error("check {name} cron expression invalid: {reason}")]
    InvalidCron {
        /// Offending check name.
        name: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Proxy check fan-out: execute the check once per entity whose document
/// matches every listed attribute expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequests {
    /// Filter expressions evaluated against candidate entities.
    #[serde(default)]
    pub entity_attributes: Vec<String>,
}

/// Declarative definition of a check.
///
/// Exactly one of `interval` (seconds, >= 1) or `cron` must be set.
/// Mutable only through the API; the scheduler treats each revision as
/// immutable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Namespace, name, labels, annotations.
    pub metadata: ObjectMeta,

    /// Command executed by the agent.
    #[serde(default)]
    pub command: String,

    /// Fixed scheduling interval in seconds; 0 when cron-scheduled.
    #[serde(default)]
    pub interval: u32,

    /// Cron schedule; empty when interval-scheduled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron: String,

    /// Subscriptions the check request is published on.
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Handlers events from this check are dispatched to.
    #[serde(default)]
    pub handlers: Vec<String>,

    /// Execution timeout in seconds (0 = none).
    #[serde(default)]
    pub timeout: u32,

    /// Freshness TTL in seconds (0 = disabled).
    #[serde(default)]
    pub ttl: i64,

    /// Whether the scheduler publishes requests for this check.
    #[serde(default = "default_publish")]
    pub publish: bool,

    /// Deliver each request to exactly one subscriber instead of all.
    #[serde(default)]
    pub round_robin: bool,

    /// Name of the proxy entity results are attributed to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_entity_name: String,

    /// Per-entity proxy fan-out selectors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_requests: Option<ProxyRequests>,
}

const fn default_publish() -> bool {
    true
}

impl CheckConfig {
    /// Validates schedule and metadata invariants.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckValidationError`] describing the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), CheckValidationError> {
        if !self.metadata.is_complete() {
            return Err(CheckValidationError::IncompleteMetadata);
        }
        let name = self.metadata.name.clone();
        match (self.interval, self.cron.is_empty()) {
            (0, true) => return Err(CheckValidationError::NoSchedule(name)),
            (1.., false) => return Err(CheckValidationError::AmbiguousSchedule(name)),
            (0, false) => {
                if let Err(err) = self.cron.parse::<cron::Schedule>() {
                    return Err(CheckValidationError::InvalidCron {
                        name,
                        reason: err.to_string(),
                    });
                }
            }
            (1.., true) => {}
        }
        Ok(())
    }
}

/// A request for one check execution, published on subscription topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Snapshot of the scheduling config at publish time.
    pub config: CheckConfig,

    /// Unix timestamp the request was issued at.
    pub issued: i64,

    /// Proxy entity the execution should be attributed to, when the
    /// request came from proxy fan-out.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_entity_name: String,
}

/// One retained history point: the status of a prior event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// Exit status of the prior execution.
    pub status: u32,

    /// Unix timestamp of the prior execution.
    pub executed: i64,
}

/// Check state embedded in an event: the config snapshot carried by the
/// request, plus the execution result and the streak accounting maintained
/// by eventd.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Namespace, name, labels, annotations.
    pub metadata: ObjectMeta,

    /// Command that was executed.
    #[serde(default)]
    pub command: String,

    /// Scheduling interval snapshot.
    #[serde(default)]
    pub interval: u32,

    /// Cron schedule snapshot.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron: String,

    /// Subscriptions snapshot.
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Handlers events from this check are dispatched to.
    #[serde(default)]
    pub handlers: Vec<String>,

    /// Freshness TTL in seconds (0 = disabled).
    #[serde(default)]
    pub ttl: i64,

    /// Execution timeout snapshot.
    #[serde(default)]
    pub timeout: u32,

    /// Exit status: 0 OK, 1 warning, 2 critical, >= 3 unknown.
    #[serde(default)]
    pub status: u32,

    /// Raw command output.
    #[serde(default)]
    pub output: String,

    /// Unix timestamp the command ran at.
    #[serde(default)]
    pub executed: i64,

    /// Unix timestamp the request was issued at.
    #[serde(default)]
    pub issued: i64,

    /// Command wall-clock duration in seconds.
    #[serde(default)]
    pub duration: f64,

    /// Statuses of prior events for this `(entity, check)` key, oldest
    /// first, bounded at [`HISTORY_BOUND`].
    #[serde(default)]
    pub history: Vec<HistoryPoint>,

    /// Length of the current same-status streak.
    #[serde(default)]
    pub occurrences: i64,

    /// Maximum occurrences observed within the current non-OK streak.
    #[serde(default)]
    pub occurrences_watermark: i64,
}

impl Check {
    /// Builds the event-embedded snapshot for a scheduled request.
    #[must_use]
    pub fn from_request(req: &CheckRequest) -> Self {
        let cfg = &req.config;
        Self {
            metadata: cfg.metadata.clone(),
            command: cfg.command.clone(),
            interval: cfg.interval,
            cron: cfg.cron.clone(),
            subscriptions: cfg.subscriptions.clone(),
            handlers: cfg.handlers.clone(),
            ttl: cfg.ttl,
            timeout: cfg.timeout,
            issued: req.issued,
            ..Self::default()
        }
    }
}
