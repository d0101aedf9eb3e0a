//! Events: the unit flowing through the ingest and handling pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::check::Check;
use crate::entity::Entity;

/// Check name reserved for agent liveness events.
pub const KEEPALIVE_CHECK_NAME: &str = "keepalive";

/// The result of one check execution, or a synthesised liveness signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Unix timestamp the event was produced at.
    #[serde(default)]
    pub timestamp: i64,

    /// The entity the event is attributed to.
    pub entity: Entity,

    /// Check config snapshot plus execution result.
    pub check: Check,

    /// Raw metric payload attached by the agent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,

    /// Names of silencing entries matching this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub silenced: Vec<String>,
}

impl Event {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(entity: Entity, check: Check, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            entity,
            check,
            metrics: None,
            silenced: Vec::new(),
        }
    }

    /// The `(namespace, entity, check)` identity events are keyed on.
    #[must_use]
    pub fn key(&self) -> (String, String, String) {
        (
            self.entity.metadata.namespace.clone(),
            self.entity.metadata.name.clone(),
            self.check.metadata.name.clone(),
        )
    }

    /// Non-zero status.
    #[must_use]
    pub fn is_incident(&self) -> bool {
        self.check.status != 0
    }

    /// Whether a metric payload is attached.
    #[must_use]
    pub fn has_metrics(&self) -> bool {
        self.metrics.is_some()
    }

    /// Whether at least one silencing entry matched.
    #[must_use]
    pub fn is_silenced(&self) -> bool {
        !self.silenced.is_empty()
    }

    /// An OK event that terminates a non-OK streak. Relies on the history
    /// ring maintained by eventd: the last history point holds the
    /// previous event's status.
    #[must_use]
    pub fn is_resolution(&self) -> bool {
        self.check.status == 0 && self.check.history.last().is_some_and(|p| p.status != 0)
    }

    /// Whether this is an agent liveness event.
    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        self.check.metadata.name == KEEPALIVE_CHECK_NAME
    }

    /// Validates the fields agents are required to send.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first missing field.
    pub fn validate(&self) -> Result<(), String> {
        if !self.entity.metadata.is_complete() {
            return Err("event entity requires namespace and name".to_string());
        }
        if self.check.metadata.name.is_empty() {
            return Err("event check requires a name".to_string());
        }
        if self.timestamp <= 0 {
            return Err("event requires a positive timestamp".to_string());
        }
        Ok(())
    }
}
