//! Event filters: predicates gating handler dispatch.

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Names of the filters that exist without a store entry.
pub mod builtin {
    /// Allows only events with a non-zero status.
    pub const IS_INCIDENT: &str = "is_incident";
    /// Allows only events carrying a metric payload.
    pub const HAS_METRICS: &str = "has_metrics";
    /// Denies events matched by a silencing entry.
    pub const NOT_SILENCED: &str = "not_silenced";
}

/// Whether a matching filter admits or rejects the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    /// The event is handled only if the filter matches.
    #[default]
    Allow,
    /// The event is dropped if the filter matches.
    Deny,
}

/// A stored predicate over events.
///
/// All expressions must evaluate to true for the filter to match. The
/// expression language is a sandboxed comparison grammar over the event
/// document; evaluation is pure and deadline-bounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Namespace, name, labels, annotations.
    pub metadata: ObjectMeta,

    /// Admit or reject on match.
    #[serde(default)]
    pub action: FilterAction,

    /// Predicate expressions; conjunctive.
    #[serde(default)]
    pub expressions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_lowercase() {
        let filter = EventFilter {
            metadata: ObjectMeta::namespaced("default", "prod-only"),
            action: FilterAction::Deny,
            expressions: vec!["event.entity.metadata.labels.env == 'dev'".to_string()],
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["action"], "deny");
    }
}
