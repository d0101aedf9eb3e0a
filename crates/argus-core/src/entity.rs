//! Entities: the principals that produce events.

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Classification of an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityClass {
    /// A host running an agent with a live backend session.
    #[default]
    Agent,
    /// A target checked on behalf of by another agent (no session of its
    /// own); liveness is not tracked.
    Proxy,
}

/// An agent host or proxy target that events are attributed to.
///
/// Agent entities are created on first handshake and refreshed by
/// keepalives; proxy entities are created via the API or by proxy check
/// expansion. `(namespace, name)` is unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Namespace, name, labels, annotations.
    pub metadata: ObjectMeta,

    /// Whether this entity is an agent or a proxy target.
    #[serde(default)]
    pub entity_class: EntityClass,

    /// Subscriptions this entity accepts check requests on.
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Unix timestamp of the last keepalive or session activity.
    #[serde(default)]
    pub last_seen: i64,
}

impl Entity {
    /// The self-subscription every agent entity implicitly carries, so
    /// checks can target a single host by name.
    #[must_use]
    pub fn self_subscription(&self) -> String {
        format!("entity:{}", self.metadata.name)
    }

    /// Returns the entity's subscriptions including the implicit
    /// `entity:<name>` self-subscription for agents.
    #[must_use]
    pub fn effective_subscriptions(&self) -> Vec<String> {
        let mut subs = self.subscriptions.clone();
        if self.entity_class == EntityClass::Agent {
            let own = self.self_subscription();
            if !subs.contains(&own) {
                subs.push(own);
            }
        }
        subs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, subs: &[&str]) -> Entity {
        Entity {
            metadata: ObjectMeta::namespaced("default", name),
            entity_class: EntityClass::Agent,
            subscriptions: subs.iter().map(|s| (*s).to_string()).collect(),
            last_seen: 0,
        }
    }

    #[test]
    fn agent_gains_self_subscription() {
        let entity = agent("web01", &["linux"]);
        let subs = entity.effective_subscriptions();
        assert!(subs.contains(&"linux".to_string()));
        assert!(subs.contains(&"entity:web01".to_string()));
    }

    #[test]
    fn self_subscription_not_duplicated() {
        let entity = agent("web01", &["entity:web01"]);
        let subs = entity.effective_subscriptions();
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn proxy_has_no_self_subscription() {
        let mut entity = agent("rtr01", &["snmp"]);
        entity.entity_class = EntityClass::Proxy;
        assert_eq!(entity.effective_subscriptions(), vec!["snmp".to_string()]);
    }

    #[test]
    fn entity_class_serializes_lowercase() {
        let entity = agent("web01", &[]);
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["entity_class"], "agent");
    }
}
