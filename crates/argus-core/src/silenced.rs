//! Silencing entries: suppression rules over subscription/check pairs.

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::meta::ObjectMeta;

/// Wildcard matching any subscription or any check.
pub const WILDCARD: &str = "*";

/// A suppression rule keyed on a `subscription:check` pair.
///
/// Either side may be the `*` wildcard. A matching entry silences an event
/// (its name is appended to `event.silenced`) but the event still flows
/// through ingest and persistence; only handler dispatch consults the
/// silenced list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Silenced {
    /// Namespace, name (`subscription:check`), labels, annotations.
    pub metadata: ObjectMeta,

    /// Subscription to match, or `*`.
    #[serde(default)]
    pub subscription: String,

    /// Check name to match, or `*`.
    #[serde(default)]
    pub check: String,

    /// Unix timestamp the entry takes effect at (0 = immediately).
    #[serde(default)]
    pub begin: i64,

    /// Delete the entry once a matching OK event arrives.
    #[serde(default)]
    pub expire_on_resolve: bool,
}

impl Silenced {
    /// Builds an entry whose name follows the `subscription:check`
    /// convention.
    #[must_use]
    pub fn new(namespace: &str, subscription: &str, check: &str) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, entry_name(subscription, check)),
            subscription: subscription.to_string(),
            check: check.to_string(),
            ..Self::default()
        }
    }

    /// Whether this entry applies to the given event at time `now`.
    ///
    /// The subscription side matches the wildcard or any of the entity's
    /// effective subscriptions; the check side matches the wildcard or the
    /// check name. Entries with a future `begin` do not match yet.
    #[must_use]
    pub fn matches(&self, event: &Event, now: i64) -> bool {
        if self.begin > now {
            return false;
        }
        let check_matched = self.check == WILDCARD || self.check == event.check.metadata.name;
        if !check_matched {
            return false;
        }
        self.subscription == WILDCARD
            || event
                .entity
                .effective_subscriptions()
                .iter()
                .any(|s| *s == self.subscription)
    }
}

/// Canonical `subscription:check` entry name.
#[must_use]
pub fn entry_name(subscription: &str, check: &str) -> String {
    format!("{subscription}:{check}")
}
