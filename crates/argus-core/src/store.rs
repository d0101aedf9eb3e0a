//! Abstract store contracts for configuration and event state.
//!
//! The processing pipeline never talks to a concrete database: it consumes
//! the configuration store through [`Store`] and event state through
//! [`EventStore`]. Implementations (in-memory, etcd, ...) live with the
//! backend; the contracts and the error taxonomy live here so every
//! component classifies failures the same way.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::check::CheckConfig;
use crate::entity::Entity;
use crate::event::Event;
use crate::filter::EventFilter;
use crate::handler::Handler;
use crate::mutator::Mutator;
use crate::silenced::Silenced;

/// Store failure taxonomy.
///
/// Components branch on the variant, not on backend-specific details:
/// `Transient` is retried with backoff, `NotFound`/`Unauthorized` map to
/// absence in graph resolution, and `Internal` is surfaced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested resource does not exist.
    #[error("not found")]
    NotFound,

    /// The caller may not read or write the resource.
    #[error("unauthorized")]
    Unauthorized,

    /// A retryable backend failure (connection loss, leader election, ...).
    #[error("transient store error: {0}")]
    Transient(String),

    /// A non-retryable backend failure.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Cursor-based list pagination.
///
/// `limit` bounds the page size; the store overwrites `continue_token`
/// with the cursor for the next page, or clears it when the listing is
/// exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPredicate {
    /// Opaque continuation cursor; empty on the first call.
    #[serde(default)]
    pub continue_token: String,

    /// Maximum records per page; 0 = no limit.
    #[serde(default)]
    pub limit: u64,
}

impl SelectionPredicate {
    /// A predicate requesting pages of `limit` records.
    #[must_use]
    pub fn with_limit(limit: u64) -> Self {
        Self {
            continue_token: String::new(),
            limit,
        }
    }
}

/// Kind of a configuration watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Resource created or updated.
    Put,
    /// Resource deleted.
    Delete,
}

/// A check configuration change notification.
#[derive(Debug, Clone)]
pub struct CheckWatchEvent {
    /// Create/update vs delete.
    pub kind: WatchEventKind,
    /// The configuration after the change (before, for deletes).
    pub check: CheckConfig,
}

/// Entity persistence.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Point read by `(namespace, name)`.
    async fn get_entity(&self, namespace: &str, name: &str) -> Result<Option<Entity>, StoreError>;

    /// Idempotent create-or-replace.
    async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    /// Delete by `(namespace, name)`; deleting a missing entity is not an
    /// error.
    async fn delete_entity(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// One page of entities in the namespace, name-ordered.
    async fn list_entities(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Entity>, StoreError>;
}

/// Check configuration persistence and watches.
#[async_trait]
pub trait CheckConfigStore: Send + Sync {
    /// Point read by `(namespace, name)`.
    async fn get_check_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CheckConfig>, StoreError>;

    /// Idempotent create-or-replace. Implementations emit a watch event.
    async fn update_check_config(&self, check: &CheckConfig) -> Result<(), StoreError>;

    /// Delete by `(namespace, name)`. Implementations emit a watch event.
    async fn delete_check_config(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// One page of check configurations in the namespace, name-ordered.
    async fn list_check_configs(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<CheckConfig>, StoreError>;

    /// Every check configuration across namespaces, for scheduler boot
    /// sync and watch-lag resynchronisation.
    async fn all_check_configs(&self) -> Result<Vec<CheckConfig>, StoreError>;

    /// Subscribes to configuration changes across all namespaces.
    fn watch_check_configs(&self) -> broadcast::Receiver<CheckWatchEvent>;
}

/// Handler persistence.
#[async_trait]
pub trait HandlerStore: Send + Sync {
    /// Point read by `(namespace, name)`.
    async fn get_handler(&self, namespace: &str, name: &str)
        -> Result<Option<Handler>, StoreError>;

    /// Idempotent create-or-replace.
    async fn update_handler(&self, handler: &Handler) -> Result<(), StoreError>;

    /// One page of handlers in the namespace, name-ordered.
    async fn list_handlers(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Handler>, StoreError>;
}

/// Event filter persistence.
#[async_trait]
pub trait EventFilterStore: Send + Sync {
    /// Point read by `(namespace, name)`.
    async fn get_event_filter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EventFilter>, StoreError>;

    /// Idempotent create-or-replace.
    async fn update_event_filter(&self, filter: &EventFilter) -> Result<(), StoreError>;

    /// One page of filters in the namespace, name-ordered.
    async fn list_event_filters(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<EventFilter>, StoreError>;
}

/// Mutator persistence.
#[async_trait]
pub trait MutatorStore: Send + Sync {
    /// Point read by `(namespace, name)`.
    async fn get_mutator(&self, namespace: &str, name: &str)
        -> Result<Option<Mutator>, StoreError>;

    /// Idempotent create-or-replace.
    async fn update_mutator(&self, mutator: &Mutator) -> Result<(), StoreError>;

    /// One page of mutators in the namespace, name-ordered.
    async fn list_mutators(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Mutator>, StoreError>;
}

/// Silencing entry persistence.
#[async_trait]
pub trait SilencedStore: Send + Sync {
    /// Point read by `(namespace, name)`.
    async fn get_silenced(&self, namespace: &str, name: &str)
        -> Result<Option<Silenced>, StoreError>;

    /// Idempotent create-or-replace.
    async fn update_silenced(&self, entry: &Silenced) -> Result<(), StoreError>;

    /// Delete by `(namespace, name)`; deleting a missing entry is not an
    /// error.
    async fn delete_silenced(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// One page of silencing entries in the namespace, name-ordered.
    async fn list_silenced(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Silenced>, StoreError>;
}

/// The aggregate configuration store the backend is constructed with.
pub trait Store:
    EntityStore
    + CheckConfigStore
    + HandlerStore
    + EventFilterStore
    + MutatorStore
    + SilencedStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: EntityStore
        + CheckConfigStore
        + HandlerStore
        + EventFilterStore
        + MutatorStore
        + SilencedStore
        + Send
        + Sync
{
}

/// Event state persistence, keyed on `(namespace, entity, check)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// The latest event for the key.
    async fn get_event(
        &self,
        namespace: &str,
        entity: &str,
        check: &str,
    ) -> Result<Option<Event>, StoreError>;

    /// Idempotent keyed upsert of the latest event.
    async fn update_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Delete by key; deleting a missing event is not an error.
    async fn delete_event(
        &self,
        namespace: &str,
        entity: &str,
        check: &str,
    ) -> Result<(), StoreError>;

    /// One page of events in the namespace, ordered by `(entity, check)`.
    async fn list_events(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Event>, StoreError>;

    /// One page of events for a single entity, check-ordered.
    async fn list_events_by_entity(
        &self,
        namespace: &str,
        entity: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Event>, StoreError>;

    /// Every persisted keepalive event across namespaces, for liveness
    /// timer replay on boot.
    async fn list_keepalives(&self) -> Result<Vec<Event>, StoreError>;
}

/// Helper for namespace-ordered pagination over an in-memory map.
///
/// Shared by memory store implementations: returns the page after
/// `continue_token` and the next token ("" when exhausted).
pub fn paginate<T: Clone>(
    records: &HashMap<String, T>,
    pred: &SelectionPredicate,
) -> (Vec<T>, String) {
    let mut names: Vec<&String> = records.keys().collect();
    names.sort();
    let start = if pred.continue_token.is_empty() {
        0
    } else {
        names.partition_point(|n| **n <= pred.continue_token)
    };
    let limit = if pred.limit == 0 {
        names.len()
    } else {
        usize::try_from(pred.limit).unwrap_or(usize::MAX)
    };
    let page: Vec<&String> = names.into_iter().skip(start).take(limit).collect();
    let next = match page.last() {
        Some(last) if page.len() == limit && limit > 0 => (**last).clone(),
        _ => String::new(),
    };
    let out = page.into_iter().map(|n| records[n].clone()).collect();
    (out, next)
}
