//! Per-request batching and caching for graph resolution.
//!
//! One [`Loaders`] object is built per request and passed explicitly
//! through resolution; there is no process-global or context-keyed
//! registry. Within a request, repeated lookups for the same key are
//! served from the loader cache and never reach the store a second time.
//!
//! Listing walks store pages of [`LOADER_PAGE_SIZE`] until the continue
//! token empties, a page comes back short, or the per-resource clamp is
//! reached; the clamps bound memory for pathologically large namespaces.
//! `Unauthorized` and `NotFound` map to empty results: graph resolution
//! treats absence as acceptable and must not abort a traversal.

use std::collections::HashMap;
use std::sync::Arc;

use async_graphql::dataloader::{DataLoader, HashMapCache};
use tracing::debug;

use argus_core::check::CheckConfig;
use argus_core::entity::Entity;
use argus_core::event::Event;
use argus_core::filter::EventFilter;
use argus_core::handler::Handler;
use argus_core::mutator::Mutator;
use argus_core::silenced::Silenced;
use argus_core::store::{
    CheckConfigStore, EntityStore, EventFilterStore, HandlerStore, MutatorStore,
    SelectionPredicate, SilencedStore, Store, StoreError,
};
use argus_core::EventStore;

/// Chunk size used when retrieving resources from the store.
pub const LOADER_PAGE_SIZE: u64 = 250;

/// Record clamp for entity listings.
pub const MAX_ENTITY_RESULTS: usize = 1000;

/// Record clamp for event listings.
pub const MAX_EVENT_RESULTS: usize = 1000;

/// Record clamp for every other resource kind.
pub const MAX_GENERIC_RESULTS: usize = 2500;

/// Namespace-scoped cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceKey(pub String);

/// Composite cache key for events: a namespace plus an optional entity
/// (empty = all events in the namespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventsKey {
    /// Namespace to list in.
    pub namespace: String,
    /// Entity to scope to; empty lists the whole namespace.
    pub entity: String,
}

/// Absence is acceptable during graph resolution; permission and
/// existence failures become empty results instead of traversal aborts.
fn absorb_list_err<T>(err: StoreError) -> Result<Vec<T>, StoreError> {
    match err {
        StoreError::Unauthorized | StoreError::NotFound => {
            debug!(error = %err, "listing absorbed to empty result");
            Ok(Vec::new())
        }
        other => Err(other),
    }
}

/// Batched entity listing by namespace.
pub struct EntityLoader(pub Arc<dyn Store>);

impl async_graphql::dataloader::Loader<NamespaceKey> for EntityLoader {
    type Value = Vec<Entity>;
    type Error = StoreError;

    async fn load(
        &self,
        keys: &[NamespaceKey],
    ) -> Result<HashMap<NamespaceKey, Self::Value>, Self::Error> {
        let mut results = HashMap::new();
        for key in keys {
            let mut records = Vec::new();
            let mut pred = SelectionPredicate::with_limit(LOADER_PAGE_SIZE);
            loop {
                let page = match self.0.list_entities(&key.0, &mut pred).await {
                    Ok(page) => page,
                    Err(err) => {
                        records = absorb_list_err(err)?;
                        break;
                    }
                };
                let short = (page.len() as u64) < LOADER_PAGE_SIZE;
                records.extend(page);
                if pred.continue_token.is_empty() || short || records.len() >= MAX_ENTITY_RESULTS {
                    break;
                }
            }
            records.truncate(MAX_ENTITY_RESULTS);
            results.insert(key.clone(), records);
        }
        Ok(results)
    }
}

/// Batched event listing by `(namespace, entity)`.
pub struct EventLoader(pub Arc<dyn EventStore>);

impl async_graphql::dataloader::Loader<EventsKey> for EventLoader {
    type Value = Vec<Event>;
    type Error = StoreError;

    async fn load(
        &self,
        keys: &[EventsKey],
    ) -> Result<HashMap<EventsKey, Self::Value>, Self::Error> {
        let mut results = HashMap::new();
        for key in keys {
            let mut records = Vec::new();
            let mut pred = SelectionPredicate::with_limit(LOADER_PAGE_SIZE);
            loop {
                let listed = if key.entity.is_empty() {
                    self.0.list_events(&key.namespace, &mut pred).await
                } else {
                    self.0
                        .list_events_by_entity(&key.namespace, &key.entity, &mut pred)
                        .await
                };
                let page = match listed {
                    Ok(page) => page,
                    Err(err) => {
                        records = absorb_list_err(err)?;
                        break;
                    }
                };
                let short = (page.len() as u64) < LOADER_PAGE_SIZE;
                records.extend(page);
                if pred.continue_token.is_empty() || short || records.len() >= MAX_EVENT_RESULTS {
                    break;
                }
            }
            records.truncate(MAX_EVENT_RESULTS);
            results.insert(key.clone(), records);
        }
        Ok(results)
    }
}

/// Generates namespace-keyed loaders for the generic-clamped resources;
/// each expands to the same page-walk the entity loader uses.
macro_rules! namespace_loader {
    ($name:ident, $store:ty, $value:ty, $list:ident) => {
        /// Batched listing by namespace.
        pub struct $name(pub Arc<$store>);

        impl async_graphql::dataloader::Loader<NamespaceKey> for $name {
            type Value = Vec<$value>;
            type Error = StoreError;

            async fn load(
                &self,
                keys: &[NamespaceKey],
            ) -> Result<HashMap<NamespaceKey, Self::Value>, Self::Error> {
                let mut results = HashMap::new();
                for key in keys {
                    let mut records = Vec::new();
                    let mut pred = SelectionPredicate::with_limit(LOADER_PAGE_SIZE);
                    loop {
                        let page = match self.0.$list(&key.0, &mut pred).await {
                            Ok(page) => page,
                            Err(err) => {
                                records = absorb_list_err(err)?;
                                break;
                            }
                        };
                        let short = (page.len() as u64) < LOADER_PAGE_SIZE;
                        records.extend(page);
                        if pred.continue_token.is_empty()
                            || short
                            || records.len() >= MAX_GENERIC_RESULTS
                        {
                            break;
                        }
                    }
                    records.truncate(MAX_GENERIC_RESULTS);
                    results.insert(key.clone(), records);
                }
                Ok(results)
            }
        }
    };
}

namespace_loader!(CheckConfigLoader, dyn Store, CheckConfig, list_check_configs);
namespace_loader!(HandlerLoader, dyn Store, Handler, list_handlers);
namespace_loader!(EventFilterLoader, dyn Store, EventFilter, list_event_filters);
namespace_loader!(MutatorLoader, dyn Store, Mutator, list_mutators);
namespace_loader!(SilencedLoader, dyn Store, Silenced, list_silenced);

/// The per-request loader set.
///
/// Build one per incoming request and pass it by reference through
/// resolution; dropping it drops every cache with it.
pub struct Loaders {
    entities: DataLoader<EntityLoader, HashMapCache>,
    events: DataLoader<EventLoader, HashMapCache>,
    checks: DataLoader<CheckConfigLoader, HashMapCache>,
    handlers: DataLoader<HandlerLoader, HashMapCache>,
    filters: DataLoader<EventFilterLoader, HashMapCache>,
    mutators: DataLoader<MutatorLoader, HashMapCache>,
    silenced: DataLoader<SilencedLoader, HashMapCache>,
}

impl Loaders {
    /// Creates the loader set for one request.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, event_store: Arc<dyn EventStore>) -> Self {
        Self {
            entities: DataLoader::with_cache(
                EntityLoader(Arc::clone(&store)),
                tokio::spawn,
                HashMapCache::default(),
            ),
            events: DataLoader::with_cache(
                EventLoader(event_store),
                tokio::spawn,
                HashMapCache::default(),
            ),
            checks: DataLoader::with_cache(
                CheckConfigLoader(Arc::clone(&store)),
                tokio::spawn,
                HashMapCache::default(),
            ),
            handlers: DataLoader::with_cache(
                HandlerLoader(Arc::clone(&store)),
                tokio::spawn,
                HashMapCache::default(),
            ),
            filters: DataLoader::with_cache(
                EventFilterLoader(Arc::clone(&store)),
                tokio::spawn,
                HashMapCache::default(),
            ),
            mutators: DataLoader::with_cache(
                MutatorLoader(Arc::clone(&store)),
                tokio::spawn,
                HashMapCache::default(),
            ),
            silenced: DataLoader::with_cache(
                SilencedLoader(store),
                tokio::spawn,
                HashMapCache::default(),
            ),
        }
    }

    /// Entities in a namespace, clamped to [`MAX_ENTITY_RESULTS`].
    ///
    /// # Errors
    ///
    /// Propagates transient/internal store failures; authorization and
    /// existence failures resolve to an empty list.
    pub async fn entities(&self, namespace: &str) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .entities
            .load_one(NamespaceKey(namespace.to_string()))
            .await?
            .unwrap_or_default())
    }

    /// Events for an entity (or a whole namespace when `entity` is
    /// empty), clamped to [`MAX_EVENT_RESULTS`].
    ///
    /// # Errors
    ///
    /// See [`Loaders::entities`].
    pub async fn events(&self, namespace: &str, entity: &str) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .load_one(EventsKey {
                namespace: namespace.to_string(),
                entity: entity.to_string(),
            })
            .await?
            .unwrap_or_default())
    }

    /// Check configurations in a namespace.
    ///
    /// # Errors
    ///
    /// See [`Loaders::entities`].
    pub async fn check_configs(&self, namespace: &str) -> Result<Vec<CheckConfig>, StoreError> {
        Ok(self
            .checks
            .load_one(NamespaceKey(namespace.to_string()))
            .await?
            .unwrap_or_default())
    }

    /// Handlers in a namespace.
    ///
    /// # Errors
    ///
    /// See [`Loaders::entities`].
    pub async fn handlers(&self, namespace: &str) -> Result<Vec<Handler>, StoreError> {
        Ok(self
            .handlers
            .load_one(NamespaceKey(namespace.to_string()))
            .await?
            .unwrap_or_default())
    }

    /// Event filters in a namespace.
    ///
    /// # Errors
    ///
    /// See [`Loaders::entities`].
    pub async fn event_filters(&self, namespace: &str) -> Result<Vec<EventFilter>, StoreError> {
        Ok(self
            .filters
            .load_one(NamespaceKey(namespace.to_string()))
            .await?
            .unwrap_or_default())
    }

    /// Mutators in a namespace.
    ///
    /// # Errors
    ///
    /// See [`Loaders::entities`].
    pub async fn mutators(&self, namespace: &str) -> Result<Vec<Mutator>, StoreError> {
        Ok(self
            .mutators
            .load_one(NamespaceKey(namespace.to_string()))
            .await?
            .unwrap_or_default())
    }

    /// Silencing entries in a namespace.
    ///
    /// # Errors
    ///
    /// See [`Loaders::entities`].
    pub async fn silenced(&self, namespace: &str) -> Result<Vec<Silenced>, StoreError> {
        Ok(self
            .silenced
            .load_one(NamespaceKey(namespace.to_string()))
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use argus_core::meta::ObjectMeta;
    use argus_core::store::EntityStore;

    use crate::store::{MemoryEventStore, MemoryStore};

    /// Store wrapper counting entity list calls.
    struct CountingStore {
        inner: MemoryStore,
        entity_lists: AtomicUsize,
        fail_with: std::sync::Mutex<Option<StoreError>>,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                entity_lists: AtomicUsize::new(0),
                fail_with: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl EntityStore for CountingStore {
        async fn get_entity(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Entity>, StoreError> {
            self.inner.get_entity(namespace, name).await
        }

        async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError> {
            self.inner.update_entity(entity).await
        }

        async fn delete_entity(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_entity(namespace, name).await
        }

        async fn list_entities(
            &self,
            namespace: &str,
            pred: &mut SelectionPredicate,
        ) -> Result<Vec<Entity>, StoreError> {
            self.entity_lists.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            self.inner.list_entities(namespace, pred).await
        }
    }

    macro_rules! delegate {
        ($trait_:ident { $($body:tt)* }) => {
            #[async_trait::async_trait]
            impl argus_core::store::$trait_ for CountingStore { $($body)* }
        };
    }

    delegate!(CheckConfigStore {
        async fn get_check_config(&self, ns: &str, name: &str) -> Result<Option<CheckConfig>, StoreError> {
            self.inner.get_check_config(ns, name).await
        }
        async fn update_check_config(&self, check: &CheckConfig) -> Result<(), StoreError> {
            self.inner.update_check_config(check).await
        }
        async fn delete_check_config(&self, ns: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_check_config(ns, name).await
        }
        async fn list_check_configs(&self, ns: &str, pred: &mut SelectionPredicate) -> Result<Vec<CheckConfig>, StoreError> {
            self.inner.list_check_configs(ns, pred).await
        }
        async fn all_check_configs(&self) -> Result<Vec<CheckConfig>, StoreError> {
            self.inner.all_check_configs().await
        }
        fn watch_check_configs(&self) -> tokio::sync::broadcast::Receiver<argus_core::store::CheckWatchEvent> {
            self.inner.watch_check_configs()
        }
    });

    delegate!(HandlerStore {
        async fn get_handler(&self, ns: &str, name: &str) -> Result<Option<Handler>, StoreError> {
            self.inner.get_handler(ns, name).await
        }
        async fn update_handler(&self, handler: &Handler) -> Result<(), StoreError> {
            self.inner.update_handler(handler).await
        }
        async fn list_handlers(&self, ns: &str, pred: &mut SelectionPredicate) -> Result<Vec<Handler>, StoreError> {
            self.inner.list_handlers(ns, pred).await
        }
    });

    delegate!(EventFilterStore {
        async fn get_event_filter(&self, ns: &str, name: &str) -> Result<Option<EventFilter>, StoreError> {
            self.inner.get_event_filter(ns, name).await
        }
        async fn update_event_filter(&self, filter: &EventFilter) -> Result<(), StoreError> {
            self.inner.update_event_filter(filter).await
        }
        async fn list_event_filters(&self, ns: &str, pred: &mut SelectionPredicate) -> Result<Vec<EventFilter>, StoreError> {
            self.inner.list_event_filters(ns, pred).await
        }
    });

    delegate!(MutatorStore {
        async fn get_mutator(&self, ns: &str, name: &str) -> Result<Option<Mutator>, StoreError> {
            self.inner.get_mutator(ns, name).await
        }
        async fn update_mutator(&self, mutator: &Mutator) -> Result<(), StoreError> {
            self.inner.update_mutator(mutator).await
        }
        async fn list_mutators(&self, ns: &str, pred: &mut SelectionPredicate) -> Result<Vec<Mutator>, StoreError> {
            self.inner.list_mutators(ns, pred).await
        }
    });

    delegate!(SilencedStore {
        async fn get_silenced(&self, ns: &str, name: &str) -> Result<Option<Silenced>, StoreError> {
            self.inner.get_silenced(ns, name).await
        }
        async fn update_silenced(&self, entry: &Silenced) -> Result<(), StoreError> {
            self.inner.update_silenced(entry).await
        }
        async fn delete_silenced(&self, ns: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_silenced(ns, name).await
        }
        async fn list_silenced(&self, ns: &str, pred: &mut SelectionPredicate) -> Result<Vec<Silenced>, StoreError> {
            self.inner.list_silenced(ns, pred).await
        }
    });

    fn entity(name: &str) -> Entity {
        Entity {
            metadata: ObjectMeta::namespaced("default", name),
            ..Entity::default()
        }
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_store_once() {
        let store = Arc::new(CountingStore::new());
        store.inner.update_entity(&entity("web01")).await.unwrap();
        store.inner.update_entity(&entity("web02")).await.unwrap();

        let loaders = Loaders::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(MemoryEventStore::new()),
        );

        let first = loaders.entities("default").await.unwrap();
        assert_eq!(first.len(), 2);
        let lists_after_first = store.entity_lists.load(Ordering::SeqCst);
        assert!(lists_after_first >= 1);

        let second = loaders.entities("default").await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(store.entity_lists.load(Ordering::SeqCst), lists_after_first);
    }

    #[tokio::test]
    async fn unauthorized_listing_resolves_empty() {
        let store = Arc::new(CountingStore::new());
        *store.fail_with.lock().unwrap() = Some(StoreError::Unauthorized);

        let loaders = Loaders::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(MemoryEventStore::new()),
        );
        assert!(loaders.entities("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_errors_propagate() {
        let store = Arc::new(CountingStore::new());
        *store.fail_with.lock().unwrap() = Some(StoreError::Transient("leader lost".to_string()));

        let loaders = Loaders::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(MemoryEventStore::new()),
        );
        assert!(loaders.entities("default").await.is_err());
    }

    #[tokio::test]
    async fn event_listings_are_scoped_per_entity() {
        let store = Arc::new(MemoryStore::new());
        let event_store = Arc::new(MemoryEventStore::new());
        for (entity_name, check_name) in [("web01", "http"), ("web01", "disk"), ("db01", "http")] {
            let event = Event::new(
                entity(entity_name),
                argus_core::check::Check {
                    metadata: ObjectMeta::namespaced("default", check_name),
                    ..argus_core::check::Check::default()
                },
                1700000000,
            );
            event_store.update_event(&event).await.unwrap();
        }

        let loaders = Loaders::new(
            store as Arc<dyn Store>,
            Arc::clone(&event_store) as Arc<dyn EventStore>,
        );
        assert_eq!(loaders.events("default", "web01").await.unwrap().len(), 2);
        assert_eq!(loaders.events("default", "").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn entity_results_are_clamped() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..(MAX_ENTITY_RESULTS + 50) {
            store
                .update_entity(&entity(&format!("host{i:05}")))
                .await
                .unwrap();
        }
        let loaders = Loaders::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(MemoryEventStore::new()),
        );
        assert_eq!(
            loaders.entities("default").await.unwrap().len(),
            MAX_ENTITY_RESULTS
        );
    }
}
