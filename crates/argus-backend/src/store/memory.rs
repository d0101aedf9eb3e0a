//! In-memory configuration, event, and queue stores.
//!
//! Backing store for dev mode and the test suites. Semantics match the
//! contracts exactly: name-ordered pagination with continue tokens,
//! idempotent keyed upserts, and check-config watch events; there is no
//! cross-process durability.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::RwLock;

use argus_core::check::CheckConfig;
use argus_core::entity::Entity;
use argus_core::event::Event;
use argus_core::filter::EventFilter;
use argus_core::handler::Handler;
use argus_core::mutator::Mutator;
use argus_core::queue::{AdhocRequest, Queue};
use argus_core::silenced::Silenced;
use argus_core::store::{
    paginate, CheckConfigStore, CheckWatchEvent, EntityStore, EventFilterStore, EventStore,
    HandlerStore, MutatorStore, SelectionPredicate, SilencedStore, StoreError, WatchEventKind,
};

/// Watch channel depth; a lagging scheduler resyncs from a full list.
const WATCH_BUFFER: usize = 128;

type Namespaced<T> = RwLock<HashMap<String, HashMap<String, T>>>;

fn get_from<T: Clone>(map: &HashMap<String, HashMap<String, T>>, ns: &str, name: &str) -> Option<T> {
    map.get(ns).and_then(|m| m.get(name)).cloned()
}

fn list_from<T: Clone>(
    map: &HashMap<String, HashMap<String, T>>,
    ns: &str,
    pred: &mut SelectionPredicate,
) -> Vec<T> {
    let Some(records) = map.get(ns) else {
        pred.continue_token = String::new();
        return Vec::new();
    };
    let (page, next) = paginate(records, pred);
    pred.continue_token = next;
    page
}

/// In-memory configuration store.
pub struct MemoryStore {
    entities: Namespaced<Entity>,
    checks: Namespaced<CheckConfig>,
    handlers: Namespaced<Handler>,
    filters: Namespaced<EventFilter>,
    mutators: Namespaced<Mutator>,
    silenced: Namespaced<Silenced>,
    check_watch: broadcast::Sender<CheckWatchEvent>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (check_watch, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            entities: RwLock::new(HashMap::new()),
            checks: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
            mutators: RwLock::new(HashMap::new()),
            silenced: RwLock::new(HashMap::new()),
            check_watch,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, namespace: &str, name: &str) -> Result<Option<Entity>, StoreError> {
        Ok(get_from(&*self.entities.read().await, namespace, name))
    }

    async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entities
            .write()
            .await
            .entry(entity.metadata.namespace.clone())
            .or_default()
            .insert(entity.metadata.name.clone(), entity.clone());
        Ok(())
    }

    async fn delete_entity(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        if let Some(m) = self.entities.write().await.get_mut(namespace) {
            m.remove(name);
        }
        Ok(())
    }

    async fn list_entities(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Entity>, StoreError> {
        Ok(list_from(&*self.entities.read().await, namespace, pred))
    }
}

#[async_trait]
impl CheckConfigStore for MemoryStore {
    async fn get_check_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CheckConfig>, StoreError> {
        Ok(get_from(&*self.checks.read().await, namespace, name))
    }

    async fn update_check_config(&self, check: &CheckConfig) -> Result<(), StoreError> {
        self.checks
            .write()
            .await
            .entry(check.metadata.namespace.clone())
            .or_default()
            .insert(check.metadata.name.clone(), check.clone());
        let _ = self.check_watch.send(CheckWatchEvent {
            kind: WatchEventKind::Put,
            check: check.clone(),
        });
        Ok(())
    }

    async fn delete_check_config(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let removed = self
            .checks
            .write()
            .await
            .get_mut(namespace)
            .and_then(|m| m.remove(name));
        if let Some(check) = removed {
            let _ = self.check_watch.send(CheckWatchEvent {
                kind: WatchEventKind::Delete,
                check,
            });
        }
        Ok(())
    }

    async fn list_check_configs(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<CheckConfig>, StoreError> {
        Ok(list_from(&*self.checks.read().await, namespace, pred))
    }

    async fn all_check_configs(&self) -> Result<Vec<CheckConfig>, StoreError> {
        let map = self.checks.read().await;
        let mut out: Vec<CheckConfig> = map
            .values()
            .flat_map(|records| records.values())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.metadata.path().cmp(&b.metadata.path()));
        Ok(out)
    }

    fn watch_check_configs(&self) -> broadcast::Receiver<CheckWatchEvent> {
        self.check_watch.subscribe()
    }
}

#[async_trait]
impl HandlerStore for MemoryStore {
    async fn get_handler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Handler>, StoreError> {
        Ok(get_from(&*self.handlers.read().await, namespace, name))
    }

    async fn update_handler(&self, handler: &Handler) -> Result<(), StoreError> {
        self.handlers
            .write()
            .await
            .entry(handler.metadata.namespace.clone())
            .or_default()
            .insert(handler.metadata.name.clone(), handler.clone());
        Ok(())
    }

    async fn list_handlers(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Handler>, StoreError> {
        Ok(list_from(&*self.handlers.read().await, namespace, pred))
    }
}

#[async_trait]
impl EventFilterStore for MemoryStore {
    async fn get_event_filter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EventFilter>, StoreError> {
        Ok(get_from(&*self.filters.read().await, namespace, name))
    }

    async fn update_event_filter(&self, filter: &EventFilter) -> Result<(), StoreError> {
        self.filters
            .write()
            .await
            .entry(filter.metadata.namespace.clone())
            .or_default()
            .insert(filter.metadata.name.clone(), filter.clone());
        Ok(())
    }

    async fn list_event_filters(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<EventFilter>, StoreError> {
        Ok(list_from(&*self.filters.read().await, namespace, pred))
    }
}

#[async_trait]
impl MutatorStore for MemoryStore {
    async fn get_mutator(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Mutator>, StoreError> {
        Ok(get_from(&*self.mutators.read().await, namespace, name))
    }

    async fn update_mutator(&self, mutator: &Mutator) -> Result<(), StoreError> {
        self.mutators
            .write()
            .await
            .entry(mutator.metadata.namespace.clone())
            .or_default()
            .insert(mutator.metadata.name.clone(), mutator.clone());
        Ok(())
    }

    async fn list_mutators(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Mutator>, StoreError> {
        Ok(list_from(&*self.mutators.read().await, namespace, pred))
    }
}

#[async_trait]
impl SilencedStore for MemoryStore {
    async fn get_silenced(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Silenced>, StoreError> {
        Ok(get_from(&*self.silenced.read().await, namespace, name))
    }

    async fn update_silenced(&self, entry: &Silenced) -> Result<(), StoreError> {
        self.silenced
            .write()
            .await
            .entry(entry.metadata.namespace.clone())
            .or_default()
            .insert(entry.metadata.name.clone(), entry.clone());
        Ok(())
    }

    async fn delete_silenced(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        if let Some(m) = self.silenced.write().await.get_mut(namespace) {
            m.remove(name);
        }
        Ok(())
    }

    async fn list_silenced(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Silenced>, StoreError> {
        Ok(list_from(&*self.silenced.read().await, namespace, pred))
    }
}

/// In-memory event state store.
///
/// Events are keyed `entity/check` within each namespace so listing
/// orders by `(entity, check)` and entity listings are a prefix scan.
pub struct MemoryEventStore {
    events: Namespaced<Event>,
}

fn event_key(entity: &str, check: &str) -> String {
    format!("{entity}/{check}")
}

impl MemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get_event(
        &self,
        namespace: &str,
        entity: &str,
        check: &str,
    ) -> Result<Option<Event>, StoreError> {
        Ok(get_from(
            &*self.events.read().await,
            namespace,
            &event_key(entity, check),
        ))
    }

    async fn update_event(&self, event: &Event) -> Result<(), StoreError> {
        let (namespace, entity, check) = event.key();
        self.events
            .write()
            .await
            .entry(namespace)
            .or_default()
            .insert(event_key(&entity, &check), event.clone());
        Ok(())
    }

    async fn delete_event(
        &self,
        namespace: &str,
        entity: &str,
        check: &str,
    ) -> Result<(), StoreError> {
        if let Some(m) = self.events.write().await.get_mut(namespace) {
            m.remove(&event_key(entity, check));
        }
        Ok(())
    }

    async fn list_events(
        &self,
        namespace: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(list_from(&*self.events.read().await, namespace, pred))
    }

    async fn list_events_by_entity(
        &self,
        namespace: &str,
        entity: &str,
        pred: &mut SelectionPredicate,
    ) -> Result<Vec<Event>, StoreError> {
        let prefix = format!("{entity}/");
        let map = self.events.read().await;
        let Some(records) = map.get(namespace) else {
            pred.continue_token = String::new();
            return Ok(Vec::new());
        };
        let scoped: HashMap<String, Event> = records
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let (page, next) = paginate(&scoped, pred);
        pred.continue_token = next;
        Ok(page)
    }

    async fn list_keepalives(&self) -> Result<Vec<Event>, StoreError> {
        let map = self.events.read().await;
        let mut out: Vec<Event> = map
            .values()
            .flat_map(|records| records.values())
            .filter(|e| e.is_keepalive())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.entity.metadata.path().cmp(&b.entity.metadata.path()));
        Ok(out)
    }
}

/// In-memory ad-hoc request queue.
pub struct MemoryQueue {
    items: StdMutex<VecDeque<AdhocRequest>>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: StdMutex::new(VecDeque::new()),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, req: AdhocRequest) -> Result<(), StoreError> {
        self.items
            .lock()
            .map_err(|_| StoreError::Internal("queue lock poisoned".to_string()))?
            .push_back(req);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<AdhocRequest>, StoreError> {
        Ok(self
            .items
            .lock()
            .map_err(|_| StoreError::Internal("queue lock poisoned".to_string()))?
            .pop_front())
    }
}
