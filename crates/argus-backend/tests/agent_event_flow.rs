//! End-to-end flows through a full backend over real TCP sessions.

use std::time::Duration;

use bytes::Bytes;

use argus_backend::transport::{self, Message, TcpTransport, Transport};
use argus_backend::{Backend, BackendConfig};
use argus_core::check::{Check, CheckConfig};
use argus_core::entity::{Entity, EntityClass};
use argus_core::event::Event;
use argus_core::handler::{Handler, HandlerType};
use argus_core::meta::ObjectMeta;
use argus_core::silenced::Silenced;
use argus_core::store::{CheckConfigStore, HandlerStore, SelectionPredicate, SilencedStore};
use argus_core::EventStore;

fn test_config() -> BackendConfig {
    BackendConfig {
        agent_host: "127.0.0.1".to_string(),
        agent_port: 0,
        no_metrics: true,
        dev_mode: true,
        eventd_workers: 4,
        keepalived_workers: 2,
        pipelined_workers: 4,
        ..BackendConfig::default()
    }
}

async fn started_backend() -> Backend {
    let mut backend = Backend::new(test_config()).await.expect("backend config");
    backend.start().await.expect("backend start");
    backend
}

fn agent_entity(name: &str, subscriptions: &[&str]) -> Entity {
    Entity {
        metadata: ObjectMeta::namespaced("default", name),
        entity_class: EntityClass::Agent,
        subscriptions: subscriptions.iter().map(|s| (*s).to_string()).collect(),
        last_seen: 0,
    }
}

async fn connected_agent(backend: &Backend, entity: &Entity) -> TcpTransport {
    let addr = backend.agent_addr().expect("agent listener bound");
    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let mut agent = TcpTransport::new(stream);
    agent
        .send(
            Message::json(transport::TYPE_ENTITY_CONFIG, entity).unwrap(),
            Duration::from_secs(1),
        )
        .await
        .expect("handshake send");
    agent
}

fn check_event(entity: &Entity, check_name: &str, status: u32, timestamp: i64) -> Event {
    Event::new(
        entity.clone(),
        Check {
            metadata: ObjectMeta::namespaced("default", check_name),
            status,
            output: format!("status {status}"),
            executed: timestamp,
            ..Check::default()
        },
        timestamp,
    )
}

/// Polls the event store until the predicate holds or the deadline
/// passes.
async fn wait_for_event<F>(backend: &Backend, entity: &str, check: &str, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    let store = backend.event_store();
    for _ in 0..200 {
        if let Ok(Some(event)) = store.get_event("default", entity, check).await {
            if predicate(&event) {
                return event;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("event for {entity}/{check} never reached expected state");
}

#[tokio::test]
async fn occurrence_streaks_accumulate_across_a_session() {
    let backend = started_backend().await;
    let entity = agent_entity("web01", &["linux"]);
    let mut agent = connected_agent(&backend, &entity).await;

    // Statuses 0, 0, 2: occurrences run 1, 2, 1 and the watermark
    // follows; history after the third event holds the two OK statuses.
    for (i, status) in [0u32, 0, 2].into_iter().enumerate() {
        let event = check_event(&entity, "http", status, 1700000000 + i as i64 * 10);
        agent
            .send(
                Message::json(transport::TYPE_EVENT, &event).unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
    }

    let persisted = wait_for_event(&backend, "web01", "http", |e| e.check.status == 2).await;
    assert_eq!(persisted.check.occurrences, 1);
    assert_eq!(persisted.check.occurrences_watermark, 1);
    let statuses: Vec<u32> = persisted.check.history.iter().map(|p| p.status).collect();
    assert_eq!(statuses, vec![0, 0]);

    agent.close().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn event_upsert_is_idempotent() {
    let backend = started_backend().await;
    let entity = agent_entity("web02", &["linux"]);
    let event = check_event(&entity, "disk", 1, 1700000000);

    // Writing the same document twice leaves the persisted state (and
    // the key space) exactly as after the first write.
    let store = backend.event_store();
    store.update_event(&event).await.unwrap();
    let first = store
        .get_event("default", "web02", "disk")
        .await
        .unwrap()
        .unwrap();
    store.update_event(&event).await.unwrap();
    let second = store
        .get_event("default", "web02", "disk")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, second);

    let mut pred = SelectionPredicate::default();
    assert_eq!(store.list_events("default", &mut pred).await.unwrap().len(), 1);

    backend.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_session() {
    let backend = started_backend().await;
    let entity = agent_entity("web03", &["linux"]);
    let mut agent = connected_agent(&backend, &entity).await;

    agent
        .send(
            Message::new(transport::TYPE_EVENT, Bytes::from_static(b"garbage")),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    agent
        .send(
            Message::json(
                transport::TYPE_EVENT,
                &check_event(&entity, "http", 0, 1700000000),
            )
            .unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    wait_for_event(&backend, "web03", "http", |e| e.check.status == 0).await;

    agent.close().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn scheduler_delivers_requests_to_connected_agents() {
    let backend = started_backend().await;
    backend
        .store()
        .update_check_config(&CheckConfig {
            metadata: ObjectMeta::namespaced("default", "mem"),
            command: "check-mem.sh".to_string(),
            interval: 1,
            subscriptions: vec!["linux".to_string()],
            ..CheckConfig::default()
        })
        .await
        .unwrap();

    let entity = agent_entity("web04", &["linux"]);
    let mut agent = connected_agent(&backend, &entity).await;

    let mut received = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received < 2 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(3), agent.recv()).await {
            Ok(Ok(Some(msg))) if msg.type_ == transport::TYPE_CHECK_REQUEST => {
                let request: argus_core::check::CheckRequest =
                    serde_json::from_slice(&msg.payload).unwrap();
                assert_eq!(request.config.metadata.name, "mem");
                received += 1;
            }
            Ok(Ok(Some(_))) => {}
            _ => break,
        }
    }
    assert!(received >= 2, "agent received {received} check requests");

    agent.close().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn silences_mark_events_and_expire_on_resolve() {
    let backend = started_backend().await;
    let mut entry = Silenced::new("default", "linux", "http");
    entry.expire_on_resolve = true;
    backend.store().update_silenced(&entry).await.unwrap();

    let entity = agent_entity("web05", &["linux"]);
    let mut agent = connected_agent(&backend, &entity).await;

    agent
        .send(
            Message::json(
                transport::TYPE_EVENT,
                &check_event(&entity, "http", 2, 1700000000),
            )
            .unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let silenced = wait_for_event(&backend, "web05", "http", |e| e.check.status == 2).await;
    assert_eq!(silenced.silenced, vec!["linux:http".to_string()]);

    agent
        .send(
            Message::json(
                transport::TYPE_EVENT,
                &check_event(&entity, "http", 0, 1700000010),
            )
            .unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let resolved = wait_for_event(&backend, "web05", "http", |e| e.check.status == 0).await;
    assert!(resolved.silenced.is_empty());
    assert!(backend
        .store()
        .get_silenced("default", "linux:http")
        .await
        .unwrap()
        .is_none());

    agent.close().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn handler_set_cycle_runs_each_unique_handler_once() {
    let backend = started_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let store = backend.store();

    // S = [A, B, set(C, D)] with C = set(A): dispatch set {A, B, D}
    // exactly once each despite the cycle back to A.
    let marker = |name: &str| dir.path().join(name);
    for name in ["A", "B", "D"] {
        store
            .update_handler(&Handler {
                metadata: ObjectMeta::namespaced("default", name),
                type_: HandlerType::Pipe,
                command: format!("echo ran >> {}", marker(name).display()),
                timeout: 5,
                ..Handler::default()
            })
            .await
            .unwrap();
    }
    store
        .update_handler(&Handler {
            metadata: ObjectMeta::namespaced("default", "C"),
            type_: HandlerType::Set,
            handlers: vec!["A".to_string()],
            ..Handler::default()
        })
        .await
        .unwrap();
    store
        .update_handler(&Handler {
            metadata: ObjectMeta::namespaced("default", "inner"),
            type_: HandlerType::Set,
            handlers: vec!["C".to_string(), "D".to_string()],
            ..Handler::default()
        })
        .await
        .unwrap();
    store
        .update_handler(&Handler {
            metadata: ObjectMeta::namespaced("default", "S"),
            type_: HandlerType::Set,
            handlers: vec!["A".to_string(), "B".to_string(), "inner".to_string()],
            ..Handler::default()
        })
        .await
        .unwrap();

    let entity = agent_entity("web06", &["linux"]);
    let mut agent = connected_agent(&backend, &entity).await;
    let mut event = check_event(&entity, "http", 2, 1700000000);
    event.check.handlers = vec!["S".to_string()];
    agent
        .send(
            Message::json(transport::TYPE_EVENT, &event).unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    // Each leaf handler appends exactly one line.
    for name in ["A", "B", "D"] {
        let path = marker(name);
        let mut lines = 0;
        for _ in 0..200 {
            lines = std::fs::read_to_string(&path)
                .map(|s| s.lines().count())
                .unwrap_or(0);
            if lines > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(lines, 1, "handler {name} ran {lines} times");
    }

    agent.close().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn loaders_resolve_through_the_running_backend() {
    let backend = started_backend().await;
    let entity = agent_entity("web07", &["linux"]);
    let mut agent = connected_agent(&backend, &entity).await;
    agent
        .send(
            Message::json(
                transport::TYPE_EVENT,
                &check_event(&entity, "http", 1, 1700000000),
            )
            .unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    wait_for_event(&backend, "web07", "http", |e| e.check.status == 1).await;

    let loaders = backend.loaders();
    let entities = loaders.entities("default").await.unwrap();
    assert!(entities.iter().any(|e| e.metadata.name == "web07"));
    let events = loaders.events("default", "web07").await.unwrap();
    assert_eq!(events.len(), 1);

    // Direct store listing agrees with the loader view.
    let mut pred = SelectionPredicate::default();
    let direct = backend
        .event_store()
        .list_events_by_entity("default", "web07", &mut pred)
        .await
        .unwrap();
    assert_eq!(direct.len(), events.len());

    agent.close().await;
    backend.shutdown().await;
}
