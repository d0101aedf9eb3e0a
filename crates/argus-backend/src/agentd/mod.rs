//! Agentd: the agent listener.
//!
//! Binds the agent TCP endpoint, wraps each accepted connection in a
//! [`TcpTransport`], and drives an [`AgentSession`] per connection.
//! Session failures never propagate: the agent is expected to reconnect,
//! and keepalive expiry covers the case where it does not.

pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_core::bus::MessageBus;
use argus_core::store::Store;

use crate::daemon::{Daemon, DaemonError};
use crate::eventd::EventdHandle;
use crate::metrics::BackendMetrics;
use crate::transport::TcpTransport;

pub use session::{AgentSession, OutboundQueue, SessionConfig, SessionError, SessionState};

/// The agent listener daemon.
pub struct Agentd {
    listen_addr: String,
    session_config: SessionConfig,
    store: Arc<dyn Store>,
    bus: Arc<MessageBus>,
    eventd: EventdHandle,
    metrics: BackendMetrics,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl Agentd {
    /// Creates the daemon; the socket binds at [`Daemon::start`].
    #[must_use]
    pub fn new(
        listen_addr: String,
        session_config: SessionConfig,
        store: Arc<dyn Store>,
        bus: Arc<MessageBus>,
        eventd: EventdHandle,
        metrics: BackendMetrics,
    ) -> Self {
        Self {
            listen_addr,
            session_config,
            store,
            bus,
            eventd,
            metrics,
            cancel: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    /// The bound address, once started. Useful with port 0 in tests.
    #[must_use]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Daemon for Agentd {
    fn name(&self) -> &'static str {
        "agentd"
    }

    async fn start(&mut self) -> Result<(), DaemonError> {
        let listener =
            TcpListener::bind(&self.listen_addr)
                .await
                .map_err(|err| DaemonError::StartFailed {
                    daemon: "agentd",
                    reason: format!("bind {} failed: {err}", self.listen_addr),
                })?;
        self.local_addr = listener.local_addr().ok();
        info!(addr = %self.listen_addr, "agentd listening");

        let session_config = self.session_config.clone();
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let eventd = self.eventd.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    () = cancel.cancelled() => break,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "agent connected");
                        let session = AgentSession::new(
                            TcpTransport::new(stream),
                            session_config.clone(),
                            Arc::clone(&store),
                            Arc::clone(&bus),
                            eventd.clone(),
                            metrics.clone(),
                            cancel.child_token(),
                        );
                        tokio::spawn(async move {
                            let id = session.id().to_string();
                            if let Err(err) = session.run().await {
                                debug!(session = %id, error = %err, "session ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
            debug!("agentd accept loop exited");
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("agentd stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use argus_core::entity::{Entity, EntityClass};
    use argus_core::meta::ObjectMeta;
    use argus_core::store::EntityStore;
    use argus_core::EventStore;

    use crate::eventd::Eventd;
    use crate::metrics::MetricsRegistry;
    use crate::store::{MemoryEventStore, MemoryStore};
    use crate::transport::{self, Message, TcpTransport, Transport};

    #[tokio::test]
    async fn accepts_connections_and_runs_sessions() {
        let store = Arc::new(MemoryStore::new());
        let event_store = Arc::new(MemoryEventStore::new());
        let bus = Arc::new(MessageBus::new(64));
        let metrics = MetricsRegistry::new().unwrap().backend_metrics();

        let mut eventd = Eventd::new(
            1,
            16,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&event_store) as Arc<dyn EventStore>,
            Arc::clone(&bus),
            metrics.clone(),
            None,
        );
        eventd.start().await.unwrap();

        let mut agentd = Agentd::new(
            "127.0.0.1:0".to_string(),
            SessionConfig::default(),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bus),
            eventd.handle(),
            metrics,
        );
        agentd.start().await.unwrap();
        let addr = agentd.local_addr().unwrap();

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut agent = TcpTransport::new(stream);
        let entity = Entity {
            metadata: ObjectMeta::namespaced("default", "web01"),
            entity_class: EntityClass::Agent,
            subscriptions: vec!["linux".to_string()],
            last_seen: 0,
        };
        agent
            .send(
                Message::json(transport::TYPE_ENTITY_CONFIG, &entity).unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if store.get_entity("default", "web01").await.unwrap().is_some() {
                agentd.stop().await.unwrap();
                eventd.stop().await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entity never created from TCP handshake");
    }
}
