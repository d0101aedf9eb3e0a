//! Framed bidirectional message channel between agent and backend.
//!
//! A transport is a single logical stream of typed messages in both
//! directions, with ordered delivery within one session and no guarantees
//! across reconnects. The TCP implementation frames messages with
//! [`MessageCodec`]; sessions are the single reader and single writer of
//! their transport.
//!
//! Liveness: on an idle connection the session sends a [`TYPE_PING`] at
//! half the write timeout; a peer that stays silent for a full write
//! timeout is considered gone. A send that cannot drain within the write
//! timeout is fatal to the session.

pub mod error;
pub mod framing;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub use error::{TransportError, TransportResult, MAX_FRAME_SIZE};
pub use framing::MessageCodec;

/// Check request published to an agent.
pub const TYPE_CHECK_REQUEST: &str = "check_request";
/// Check execution result from an agent.
pub const TYPE_EVENT: &str = "event";
/// Agent liveness signal.
pub const TYPE_KEEPALIVE: &str = "keepalive";
/// Agent handshake message carrying its entity document.
pub const TYPE_ENTITY_CONFIG: &str = "entity_config";
/// Liveness probe.
pub const TYPE_PING: &str = "ping";
/// Liveness probe response.
pub const TYPE_PONG: &str = "pong";

/// One typed message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type tag.
    pub type_: String,
    /// Raw payload bytes (a versioned JSON document for data messages).
    pub payload: Bytes,
}

impl Message {
    /// Creates a message from raw payload bytes.
    pub fn new(type_: impl Into<String>, payload: Bytes) -> Self {
        Self {
            type_: type_.into(),
            payload,
        }
    }

    /// Creates a message with a JSON-serialized payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidMessage`] if serialization fails.
    pub fn json<T: Serialize>(type_: impl Into<String>, payload: &T) -> TransportResult<Self> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        Ok(Self::new(type_, Bytes::from(bytes)))
    }
}

/// The session-facing transport contract.
///
/// Implementations carry the framing; the session carries the protocol
/// (handshake ordering, ping cadence, drain-on-close).
#[async_trait]
pub trait Transport: Send {
    /// Sends one message, failing if it cannot drain within `timeout`.
    async fn send(&mut self, msg: Message, timeout: Duration) -> TransportResult<()>;

    /// Receives the next message; `Ok(None)` means the peer closed.
    async fn recv(&mut self) -> TransportResult<Option<Message>>;

    /// Closes the channel; subsequent operations fail.
    async fn close(&mut self);
}

/// TCP transport used by agentd sessions.
pub struct TcpTransport {
    framed: Framed<TcpStream, MessageCodec>,
}

impl TcpTransport {
    /// Wraps an accepted stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec::new()),
        }
    }

    /// The peer address, for log fields.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.framed.get_ref().peer_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, msg: Message, timeout: Duration) -> TransportResult<()> {
        match tokio::time::timeout(timeout, self.framed.send(msg)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::SendTimeout(timeout)),
        }
    }

    async fn recv(&mut self) -> TransportResult<Option<Message>> {
        match self.framed.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        let _ = self.framed.close().await;
    }
}
