//! Transport error types.

use thiserror::Error;

/// Maximum frame size accepted on the wire (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures on the agent/backend message channel.
///
/// Every variant except `InvalidMessage` is fatal to the session; the
/// agent is expected to reconnect and keepalive expiry covers the case
/// where it does not.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A frame length exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Claimed or actual frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A frame that could not be decoded into a message.
    #[error("invalid message frame: {0}")]
    InvalidMessage(String),

    /// The underlying stream failed.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// A send did not drain within the write timeout.
    #[error("send timed out after {0:?}")]
    SendTimeout(std::time::Duration),
}

impl TransportError {
    /// Whether the session must be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidMessage(_))
    }
}
