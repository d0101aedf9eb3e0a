//! Length-prefixed message codec for the agent protocol.
//!
//! Each frame carries one typed message:
//!
//! ```text
//! +---------------------+------------------+--------------+----------+
//! | Frame len (4B, BE)  | Type len (2B,BE) | Type (UTF-8) | Payload  |
//! +---------------------+------------------+--------------+----------+
//! ```
//!
//! The frame length covers everything after the 4-byte prefix and is
//! validated against [`MAX_FRAME_SIZE`] BEFORE any allocation, so a
//! hostile length prefix cannot exhaust memory. Empty payloads are valid
//! (`ping`/`pong` carry none).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{TransportError, TransportResult, MAX_FRAME_SIZE};
use super::Message;

/// Length of the frame header (u32 frame length).
const FRAME_HEADER_LEN: usize = 4;

/// Length of the message type header (u16 type length).
const TYPE_HEADER_LEN: usize = 2;

/// Codec turning a byte stream into [`Message`]s, used with
/// [`tokio_util::codec::Framed`].
///
/// Frames are at most `max_frame_size` bytes after the length prefix,
/// and the type header always holds a valid UTF-8 message type.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    /// Codec with the protocol-wide frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a smaller cap, for tests.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` exceeds the protocol limit.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(
            max_size <= MAX_FRAME_SIZE,
            "max_size {max_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max_size,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> TransportResult<Option<Message>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // Validate the claimed length before reserving or splitting.
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_LEN + frame_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let mut frame = src.split_to(frame_len);

        if frame.len() < TYPE_HEADER_LEN {
            return Err(TransportError::InvalidMessage(
                "frame shorter than type header".to_string(),
            ));
        }
        let type_len = frame.get_u16() as usize;
        if frame.len() < type_len {
            return Err(TransportError::InvalidMessage(format!(
                "type length {type_len} exceeds frame remainder {}",
                frame.len()
            )));
        }
        let type_bytes = frame.split_to(type_len);
        let type_ = std::str::from_utf8(&type_bytes)
            .map_err(|_| TransportError::InvalidMessage("message type is not UTF-8".to_string()))?
            .to_string();

        Ok(Some(Message {
            type_,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> TransportResult<()> {
        let frame_len = TYPE_HEADER_LEN + msg.type_.len() + msg.payload.len();
        if frame_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }
        if msg.type_.len() > usize::from(u16::MAX) {
            return Err(TransportError::InvalidMessage(
                "message type too long".to_string(),
            ));
        }

        dst.reserve(FRAME_HEADER_LEN + frame_len);
        #[allow(clippy::cast_possible_truncation)] // validated against the frame cap
        dst.put_u32(frame_len as u32);
        #[allow(clippy::cast_possible_truncation)] // validated against u16::MAX
        dst.put_u16(msg.type_.len() as u16);
        dst.extend_from_slice(msg.type_.as_bytes());
        dst.extend_from_slice(&msg.payload);
        Ok(())
    }
}
