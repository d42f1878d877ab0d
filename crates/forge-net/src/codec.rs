//! Binary message framing.
//!
//! Every application message on the wire is a fixed header followed by the
//! body bytes:
//!
//! ```text
//! +--------------+------------------+----------------+------------------+
//! | msg_id (2)   | body_len (4)     | route (8)      |   body           |
//! | u16 BE       | u32 BE           | u64 BE         |   body_len bytes |
//! +--------------+------------------+----------------+------------------+
//! ```
//!
//! All integers are big-endian (network byte order). `body_len` counts only the
//! body, never the 14 header bytes. `route` is a [`ConnectionId`] used by the
//! routing layer above this crate; it is zero when unused. The layout carries
//! no version field.
//!
//! The codec is stateless. Stream transports call [`WireCodec::decode`] on the
//! bytes accumulated so far, which resumes cleanly across partial reads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::guid::ConnectionId;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 14;

/// Default upper bound on a declared body length (64 KiB).
pub const DEFAULT_MAX_BODY_LEN: u32 = 65_536;

/// Fixed header preceding every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    /// Opaque application dispatch key.
    pub msg_id: u16,
    /// Length of the body that follows the header.
    pub body_len: u32,
    /// Routing identity, [`ConnectionId::NONE`] when absent.
    pub route: ConnectionId,
}

impl MessageHeader {
    fn read(bytes: &[u8]) -> Self {
        let msg_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body_len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let mut route = [0u8; 8];
        route.copy_from_slice(&bytes[6..HEADER_LEN]);
        Self {
            msg_id,
            body_len,
            route: ConnectionId(u64::from_be_bytes(route)),
        }
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.msg_id);
        out.put_u32(self.body_len);
        out.put_u64(self.route.0);
    }
}

/// Result of a successful [`WireCodec::decode`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A complete message sits at the front of the buffer.
    Frame {
        /// The decoded header.
        header: MessageHeader,
        /// The body, borrowed from the input buffer.
        body: &'a [u8],
        /// Bytes to discard from the front of the buffer (header + body).
        consumed: usize,
    },
    /// The buffer holds only part of a message.
    NeedMoreData,
}

/// Protocol violations detected while framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The declared or supplied body exceeds the configured maximum.
    #[error("body length {size} exceeds maximum {max}")]
    BodyTooLarge {
        /// The offending length.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// A complete frame was shorter than the fixed header.
    #[error("frame of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    HeaderTooShort {
        /// Length of the frame.
        len: usize,
    },

    /// A complete frame's size disagrees with its declared body length.
    #[error("declared body length {declared} but frame carries {actual} body bytes")]
    LengthMismatch {
        /// Length declared in the header.
        declared: u32,
        /// Body bytes actually present.
        actual: usize,
    },
}

impl CodecError {
    /// Stable numeric code reported to the logic thread with `RecvError`.
    pub fn code(&self) -> i32 {
        match self {
            CodecError::BodyTooLarge { .. } => 1,
            CodecError::HeaderTooShort { .. } => 2,
            CodecError::LengthMismatch { .. } => 3,
        }
    }
}

/// Encoder/decoder for the message header + body layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    max_body_len: u32,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_LEN)
    }
}

impl WireCodec {
    /// Create a codec that rejects bodies longer than `max_body_len`.
    pub fn new(max_body_len: u32) -> Self {
        Self { max_body_len }
    }

    /// The configured body limit.
    pub fn max_body_len(&self) -> u32 {
        self.max_body_len
    }

    /// Decode the first message in `buf`.
    ///
    /// `buf` holds everything received and not yet consumed. Returns
    /// [`Decoded::NeedMoreData`] until a whole message is present. An
    /// oversized declared length is reported as soon as the header is
    /// complete, without waiting for the body.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<Decoded<'a>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::NeedMoreData);
        }

        let header = MessageHeader::read(buf);
        if header.body_len > self.max_body_len {
            return Err(CodecError::BodyTooLarge {
                size: header.body_len as usize,
                max: self.max_body_len,
            });
        }

        let consumed = HEADER_LEN + header.body_len as usize;
        if buf.len() < consumed {
            return Ok(Decoded::NeedMoreData);
        }

        Ok(Decoded::Frame {
            header,
            body: &buf[HEADER_LEN..consumed],
            consumed,
        })
    }

    /// Decode a buffer that must contain exactly one message.
    ///
    /// Used by message-delimited transports, where a short or overlong frame
    /// can never be completed by later reads.
    pub fn decode_exact<'a>(&self, frame: &'a [u8]) -> Result<(MessageHeader, &'a [u8]), CodecError> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::HeaderTooShort { len: frame.len() });
        }
        match self.decode(frame)? {
            Decoded::Frame {
                header,
                body,
                consumed,
            } if consumed == frame.len() => Ok((header, body)),
            _ => Err(CodecError::LengthMismatch {
                declared: MessageHeader::read(frame).body_len,
                actual: frame.len() - HEADER_LEN,
            }),
        }
    }

    /// Encode a message into a fresh buffer.
    pub fn encode(&self, msg_id: u16, route: ConnectionId, body: &[u8]) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        self.encode_into(msg_id, route, body, &mut out)?;
        Ok(out.freeze())
    }

    /// Append an encoded message to `out`.
    ///
    /// `body_len` is always taken from `body`.
    pub fn encode_into(
        &self,
        msg_id: u16,
        route: ConnectionId,
        body: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if body.len() > self.max_body_len as usize {
            return Err(CodecError::BodyTooLarge {
                size: body.len(),
                max: self.max_body_len,
            });
        }

        let header = MessageHeader {
            msg_id,
            body_len: body.len() as u32,
            route,
        };
        out.reserve(HEADER_LEN + body.len());
        header.write(out);
        out.put_slice(body);
        Ok(())
    }
}
