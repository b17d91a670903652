//! Wire frame for the control channel.
//!
//! Each frame is an 8-byte header (`type`, `link_id`, both big-endian u32)
//! followed by a payload of arbitrary length. There is no length field:
//! the control channel already delivers whole messages (see
//! [`crate::channel`]), so a frame never needs to announce its own size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Size in bytes of the fixed frame header (`type` + `link_id`).
pub const HEADER_LEN: usize = 8;

/// Recognized frame types. Any other `u32` value is logged and dropped by
/// the caller; it is not an error at the codec layer.
#[derive(TryFromPrimitive)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Server→client: a new external connection arrived, open a link.
    /// Client→server: the local dial succeeded, the link is ready.
    Open = 0,
    /// Either direction: the link has ended.
    Close = 1,
    /// Either direction: a chunk of link payload.
    Data = 2,
    /// Client→server: request a public bind on `host:port`.
    Bind = 10,
    /// Server→client: result of a `Bind` request.
    BindAck = 11,
    /// Server→client: liveness probe.
    Ping = 20,
    /// Client→server: liveness probe reply.
    Pong = 21,
}

impl FrameType {
    /// Maps a raw wire value to a known frame type, or `None` for anything
    /// the protocol does not assign a meaning to.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::try_from(value).ok()
    }
}

/// A decoded frame: its raw type word (kept even when unrecognized, so the
/// caller can log it), the link id, and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw `type` word as it appeared on the wire.
    pub raw_type: u32,
    /// Link this frame belongs to; `0` for channel-scoped frames (ping/pong).
    pub link_id: u32,
    /// Frame payload. Empty for `Close`, `Ping`, `Pong`, and `Open`.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame of a known type.
    #[must_use]
    pub fn new(frame_type: FrameType, link_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            raw_type: frame_type as u32,
            link_id,
            payload: payload.into(),
        }
    }

    /// Builds a frame with no payload.
    #[must_use]
    pub fn empty(frame_type: FrameType, link_id: u32) -> Self {
        Self::new(frame_type, link_id, Bytes::new())
    }

    /// The frame's type, or `None` if the wire value is not one the
    /// protocol recognizes.
    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u32(self.raw_type)
    }

    /// Encodes this frame as `type(4) || link_id(4) || payload`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.raw_type);
        buf.put_u32(self.link_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a single whole message into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if `bytes` is shorter than
    /// [`HEADER_LEN`]. Unrecognized `type` values are not an error here;
    /// check [`Frame::frame_type`] and drop unknown frames at the caller.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                len: bytes.len(),
                min: HEADER_LEN,
            });
        }
        let mut cursor = Cursor::new(bytes);
        let raw_type = cursor.get_u32();
        let link_id = cursor.get_u32();
        let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..]);
        Ok(Self {
            raw_type,
            link_id,
            payload,
        })
    }
}

/// Errors from [`Frame::decode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than [`HEADER_LEN`] bytes were supplied.
    #[error("frame truncated: got {len} bytes, need at least {min}")]
    Truncated {
        /// Bytes actually present.
        len: usize,
        /// Bytes required to decode the header.
        min: usize,
    },
}

/// Builds the JSON payload sent in a `BIND_ACK` frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BindAckPayload {
    /// Whether the bind succeeded.
    pub success: bool,
    /// Present only when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BindAckPayload {
    /// A successful bind acknowledgement.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed bind acknowledgement carrying `reason`.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }

    /// Serializes to the JSON bytes carried as the frame payload.
    ///
    /// # Panics
    ///
    /// Never: this type has no fields that can fail to serialize.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("BindAckPayload always serializes"))
    }
}

/// Encodes a `BIND` request payload: 2-byte big-endian port followed by the
/// UTF-8 host (no length prefix, the host is simply the rest of the bytes).
#[must_use]
pub fn encode_bind_payload(host: &str, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + host.len());
    buf.put_u16(port);
    buf.put_slice(host.as_bytes());
    buf.freeze()
}

/// Decodes a `BIND` request payload into `(host, port)`.
///
/// # Errors
///
/// Returns [`BindPayloadError::Truncated`] if fewer than 2 bytes are
/// present, or [`BindPayloadError::InvalidHost`] if the host is not UTF-8.
pub fn decode_bind_payload(payload: &[u8]) -> Result<(String, u16), BindPayloadError> {
    if payload.len() < 2 {
        return Err(BindPayloadError::Truncated);
    }
    let port = u16::from_be_bytes([payload[0], payload[1]]);
    let host = std::str::from_utf8(&payload[2..])
        .map_err(|e| BindPayloadError::InvalidHost(e.to_string()))?
        .to_string();
    Ok((host, port))
}

/// Errors from [`decode_bind_payload`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindPayloadError {
    /// Fewer than 2 bytes, not even enough for the port.
    #[error("BIND payload truncated: need at least 2 bytes for the port")]
    Truncated,
    /// The host portion is not valid UTF-8.
    #[error("BIND payload host is not valid UTF-8: {0}")]
    InvalidHost(String),
}
