//! Frame struct and frame builders.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.

use bytes::Bytes;
use serde::Serialize;

use super::wire_format::{FrameKind, Header, HEADER_SIZE};
use crate::codec::MsgPackCodec;
use crate::error::{CallbusError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Frame with a MsgPack-encoded body.
    pub fn with_body<T: Serialize>(kind: FrameKind, call_id: u64, body: &T) -> Result<Self> {
        let payload = Bytes::from(MsgPackCodec::encode(body)?);
        Ok(Self::new(
            Header::new(kind, call_id, payload.len() as u32),
            payload,
        ))
    }

    /// Frame with a MsgPack-encoded body no larger than `max_payload_size`.
    pub fn with_body_limited<T: Serialize>(
        kind: FrameKind,
        call_id: u64,
        body: &T,
        max_payload_size: u32,
    ) -> Result<Self> {
        let frame = Self::with_body(kind, call_id, body)?;
        if frame.payload.len() > max_payload_size as usize {
            return Err(CallbusError::PayloadTooLarge {
                size: frame.payload.len(),
                max: max_payload_size,
            });
        }
        Ok(frame)
    }

    /// Frame with an empty body (CANCEL, ACK).
    pub fn empty(kind: FrameKind, call_id: u64) -> Self {
        Self::new(Header::new(kind, call_id, 0), Bytes::new())
    }

    /// Decode the MsgPack body.
    pub fn body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.payload)
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    #[inline]
    pub fn call_id(&self) -> u64 {
        self.header.call_id
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total size on the wire (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use callbus::protocol::{build_frame, FrameKind, Header};
///
/// let header = Header::new(FrameKind::Update, 42, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 13 + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
