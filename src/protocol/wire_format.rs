//! Wire format encoding and decoding.
//!
//! Implements the 13-byte header format:
//! ```text
//! ┌────────┬───────────┬───────────┐
//! │ Kind   │ Call ID   │ Length    │
//! │ 1 byte │ 8 bytes   │ 4 bytes   │
//! │        │ uint64 BE │ uint32 BE │
//! └────────┴───────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The call id is always the one
//! allocated by the caller of the call the frame belongs to; the kind tells
//! the receiver whether that is itself or its peer. BROADCAST frames belong
//! to no call and carry id 0.

use crate::error::{CallbusError, Result};

/// Header size in bytes (fixed, exactly 13).
pub const HEADER_SIZE: usize = 13;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Caller → callee: start a call. Body: `CallRequest`.
    Call = 1,
    /// Callee → caller: partial result. Body: payload value.
    Update = 2,
    /// Callee → caller: terminal result. Body: `RpcResult`.
    Finish = 3,
    /// Caller → callee: cancellation request. Empty body.
    Cancel = 4,
    /// Caller → callee: one update was drained. Empty body.
    Ack = 5,
    /// Bus server → every session: a broadcast message, call id 0.
    /// Body: payload value.
    Broadcast = 6,
}

impl FrameKind {
    /// Parse a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Call),
            2 => Some(FrameKind::Update),
            3 => Some(FrameKind::Finish),
            4 => Some(FrameKind::Cancel),
            5 => Some(FrameKind::Ack),
            6 => Some(FrameKind::Broadcast),
            _ => None,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind.
    pub kind: FrameKind,
    /// Call identifier, allocated by the caller.
    pub call_id: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: FrameKind, call_id: u64, payload_length: u32) -> Self {
        Self {
            kind,
            call_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use callbus::protocol::{FrameKind, Header};
    ///
    /// let header = Header::new(FrameKind::Update, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 13);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1..9].copy_from_slice(&self.call_id.to_be_bytes());
        buf[9..13].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short and a protocol error if
    /// the kind byte is unknown.
    ///
    /// # Example
    ///
    /// ```
    /// use callbus::protocol::{FrameKind, Header};
    ///
    /// let bytes = [3, 0, 0, 0, 0, 0, 0, 0, 42, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap().unwrap();
    /// assert_eq!(header.kind, FrameKind::Finish);
    /// assert_eq!(header.call_id, 42);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| CallbusError::Protocol(format!("Unknown frame kind {}", buf[0])))?;
        let mut call_id = [0u8; 8];
        call_id.copy_from_slice(&buf[1..9]);
        Ok(Some(Self {
            kind,
            call_id: u64::from_be_bytes(call_id),
            payload_length: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
        }))
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Payload length doesn't exceed max
    /// - CANCEL and ACK frames carry no payload
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(CallbusError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if matches!(self.kind, FrameKind::Cancel | FrameKind::Ack) && self.payload_length != 0 {
            return Err(CallbusError::Protocol(format!(
                "{:?} frame must have an empty payload",
                self.kind
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let original = Header::new(FrameKind::Call, 7, 100);
        let decoded = Header::decode(&original.encode()).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(FrameKind::Ack, 0x0102030405060708, 0x090A0B0C);
        let bytes = header.encode();

        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[9..13], &[0x09, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [1u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut bytes = Header::new(FrameKind::Call, 1, 0).encode();
        bytes[0] = 0xEE;
        let err = Header::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("Unknown frame kind"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(FrameKind::Update, 1, 1_000_000);
        let result = header.validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_control_frames_are_empty() {
        assert!(Header::new(FrameKind::Cancel, 1, 0)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_ok());
        assert!(Header::new(FrameKind::Ack, 1, 3)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_err());
    }

    #[test]
    fn test_kind_from_u8() {
        for kind in [
            FrameKind::Call,
            FrameKind::Update,
            FrameKind::Finish,
            FrameKind::Cancel,
            FrameKind::Ack,
            FrameKind::Broadcast,
        ] {
            assert_eq!(FrameKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(FrameKind::from_u8(0), None);
    }
}
