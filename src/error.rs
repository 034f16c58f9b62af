//! Error types for callbus.
//!
//! [`CallbusError`] covers transport failures and misuse of a call past its
//! terminal state. Routing outcomes and handler-raised errors are not errors
//! at this level: they travel inside [`RpcResult`](crate::RpcResult).

use thiserror::Error;

/// Main error type for all callbus operations.
#[derive(Debug, Error)]
pub enum CallbusError {
    /// I/O error during socket operations (connect, read, write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (payload values, control line).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame, unknown kind, oversized payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame body exceeds the session's maximum payload size. Nothing was
    /// sent.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// The session is closed; no new calls can be issued on it.
    #[error("Session disconnected")]
    Disconnected,

    /// `emit_update` or `finish` after the call was finished.
    #[error("Call already finished")]
    AlreadyFinished,

    /// The caller cancelled or went away; the handler should stop and finish.
    #[error("Call cancelled or done")]
    CallDone,

    /// The consumer did not drain updates within the backpressure timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The bus server refused a registration or unregistration.
    #[error("Request rejected: {0}")]
    Rejected(crate::result::RpcError),
}

impl CallbusError {
    /// Small status code for the binding boundary.
    ///
    /// `0` is reserved for success and never returned here.
    pub fn status_code(&self) -> i32 {
        match self {
            CallbusError::Io(_) | CallbusError::Disconnected => 1,
            CallbusError::CallDone => 2,
            CallbusError::AlreadyFinished => 3,
            CallbusError::BackpressureTimeout => 4,
            CallbusError::Json(_)
            | CallbusError::MsgPackEncode(_)
            | CallbusError::MsgPackDecode(_) => 5,
            CallbusError::Protocol(_) => 6,
            CallbusError::Rejected(_) => 7,
            CallbusError::PayloadTooLarge { .. } => 8,
        }
    }
}

/// Result type alias using CallbusError.
pub type Result<T> = std::result::Result<T, CallbusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_from_success() {
        let errors = [
            CallbusError::Disconnected,
            CallbusError::CallDone,
            CallbusError::AlreadyFinished,
            CallbusError::BackpressureTimeout,
            CallbusError::Protocol("bad".into()),
            CallbusError::PayloadTooLarge { size: 2, max: 1 },
        ];
        for e in &errors {
            assert_ne!(e.status_code(), 0);
        }
    }

    #[test]
    fn test_io_and_disconnect_share_status() {
        let io = CallbusError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(io.status_code(), CallbusError::Disconnected.status_code());
    }
}
