//! Terminal outcome of a call.
//!
//! An [`RpcResult`] is what a handler finishes a call with and what the
//! caller eventually gets from [`ClientContext::wait`](crate::ClientContext::wait).
//! Error details are an opaque JSON value and are relayed unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error kind carried inside a failed [`RpcResult`].
///
/// Encoded by variant, so a handler-defined code can never be read back as
/// one of the reserved kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// No handler is registered for the called name.
    UnknownRpc,
    /// Every registered handler declined the call.
    NotHandled,
    /// The handler rejected the arguments.
    InvalidArgs,
    /// The call was cut short by a transport failure or disconnect.
    Io,
    /// The handler failed or misbehaved.
    Internal,
    /// Handler-defined code.
    Custom(u32),
}

/// Error half of an [`RpcResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    /// `Some(Value::Null)` and `None` stay distinct on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_details"
    )]
    pub details: Option<Value>,
}

/// A present `details` field is `Some`, even when it holds `null`.
fn present_details<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, details: Option<Value>) -> Self {
        Self { kind, details }
    }

    /// Error with a plain message as details.
    pub fn with_message(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            details: Some(Value::String(message.into())),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{:?}: {}", self.kind, details),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for RpcError {}

/// Terminal outcome of a call: a payload or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResult {
    Ok(Value),
    Err(RpcError),
}

impl RpcResult {
    /// Successful result.
    pub fn ok(value: Value) -> Self {
        RpcResult::Ok(value)
    }

    /// Failed result with structured details.
    pub fn err(kind: RpcErrorKind, details: Value) -> Self {
        RpcResult::Err(RpcError::new(kind, Some(details)))
    }

    /// The reserved "not handled" verdict.
    pub fn not_handled() -> Self {
        RpcResult::Err(RpcError::new(RpcErrorKind::NotHandled, None))
    }

    /// Transport failure result used when a session goes away mid-call.
    pub(crate) fn disconnected(message: &str) -> Self {
        RpcResult::Err(RpcError::with_message(RpcErrorKind::Io, message))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcResult::Ok(_))
    }

    pub fn is_not_handled(&self) -> bool {
        matches!(self, RpcResult::Err(e) if e.kind == RpcErrorKind::NotHandled)
    }

    /// Convert into a std `Result`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            RpcResult::Ok(v) => Ok(v),
            RpcResult::Err(e) => Err(e),
        }
    }

    /// Payload of a successful result.
    ///
    /// # Panics
    ///
    /// Panics if the result is an error.
    pub fn unwrap(self) -> Value {
        match self {
            RpcResult::Ok(v) => v,
            RpcResult::Err(e) => panic!("called `RpcResult::unwrap()` on an error: {}", e),
        }
    }

    /// Error of a failed result.
    ///
    /// # Panics
    ///
    /// Panics if the result is a success.
    pub fn unwrap_err(self) -> RpcError {
        match self {
            RpcResult::Ok(v) => panic!("called `RpcResult::unwrap_err()` on a success: {}", v),
            RpcResult::Err(e) => e,
        }
    }
}

impl From<Result<Value, RpcError>> for RpcResult {
    fn from(result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(v) => RpcResult::Ok(v),
            Err(e) => RpcResult::Err(e),
        }
    }
}
