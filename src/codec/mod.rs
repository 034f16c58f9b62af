//! Codec module - serialization of frame bodies and payload values.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` for every frame body
//!   (call requests, updates, results)
//! - [`to_payload`] / [`from_payload`] - typed values to and from the opaque
//!   JSON payloads handlers exchange
//!
//! # Example
//!
//! ```
//! use callbus::codec::{from_payload, to_payload, MsgPackCodec};
//!
//! let payload = to_payload(&("hello", 1)).unwrap();
//! let bytes = MsgPackCodec::encode(&payload).unwrap();
//! let decoded: serde_json::Value = MsgPackCodec::decode(&bytes).unwrap();
//! let typed: (String, i32) = from_payload(decoded).unwrap();
//! assert_eq!(typed, ("hello".to_string(), 1));
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Convert a typed value into a payload.
#[inline]
pub fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Convert a payload into a typed value.
#[inline]
pub fn from_payload<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}
