//! Protocol module - wire format, framing, and frame bodies.
//!
//! - 13-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Message bodies and reserved core RPC names

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{
    is_core_rpc, CallRequest, NewRpcRequest, UnregisterRpcRequest, CORE_BROADCAST, CORE_LIST_RPCS,
    CORE_NEW_RPC, CORE_PREFIX, CORE_UNREGISTER_RPC,
};
pub use wire_format::{FrameKind, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
