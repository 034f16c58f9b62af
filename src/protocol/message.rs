//! Frame bodies and the reserved core RPCs.
//!
//! UPDATE bodies are the payload value itself and FINISH bodies are an
//! [`RpcResult`](crate::RpcResult); only CALL and the core requests need
//! dedicated structs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix reserved for RPCs served by the bus server itself.
pub const CORE_PREFIX: &str = "core.";

/// Register a handler of the calling session.
pub const CORE_NEW_RPC: &str = "core.new_rpc";

/// Remove a handler of the calling session.
pub const CORE_UNREGISTER_RPC: &str = "core.unregister_rpc";

/// Send the arguments to every connected session as a broadcast message.
pub const CORE_BROADCAST: &str = "core.broadcast";

/// Snapshot of the registry: name to priorities in dispatch order.
pub const CORE_LIST_RPCS: &str = "core.list_rpcs";

/// Body of a CALL frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Name of the called RPC.
    pub name: String,
    /// Handler the call is addressed to, set by the bus server when it
    /// forwards a call to the session that registered it.
    #[serde(default)]
    pub handler_id: Option<u64>,
    /// Call arguments.
    pub args: Value,
}

/// Arguments of `core.new_rpc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRpcRequest {
    pub name: String,
    pub priority: i64,
    /// Allocated by the registering session before the request is sent.
    pub handler_id: u64,
}

/// Arguments of `core.unregister_rpc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterRpcRequest {
    pub handler_id: u64,
}

/// True for names served by the bus server itself.
pub fn is_core_rpc(name: &str) -> bool {
    name.starts_with(CORE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use serde_json::json;

    #[test]
    fn test_call_request_without_handler_id() {
        let request = CallRequest {
            name: "test.test".into(),
            handler_id: None,
            args: json!(null),
        };
        let bytes = MsgPackCodec::encode(&request).unwrap();
        let decoded: CallRequest = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_core_prefix() {
        assert!(is_core_rpc(CORE_NEW_RPC));
        assert!(is_core_rpc(CORE_LIST_RPCS));
        assert!(!is_core_rpc("test.core"));
    }
}
