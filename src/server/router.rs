//! Call routing.
//!
//! Every CALL a connection issues gets its own routing task. Core RPCs are
//! answered by the server; anything else walks the registry snapshot for the
//! name, forwarding the call to one handler at a time until one of them
//! finishes with something other than "not handled".

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::connection::{CallerSignal, Connection, HandlerSignal};
use super::registry::Target;
use super::ServerState;
use crate::codec::{from_payload, to_payload};
use crate::protocol::{
    is_core_rpc, CallRequest, Frame, FrameKind, Header, NewRpcRequest, UnregisterRpcRequest,
    CORE_BROADCAST, CORE_LIST_RPCS, CORE_NEW_RPC, CORE_PREFIX, CORE_UNREGISTER_RPC,
};
use crate::result::{RpcErrorKind, RpcResult};

/// Outcome of offering a call to one handler.
#[derive(Debug)]
enum Verdict {
    Handled(RpcResult),
    NotHandled,
}

/// Route one call from `caller` and finish it.
pub(crate) async fn route_call(
    state: Arc<ServerState>,
    caller: Arc<Connection>,
    call_id: u64,
    request: CallRequest,
    mut signals: mpsc::UnboundedReceiver<CallerSignal>,
) {
    let result = if is_core_rpc(&request.name) {
        core_call(&state, &caller, &request).await
    } else {
        dispatch(&state, &caller, call_id, &request, &mut signals).await
    };

    caller.finish_inbound(call_id);
    match Frame::with_body(FrameKind::Finish, call_id, &result) {
        Ok(frame) => {
            if caller.writer().send(frame).await.is_err() {
                tracing::trace!(
                    "Connection {} gone before result of call {}",
                    caller.id(),
                    call_id
                );
            }
        }
        Err(e) => tracing::error!("Cannot encode result of call {}: {}", call_id, e),
    }
}

async fn dispatch(
    state: &Arc<ServerState>,
    caller: &Arc<Connection>,
    call_id: u64,
    request: &CallRequest,
    signals: &mut mpsc::UnboundedReceiver<CallerSignal>,
) -> RpcResult {
    let candidates = state.registry.candidates(&request.name);
    if candidates.is_empty() {
        tracing::debug!("No handler registered for {}", request.name);
        return RpcResult::err(
            RpcErrorKind::UnknownRpc,
            Value::String(format!("no handler registered for {}", request.name)),
        );
    }

    let mut cancelled = false;
    let mut stale_acks = 0;
    for target in candidates {
        if cancelled {
            break;
        }
        let handler = match state.connection(target.conn_id) {
            Some(conn) => conn,
            None => continue,
        };

        let hop = Hop {
            caller,
            call_id,
            handler: &handler,
            target,
        };
        match forward(hop, request, signals, &mut cancelled, &mut stale_acks).await {
            Verdict::Handled(result) => return result,
            Verdict::NotHandled => {
                tracing::trace!(
                    "Handler {} on connection {} declined {}",
                    target.handler_id,
                    target.conn_id,
                    request.name
                );
            }
        }
    }

    RpcResult::not_handled()
}

/// One handler a call is offered to.
struct Hop<'a> {
    caller: &'a Arc<Connection>,
    call_id: u64,
    handler: &'a Arc<Connection>,
    target: Target,
}

/// Offer the call to one handler and relay its traffic until it finishes.
///
/// Updates are relayed as they come, even from a handler that ends up
/// declining. The caller acknowledges each of them, so `stale_acks` counts
/// the ACKs still owed for earlier hops; those are swallowed instead of
/// crediting this handler's window.
async fn forward(
    hop: Hop<'_>,
    request: &CallRequest,
    signals: &mut mpsc::UnboundedReceiver<CallerSignal>,
    cancelled: &mut bool,
    stale_acks: &mut usize,
) -> Verdict {
    let Hop {
        caller,
        call_id,
        handler,
        target,
    } = hop;

    let (hop_id, mut events) = match handler.open_forward() {
        Some(hop) => hop,
        None => return Verdict::NotHandled,
    };

    let forwarded = CallRequest {
        name: request.name.clone(),
        handler_id: Some(target.handler_id),
        args: request.args.clone(),
    };
    let sent = match Frame::with_body(FrameKind::Call, hop_id, &forwarded) {
        Ok(frame) => handler.writer().send(frame).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        tracing::debug!("Cannot forward to connection {}: {}", handler.id(), e);
        handler.close_forward(hop_id);
        return Verdict::NotHandled;
    }

    let mut unacked = 0usize;
    let verdict = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(HandlerSignal::Update(payload)) => {
                    let header = Header::new(FrameKind::Update, call_id, payload.len() as u32);
                    if caller.writer().send(Frame::new(header, payload)).await.is_err() {
                        handler.signal(FrameKind::Cancel, hop_id);
                        *cancelled = true;
                        break Verdict::Handled(RpcResult::disconnected("caller disconnected"));
                    }
                    unacked += 1;
                }
                Some(HandlerSignal::Finish(result)) => {
                    if result.is_not_handled() {
                        break Verdict::NotHandled;
                    }
                    break Verdict::Handled(result);
                }
                None => {
                    tracing::debug!(
                        "Connection {} went away while serving call {}",
                        handler.id(),
                        call_id
                    );
                    break Verdict::Handled(RpcResult::disconnected("handler session disconnected"));
                }
            },

            signal = signals.recv() => match signal {
                Some(CallerSignal::Ack) => {
                    if *stale_acks > 0 {
                        *stale_acks -= 1;
                    } else if unacked > 0 {
                        unacked -= 1;
                        handler.signal(FrameKind::Ack, hop_id);
                    }
                }
                Some(CallerSignal::Cancel) => {
                    *cancelled = true;
                    handler.signal(FrameKind::Cancel, hop_id);
                }
                None => {
                    // the caller's connection closed
                    *cancelled = true;
                    handler.signal(FrameKind::Cancel, hop_id);
                    break Verdict::Handled(RpcResult::disconnected("caller disconnected"));
                }
            },
        }
    };

    handler.close_forward(hop_id);
    *stale_acks += unacked;
    verdict
}

/// Answer an RPC served by the server itself.
async fn core_call(state: &ServerState, caller: &Connection, request: &CallRequest) -> RpcResult {
    match request.name.as_str() {
        CORE_NEW_RPC => {
            let args: NewRpcRequest = match from_payload(request.args.clone()) {
                Ok(a) => a,
                Err(e) => return invalid_args(e.to_string()),
            };
            if is_core_rpc(&args.name) {
                return invalid_args(format!("names under {} are reserved", CORE_PREFIX));
            }

            state.registry.insert(
                &args.name,
                args.priority,
                Target {
                    conn_id: caller.id(),
                    handler_id: args.handler_id,
                },
            );
            tracing::debug!(
                "Connection {} registered {} (priority {}, handler {})",
                caller.id(),
                args.name,
                args.priority,
                args.handler_id
            );
            RpcResult::ok(Value::Null)
        }

        CORE_UNREGISTER_RPC => {
            let args: UnregisterRpcRequest = match from_payload(request.args.clone()) {
                Ok(a) => a,
                Err(e) => return invalid_args(e.to_string()),
            };
            let target = Target {
                conn_id: caller.id(),
                handler_id: args.handler_id,
            };
            if state.registry.remove(target) {
                RpcResult::ok(Value::Null)
            } else {
                RpcResult::err(
                    RpcErrorKind::UnknownRpc,
                    Value::String(format!("no handler {} on this session", args.handler_id)),
                )
            }
        }

        CORE_BROADCAST => match Frame::with_body(FrameKind::Broadcast, 0, &request.args) {
            Ok(frame) => {
                let reached = state.broadcast(frame).await;
                tracing::debug!(
                    "Connection {} broadcast to {} sessions",
                    caller.id(),
                    reached
                );
                RpcResult::ok(Value::Null)
            }
            Err(e) => RpcResult::err(RpcErrorKind::Internal, Value::String(e.to_string())),
        },

        CORE_LIST_RPCS => match to_payload(&state.registry.list()) {
            Ok(list) => RpcResult::ok(list),
            Err(e) => RpcResult::err(RpcErrorKind::Internal, Value::String(e.to_string())),
        },

        other => RpcResult::err(
            RpcErrorKind::UnknownRpc,
            Value::String(format!("no core rpc named {}", other)),
        ),
    }
}

fn invalid_args(message: String) -> RpcResult {
    RpcResult::err(RpcErrorKind::InvalidArgs, Value::String(message))
}
