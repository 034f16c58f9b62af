//! One client connection as seen by the bus server.
//!
//! A connection plays two roles. As a caller it issues calls, which the
//! server routes (`inbound`, keyed by the connection's own call ids). As a
//! handler host it receives calls the server forwards to it (`forwarded`,
//! keyed by ids the server allocates for that hop).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::router;
use super::ServerState;
use crate::protocol::{CallRequest, Frame, FrameBuffer, FrameKind, CORE_BROADCAST};
use crate::result::{RpcErrorKind, RpcResult};
use crate::writer::WriterHandle;

/// Caller-side signal for a call being routed.
#[derive(Debug)]
pub(crate) enum CallerSignal {
    Ack,
    Cancel,
}

/// Handler-side signal for a forwarded call.
#[derive(Debug)]
pub(crate) enum HandlerSignal {
    /// Encoded update body, relayed as is.
    Update(Bytes),
    Finish(RpcResult),
}

pub(crate) struct Connection {
    id: u64,
    writer: WriterHandle,
    /// Next id for calls forwarded to this connection.
    next_call_id: AtomicU64,
    inbound: Mutex<HashMap<u64, mpsc::UnboundedSender<CallerSignal>>>,
    forwarded: Mutex<HashMap<u64, mpsc::UnboundedSender<HandlerSignal>>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Connection {
    pub(crate) fn new(id: u64, writer: WriterHandle) -> Self {
        Self {
            id,
            writer,
            next_call_id: AtomicU64::new(1),
            inbound: Mutex::new(HashMap::new()),
            forwarded: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn track(&self, task: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.push(task);
        if self.is_closed() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Open a hop towards this connection's handler.
    ///
    /// `None` once the connection is closed.
    pub(crate) fn open_forward(&self) -> Option<(u64, mpsc::UnboundedReceiver<HandlerSignal>)> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.forwarded.lock().insert(call_id, tx);

        // close() sets `closed` before draining
        if self.is_closed() {
            self.forwarded.lock().remove(&call_id);
            return None;
        }
        Some((call_id, rx))
    }

    pub(crate) fn close_forward(&self, call_id: u64) {
        self.forwarded.lock().remove(&call_id);
    }

    pub(crate) fn finish_inbound(&self, call_id: u64) {
        self.inbound.lock().remove(&call_id);
    }

    /// Send CANCEL or ACK for a forwarded call.
    pub(crate) fn signal(&self, kind: FrameKind, call_id: u64) {
        let _ = self.writer.send_control(Frame::empty(kind, call_id));
    }

    /// Stop I/O and release every routed and forwarded call.
    ///
    /// Dropping the signal senders is what tells the routing tasks: a caller
    /// that went away reads as a cancel, a handler host that went away as an
    /// `Io` failure. Idempotent; returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inbound.lock().clear();
        self.forwarded.lock().clear();
        true
    }

    /// Route one inbound frame.
    fn route(self: &Arc<Self>, state: &Arc<ServerState>, frame: Frame) {
        let call_id = frame.call_id();

        match frame.kind() {
            FrameKind::Call => {
                let request = match frame.body::<CallRequest>() {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Connection {}: malformed CALL {}: {}", self.id, call_id, e);
                        let result = RpcResult::err(
                            RpcErrorKind::Internal,
                            serde_json::Value::String(e.to_string()),
                        );
                        if let Ok(frame) = Frame::with_body(FrameKind::Finish, call_id, &result) {
                            let _ = self.writer.send_control(frame);
                        }
                        return;
                    }
                };

                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut inbound = self.inbound.lock();
                    if inbound.contains_key(&call_id) {
                        tracing::warn!(
                            "Connection {}: call id {} reused while in flight, ignoring",
                            self.id,
                            call_id
                        );
                        return;
                    }
                    inbound.insert(call_id, tx);
                }

                tokio::spawn(router::route_call(
                    state.clone(),
                    self.clone(),
                    call_id,
                    request,
                    rx,
                ));
            }

            FrameKind::Cancel | FrameKind::Ack => {
                let signal = if frame.kind() == FrameKind::Cancel {
                    CallerSignal::Cancel
                } else {
                    CallerSignal::Ack
                };
                if let Some(tx) = self.inbound.lock().get(&call_id) {
                    let _ = tx.send(signal);
                }
            }

            FrameKind::Update => {
                if let Some(tx) = self.forwarded.lock().get(&call_id) {
                    let _ = tx.send(HandlerSignal::Update(frame.payload.clone()));
                }
            }

            FrameKind::Broadcast => {
                tracing::warn!(
                    "Connection {}: sessions broadcast through {}, ignoring frame",
                    self.id,
                    CORE_BROADCAST
                );
            }

            FrameKind::Finish => {
                let result = frame.body::<RpcResult>().unwrap_or_else(|e| {
                    RpcResult::err(
                        RpcErrorKind::Internal,
                        serde_json::Value::String(e.to_string()),
                    )
                });
                if let Some(tx) = self.forwarded.lock().remove(&call_id) {
                    let _ = tx.send(HandlerSignal::Finish(result));
                }
            }
        }
    }
}

/// Read frames until the connection ends, then drop it from the server.
pub(crate) async fn read_loop<R>(mut reader: R, conn: Arc<Connection>, state: Arc<ServerState>)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(state.config.max_payload_size);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Connection {}: read error: {}", conn.id, e);
                break;
            }
        };

        match frame_buffer.push(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    conn.route(&state, frame);
                }
            }
            Err(e) => {
                tracing::warn!("Connection {}: {}, closing", conn.id, e);
                break;
            }
        }
    }

    state.drop_connection(&conn);
}
