//! One connection to the bus server.
//!
//! A session is both a caller and a handler host. Its read loop routes every
//! inbound frame by kind and call id:
//!
//! ```text
//!                    ┌─► CALL    ─► spawn handler task (ServerContext)
//! Socket ─► Reader ──┼─► CANCEL  ─► serving call signals
//!                    ├─► ACK     ─► serving call update window
//!                    ├─► UPDATE  ─► outgoing call channel (ClientContext)
//!                    ├─► FINISH  ─► outgoing call channel, entry removed
//!                    └─► BROADCAST ─► broadcast queue
//! ```
//!
//! CALL, CANCEL and ACK come from the caller of a call and refer to calls
//! this session serves. UPDATE and FINISH come from the handler and refer to
//! calls this session issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::AbortHandle;

use super::call::{self, ClientContext, PendingCall};
use crate::backpressure::{UpdateWindow, DEFAULT_UPDATE_TIMEOUT, DEFAULT_UPDATE_WINDOW};
use crate::codec::to_payload;
use crate::error::{CallbusError, Result};
use crate::handler::{CallSignals, Handler, HandlerTable, ServerContext, ServingCall};
use crate::protocol::{
    CallRequest, Frame, FrameBuffer, FrameKind, NewRpcRequest, UnregisterRpcRequest,
    CORE_BROADCAST, CORE_NEW_RPC, CORE_UNREGISTER_RPC, DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::result::{RpcErrorKind, RpcResult};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default number of broadcast messages kept until read.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Tunables of a session.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) writer: WriterConfig,
    pub(crate) max_concurrent_handlers: usize,
    pub(crate) update_window: usize,
    pub(crate) update_timeout: Duration,
    pub(crate) max_payload_size: u32,
    pub(crate) broadcast_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            update_window: DEFAULT_UPDATE_WINDOW,
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// A handler as known to the bus server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    name: String,
    priority: i64,
    handler_id: u64,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn handler_id(&self) -> u64 {
        self.handler_id
    }
}

pub(crate) struct Session {
    writer: WriterHandle,
    config: SessionConfig,
    /// Next id for calls this session issues.
    next_call_id: AtomicU64,
    /// Calls this session issued, awaiting UPDATE/FINISH.
    calls: Mutex<HashMap<u64, PendingCall>>,
    /// Calls this session serves, receiving CANCEL/ACK.
    serving: Mutex<HashMap<u64, Arc<CallSignals>>>,
    handlers: HandlerTable,
    handler_slots: Arc<Semaphore>,
    /// Dropped on teardown so readers see the end of the queue.
    broadcast_tx: Mutex<Option<mpsc::Sender<Value>>>,
    broadcast_rx: AsyncMutex<mpsc::Receiver<Value>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Session {
    /// Start a session over a connected stream.
    pub(crate) fn for_stream<S>(stream: S, config: SessionConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));

        let session = Arc::new(Self {
            writer,
            handler_slots: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            broadcast_tx: Mutex::new(Some(broadcast_tx)),
            broadcast_rx: AsyncMutex::new(broadcast_rx),
            config,
            next_call_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            serving: Mutex::new(HashMap::new()),
            handlers: HandlerTable::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let read_task = tokio::spawn(read_loop(reader, session.clone()));
        session.track(writer_task.abort_handle());
        session.track(read_task.abort_handle());
        session
    }

    #[inline]
    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Largest frame body this session sends or accepts.
    #[inline]
    pub(crate) fn max_payload_size(&self) -> u32 {
        self.config.max_payload_size
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn track(&self, task: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.push(task);
        if self.is_closed() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    pub(crate) fn track_serving(&self, call_id: u64, signals: Arc<CallSignals>) {
        self.serving.lock().insert(call_id, signals);
    }

    pub(crate) fn forget_serving(&self, call_id: u64) {
        self.serving.lock().remove(&call_id);
    }

    /// Issue a call.
    pub(crate) async fn call(&self, name: &str, args: Value) -> Result<ClientContext> {
        if self.is_closed() {
            return Err(CallbusError::Disconnected);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let request = CallRequest {
            name: name.to_string(),
            handler_id: None,
            args,
        };
        let frame = Frame::with_body_limited(
            FrameKind::Call,
            call_id,
            &request,
            self.config.max_payload_size,
        )?;

        let (pending, ctx) = call::channel(call_id, self.writer.clone());
        self.calls.lock().insert(call_id, pending);

        // teardown sets `closed` before draining calls
        if self.is_closed() {
            self.calls.lock().remove(&call_id);
            ctx.abandon();
            return Err(CallbusError::Disconnected);
        }

        if let Err(e) = self.writer.send(frame).await {
            self.calls.lock().remove(&call_id);
            ctx.abandon();
            return Err(e);
        }

        tracing::trace!("Issued call {} to {}", call_id, name);
        Ok(ctx)
    }

    /// Register a handler with the bus server.
    pub(crate) async fn register(
        &self,
        name: &str,
        priority: i64,
        handler: Arc<dyn Handler>,
    ) -> Result<Registration> {
        let handler_id = self.handlers.insert(name, handler);
        let request = NewRpcRequest {
            name: name.to_string(),
            priority,
            handler_id,
        };

        if let Err(e) = self.core_request(CORE_NEW_RPC, &request).await {
            self.handlers.remove(handler_id);
            return Err(e);
        }

        tracing::debug!(
            "Registered {} (priority {}, handler {})",
            name,
            priority,
            handler_id
        );
        Ok(Registration {
            name: name.to_string(),
            priority,
            handler_id,
        })
    }

    /// Remove a handler. Calls it is already serving run to completion.
    pub(crate) async fn unregister(&self, registration: &Registration) -> Result<()> {
        self.handlers.remove(registration.handler_id);
        let request = UnregisterRpcRequest {
            handler_id: registration.handler_id,
        };
        self.core_request(CORE_UNREGISTER_RPC, &request).await?;

        tracing::debug!(
            "Unregistered {} (handler {})",
            registration.name,
            registration.handler_id
        );
        Ok(())
    }

    /// Ask the bus server to send `message` to every session, this one
    /// included. Returns once the server sent it.
    pub(crate) async fn broadcast(&self, message: Value) -> Result<()> {
        self.core_request(CORE_BROADCAST, &message).await
    }

    /// Next broadcast message; `None` once the session closed and the queue
    /// is drained.
    pub(crate) async fn recv_broadcast(&self) -> Option<Value> {
        self.broadcast_rx.lock().await.recv().await
    }

    /// Next broadcast message if one is queued.
    pub(crate) fn try_recv_broadcast(&self) -> Option<Value> {
        self.broadcast_rx.try_lock().ok()?.try_recv().ok()
    }

    async fn core_request<T: serde::Serialize>(&self, name: &str, request: &T) -> Result<()> {
        let mut ctx = self.call(name, to_payload(request)?).await?;
        match ctx.wait().await {
            RpcResult::Ok(_) => Ok(()),
            RpcResult::Err(e) if e.kind == RpcErrorKind::Io => Err(CallbusError::Disconnected),
            RpcResult::Err(e) => Err(CallbusError::Rejected(e)),
        }
    }

    /// Route one inbound frame.
    fn route(self: &Arc<Self>, frame: Frame) {
        let call_id = frame.call_id();

        match frame.kind() {
            FrameKind::Call => match frame.body::<CallRequest>() {
                Ok(request) => self.dispatch(call_id, request),
                Err(e) => {
                    tracing::warn!("Malformed CALL {}: {}", call_id, e);
                    let result = RpcResult::err(RpcErrorKind::Internal, Value::String(e.to_string()));
                    if let Ok(frame) = Frame::with_body(FrameKind::Finish, call_id, &result) {
                        let _ = self.writer.send_control(frame);
                    }
                }
            },

            FrameKind::Cancel => {
                if let Some(signals) = self.serving.lock().get(&call_id) {
                    tracing::debug!("Call {} cancelled by caller", call_id);
                    signals.cancel();
                }
            }

            FrameKind::Ack => {
                if let Some(signals) = self.serving.lock().get(&call_id) {
                    signals.ack();
                }
            }

            FrameKind::Update => {
                let payload: Value = match frame.body() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable update for call {}: {}", call_id, e);
                        return;
                    }
                };
                let mut calls = self.calls.lock();
                match calls.get(&call_id) {
                    Some(call) => {
                        if !call.update(payload) {
                            calls.remove(&call_id);
                        }
                    }
                    None => tracing::trace!("Update for unknown call {}", call_id),
                }
            }

            FrameKind::Finish => {
                let result = frame.body::<RpcResult>().unwrap_or_else(|e| {
                    RpcResult::err(RpcErrorKind::Internal, Value::String(e.to_string()))
                });
                let call = self.calls.lock().remove(&call_id);
                match call {
                    Some(call) => call.finish(result),
                    None => tracing::trace!("Result for unknown call {}", call_id),
                }
            }

            FrameKind::Broadcast => {
                let message: Value = match frame.body() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable broadcast: {}", e);
                        return;
                    }
                };
                if let Some(tx) = self.broadcast_tx.lock().as_ref() {
                    if tx.try_send(message).is_err() {
                        tracing::warn!("Broadcast queue full, dropping message");
                    }
                }
            }
        }
    }

    /// Run the handler a CALL is addressed to on its own task.
    fn dispatch(self: &Arc<Self>, call_id: u64, request: CallRequest) {
        let signals = Arc::new(CallSignals::new(UpdateWindow::new(
            self.config.update_window,
            self.config.update_timeout,
        )));
        self.track_serving(call_id, signals.clone());

        let call = Arc::new(ServingCall::new(
            call_id,
            request.name.clone(),
            signals,
            self.clone(),
        ));
        let ctx = ServerContext::new(call);
        let handler = request
            .handler_id
            .and_then(|id| self.handlers.get(id, &request.name));
        let permit = self.handler_slots.clone().try_acquire_owned();

        tokio::spawn(async move {
            let guard = ctx.serving_call();

            let (handler, _permit) = match (handler, permit) {
                (None, _) => {
                    tracing::debug!("No local handler for {}, declining", request.name);
                    let _ = ctx.not_handled().await;
                    return;
                }
                (Some(_), Err(_)) => {
                    tracing::warn!(
                        "Handler capacity reached, failing call {} to {}",
                        call_id,
                        request.name
                    );
                    let _ = ctx
                        .error(
                            RpcErrorKind::Internal,
                            Value::String("handler capacity reached".into()),
                        )
                        .await;
                    return;
                }
                (Some(handler), Ok(permit)) => (handler, permit),
            };

            if let Err(e) = handler.call(request.args, ctx).await {
                tracing::error!("Handler error for {}: {}", request.name, e);
                if !guard.is_finished() {
                    let result = RpcResult::err(RpcErrorKind::Internal, Value::String(e.to_string()));
                    let _ = guard.finish(result).await;
                }
            }
        });
    }

    /// Close the session: stop I/O, fail outgoing calls, cancel served ones.
    ///
    /// Idempotent.
    pub(crate) fn teardown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Session closing: {}", reason);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let calls: Vec<PendingCall> = self.calls.lock().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.finish(RpcResult::disconnected(reason));
        }

        let serving: Vec<Arc<CallSignals>> =
            self.serving.lock().drain().map(|(_, s)| s).collect();
        for signals in serving {
            signals.cancel();
        }

        self.handlers.clear();
        self.broadcast_tx.lock().take();
    }
}

async fn read_loop<R>(mut reader: R, session: Arc<Session>)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(session.config.max_payload_size);
    let mut buf = vec![0u8; 64 * 1024];

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "connection closed by bus server".to_string(),
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Read loop error: {}", e);
                break e.to_string();
            }
        };

        match frame_buffer.push(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    session.route(frame);
                }
            }
            Err(e) => {
                tracing::error!("Read loop error: {}", e);
                break e.to_string();
            }
        }
    };

    session.teardown(&reason);
}
