//! Serving side of a call.
//!
//! A handler gets a [`ServerContext`] for every call routed to it:
//! - `emit_update` - stream a partial result (flow-controlled)
//! - `finish` / `ok` / `error` - send the terminal result, exactly once
//! - `not_handled` - decline so the next handler in line gets the call
//! - `call_rpc` - issue a nested call on the same session
//!
//! # Example
//!
//! ```ignore
//! async fn count(n: u64, ctx: ServerContext) -> HandlerResult {
//!     for i in 0..n {
//!         if ctx.is_cancelled() {
//!             break;
//!         }
//!         ctx.emit(&serde_json::json!({ "count": i })).await?;
//!     }
//!     ctx.ok(&serde_json::json!({})).await
//! }
//! ```
//!
//! A context that is dropped without finishing finishes its call with an
//! `Internal` error, so a caller never waits on a handler that forgot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::backpressure::UpdateWindow;
use crate::client::session::Session;
use crate::client::{ClientContext, ThinClient};
use crate::codec::to_payload;
use crate::error::{CallbusError, Result};
use crate::protocol::{Frame, FrameKind};
use crate::result::{RpcErrorKind, RpcResult};

/// Signals the read loop delivers to a call being served.
#[derive(Debug)]
pub(crate) struct CallSignals {
    cancelled: AtomicBool,
    window: UpdateWindow,
}

impl CallSignals {
    pub(crate) fn new(window: UpdateWindow) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            window,
        }
    }

    /// CANCEL arrived or the session is going away.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.window.close();
    }

    /// ACK arrived: the consumer drained one update.
    pub(crate) fn ack(&self) {
        self.window.release();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// State behind a [`ServerContext`], also held by the dispatch task.
pub(crate) struct ServingCall {
    call_id: u64,
    name: String,
    signals: Arc<CallSignals>,
    finished: AtomicBool,
    session: Arc<Session>,
}

impl ServingCall {
    pub(crate) fn new(
        call_id: u64,
        name: String,
        signals: Arc<CallSignals>,
        session: Arc<Session>,
    ) -> Self {
        Self {
            call_id,
            name,
            signals,
            finished: AtomicBool::new(false),
            session,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    async fn emit_update(&self, payload: Value) -> Result<()> {
        if self.is_finished() {
            return Err(CallbusError::AlreadyFinished);
        }
        if self.signals.is_cancelled() {
            return Err(CallbusError::CallDone);
        }
        let frame = Frame::with_body_limited(
            FrameKind::Update,
            self.call_id,
            &payload,
            self.session.max_payload_size(),
        )?;

        if let Err(e) = self.signals.window.reserve().await {
            if self.is_finished() {
                return Err(CallbusError::AlreadyFinished);
            }
            return Err(e);
        }

        self.session.writer().send(frame).await
    }

    /// Send the terminal result.
    ///
    /// A result too large to send leaves the call unfinished.
    pub(crate) async fn finish(&self, result: RpcResult) -> Result<()> {
        if self.is_finished() {
            return Err(CallbusError::AlreadyFinished);
        }
        let frame = Frame::with_body_limited(
            FrameKind::Finish,
            self.call_id,
            &result,
            self.session.max_payload_size(),
        )?;

        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(CallbusError::AlreadyFinished);
        }
        self.signals.window.close();
        self.session.forget_serving(self.call_id);

        self.session.writer().send(frame).await
    }
}

impl Drop for ServingCall {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(
            "Handler for {} returned without finishing call {}",
            self.name,
            self.call_id
        );
        self.session.forget_serving(self.call_id);

        let result = RpcResult::err(
            RpcErrorKind::Internal,
            Value::String("handler returned without finishing the call".into()),
        );
        if let Ok(frame) = Frame::with_body(FrameKind::Finish, self.call_id, &result) {
            let _ = self.session.writer().send_control(frame);
        }
    }
}

/// Context passed to handlers.
///
/// Not `Clone`: the context owns the right to finish the call. Move it into
/// a spawned task to keep serving after the handler returns.
pub struct ServerContext {
    call: Arc<ServingCall>,
}

impl ServerContext {
    pub(crate) fn new(call: Arc<ServingCall>) -> Self {
        Self { call }
    }

    /// Id of the call on this session.
    #[inline]
    pub fn call_id(&self) -> u64 {
        self.call.call_id
    }

    /// Name the call was made with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.call.name
    }

    /// True once the caller cancelled or went away.
    pub fn is_cancelled(&self) -> bool {
        self.call.signals.is_cancelled()
    }

    /// True once the call was finished through this context.
    pub fn is_finished(&self) -> bool {
        self.call.is_finished()
    }

    /// Stream one partial result to the caller.
    ///
    /// Waits while the caller has not drained the previous update.
    ///
    /// # Errors
    ///
    /// - [`CallbusError::AlreadyFinished`] after `finish`
    /// - [`CallbusError::CallDone`] once cancelled, or when the caller does
    ///   not drain updates within the update timeout
    /// - [`CallbusError::PayloadTooLarge`] if the encoded update exceeds the
    ///   session's maximum payload size; the call stays usable
    pub async fn emit_update(&self, payload: Value) -> Result<()> {
        self.call.emit_update(payload).await
    }

    /// Serialize and stream one partial result.
    pub async fn emit<T: Serialize>(&self, payload: &T) -> Result<()> {
        self.call.emit_update(to_payload(payload)?).await
    }

    /// Send the terminal result. Updates emitted before are delivered first.
    ///
    /// # Errors
    ///
    /// - [`CallbusError::AlreadyFinished`] on every call after the first
    /// - [`CallbusError::PayloadTooLarge`] if the encoded result exceeds the
    ///   session's maximum payload size; the call is not finished
    pub async fn finish(&self, result: RpcResult) -> Result<()> {
        self.call.finish(result).await
    }

    /// Finish successfully with a serialized value.
    pub async fn ok<T: Serialize>(&self, value: &T) -> Result<()> {
        self.finish(RpcResult::ok(to_payload(value)?)).await
    }

    /// Finish with an error.
    pub async fn error(&self, kind: RpcErrorKind, details: Value) -> Result<()> {
        self.finish(RpcResult::err(kind, details)).await
    }

    /// Decline the call; the bus server offers it to the next handler.
    pub async fn not_handled(&self) -> Result<()> {
        self.finish(RpcResult::not_handled()).await
    }

    /// Issue a nested call on the session that is serving this one.
    pub async fn call_rpc<T: Serialize>(&self, name: &str, args: &T) -> Result<ClientContext> {
        self.call.session.call(name, to_payload(args)?).await
    }

    /// Cloneable handle to the serving session.
    pub fn client(&self) -> ThinClient {
        ThinClient::new(self.call.session.clone())
    }

    pub(crate) fn serving_call(&self) -> Arc<ServingCall> {
        self.call.clone()
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("call_id", &self.call.call_id)
            .field("name", &self.call.name)
            .field("finished", &self.call.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::session::SessionConfig;
    use crate::protocol::FrameBuffer;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn serving(call_id: u64, window: usize) -> (ServerContext, Arc<CallSignals>, DuplexStream) {
        serving_with(call_id, window, SessionConfig::default())
    }

    fn serving_with(
        call_id: u64,
        window: usize,
        config: SessionConfig,
    ) -> (ServerContext, Arc<CallSignals>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let session = Session::for_stream(local, config);
        let signals = Arc::new(CallSignals::new(UpdateWindow::new(
            window,
            Duration::from_millis(200),
        )));
        session.track_serving(call_id, signals.clone());
        let call = ServingCall::new(call_id, "test.test".into(), signals.clone(), session);
        (ServerContext::new(Arc::new(call)), signals, remote)
    }

    async fn read_frames(remote: &mut DuplexStream, count: usize) -> Vec<Frame> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 4096];
        while frames.len() < count {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_finish_exactly_once() {
        let (ctx, _signals, mut remote) = serving(7, 1);

        ctx.ok(&serde_json::json!({"blub": "foo"})).await.unwrap();
        let second = ctx.not_handled().await;
        assert!(matches!(second, Err(CallbusError::AlreadyFinished)));
        assert!(matches!(
            ctx.emit_update(Value::Null).await,
            Err(CallbusError::AlreadyFinished)
        ));

        let frames = read_frames(&mut remote, 1).await;
        assert_eq!(frames[0].kind(), FrameKind::Finish);
        assert_eq!(frames[0].call_id(), 7);
        let result: RpcResult = frames[0].body().unwrap();
        assert_eq!(result, RpcResult::ok(serde_json::json!({"blub": "foo"})));
    }

    #[tokio::test]
    async fn test_update_waits_for_ack() {
        let (ctx, signals, mut remote) = serving(3, 1);

        ctx.emit(&1).await.unwrap();

        let acker = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            acker.ack();
        });
        ctx.emit(&2).await.unwrap();
        ctx.ok(&3).await.unwrap();

        let frames = read_frames(&mut remote, 3).await;
        let kinds: Vec<_> = frames.iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec![FrameKind::Update, FrameKind::Update, FrameKind::Finish]);
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_update() {
        let (ctx, signals, _remote) = serving(1, 1);
        ctx.emit(&"first").await.unwrap();

        let canceller = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx.emit(&"second").await;
        assert!(matches!(result, Err(CallbusError::CallDone)));
        assert!(ctx.is_cancelled());
        assert!(ctx.not_handled().await.is_ok());
    }

    #[tokio::test]
    async fn test_undrained_update_times_out() {
        let (ctx, _signals, _remote) = serving(1, 1);
        ctx.emit(&"first").await.unwrap();

        let result = ctx.emit(&"second").await;
        assert!(matches!(result, Err(CallbusError::CallDone)));
    }

    #[tokio::test]
    async fn test_drop_without_finish_sends_internal_error() {
        let (ctx, _signals, mut remote) = serving(11, 1);
        drop(ctx);

        let frames = read_frames(&mut remote, 1).await;
        assert_eq!(frames[0].kind(), FrameKind::Finish);
        let result: RpcResult = frames[0].body().unwrap();
        assert_eq!(result.unwrap_err().kind, RpcErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_oversized_update_is_refused_before_sending() {
        let config = SessionConfig {
            max_payload_size: 1024,
            ..Default::default()
        };
        let (ctx, _signals, mut remote) = serving_with(5, 1, config);

        let big = ctx.emit(&"x".repeat(4096)).await;
        assert!(matches!(big, Err(CallbusError::PayloadTooLarge { max: 1024, .. })));
        assert!(!ctx.is_finished());

        // the refused update took no window slot
        ctx.emit(&"small").await.unwrap();

        let too_big = ctx.ok(&"y".repeat(4096)).await;
        assert!(matches!(too_big, Err(CallbusError::PayloadTooLarge { .. })));
        assert!(!ctx.is_finished());
        ctx.ok(&"done").await.unwrap();

        let frames = read_frames(&mut remote, 2).await;
        assert_eq!(frames[0].kind(), FrameKind::Update);
        assert_eq!(frames[0].body::<Value>().unwrap(), Value::from("small"));
        assert_eq!(frames[1].kind(), FrameKind::Finish);
        let result: RpcResult = frames[1].body().unwrap();
        assert_eq!(result, RpcResult::ok(Value::from("done")));
    }
}
