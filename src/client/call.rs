//! Calling side of a call.
//!
//! Each outgoing call owns a private event channel: the session's read loop
//! pushes UPDATE and FINISH into it, and [`ClientContext`] drains it. Taking
//! an update off the channel sends the ACK that lets the handler emit the
//! next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{Frame, FrameKind};
use crate::result::RpcResult;
use crate::writer::WriterHandle;

/// What the read loop delivers for an outgoing call.
#[derive(Debug)]
pub(crate) enum CallEvent {
    Update(Value),
    Finished(RpcResult),
}

/// Read-loop half of an outgoing call.
pub(crate) struct PendingCall {
    events: mpsc::UnboundedSender<CallEvent>,
    done: Arc<AtomicBool>,
}

impl PendingCall {
    /// Deliver an update. Returns false once the caller dropped its context.
    pub(crate) fn update(&self, payload: Value) -> bool {
        self.events.send(CallEvent::Update(payload)).is_ok()
    }

    /// Deliver the terminal result.
    pub(crate) fn finish(self, result: RpcResult) {
        self.done.store(true, Ordering::Release);
        let _ = self.events.send(CallEvent::Finished(result));
    }
}

/// Create both halves of an outgoing call.
pub(crate) fn channel(call_id: u64, writer: WriterHandle) -> (PendingCall, ClientContext) {
    let (tx, rx) = mpsc::unbounded_channel();
    let done = Arc::new(AtomicBool::new(false));

    let pending = PendingCall {
        events: tx,
        done: done.clone(),
    };
    let ctx = ClientContext {
        call_id,
        events: rx,
        done,
        cancel_sent: AtomicBool::new(false),
        result: None,
        writer,
    };
    (pending, ctx)
}

/// Handle on an outgoing call.
///
/// Updates arrive in the order the handler emitted them, followed by exactly
/// one result. Dropping an unfinished context cancels the call.
pub struct ClientContext {
    call_id: u64,
    events: mpsc::UnboundedReceiver<CallEvent>,
    done: Arc<AtomicBool>,
    cancel_sent: AtomicBool,
    /// Terminal result once seen; also marks end of stream.
    result: Option<RpcResult>,
    writer: WriterHandle,
}

impl ClientContext {
    /// Id of the call on this session.
    #[inline]
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Next update, waiting for it if needed.
    ///
    /// Returns `None` at end of stream, and keeps returning `None` after.
    /// The result is then available from [`wait`](Self::wait).
    pub async fn recv(&mut self) -> Option<Value> {
        if self.result.is_some() {
            return None;
        }
        let event = self.events.recv().await;
        self.accept(event)
    }

    /// Next update if one is already buffered.
    ///
    /// `None` means either nothing is buffered yet or the stream has ended;
    /// [`done`](Self::done) tells the two apart.
    pub fn try_recv(&mut self) -> Option<Value> {
        if self.result.is_some() {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => self.accept(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.accept(None),
        }
    }

    /// Drain remaining updates and return the terminal result.
    ///
    /// Calling it again returns the same result.
    pub async fn wait(&mut self) -> RpcResult {
        while self.result.is_none() {
            let _ = self.recv().await;
        }
        match &self.result {
            Some(result) => result.clone(),
            None => RpcResult::disconnected("call ended without a result"),
        }
    }

    /// True once the result arrived, even if updates are still buffered.
    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Ask the handler to stop.
    ///
    /// Idempotent, and a no-op once the call is done. The call still ends
    /// with whatever result the handler finishes with.
    pub fn cancel(&self) {
        if self.done() || self.cancel_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Cancelling call {}", self.call_id);
        let _ = self
            .writer
            .send_control(Frame::empty(FrameKind::Cancel, self.call_id));
    }

    /// Mark a call that never reached the wire, so dropping it sends nothing.
    pub(crate) fn abandon(self) {
        self.done.store(true, Ordering::Release);
    }

    fn accept(&mut self, event: Option<CallEvent>) -> Option<Value> {
        match event {
            Some(CallEvent::Update(payload)) => {
                let _ = self
                    .writer
                    .send_control(Frame::empty(FrameKind::Ack, self.call_id));
                Some(payload)
            }
            Some(CallEvent::Finished(result)) => {
                self.result = Some(result);
                None
            }
            None => {
                self.done.store(true, Ordering::Release);
                self.result = Some(RpcResult::disconnected("session closed"));
                None
            }
        }
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        if self.result.is_none() {
            self.cancel();
        }
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("call_id", &self.call_id)
            .field("done", &self.done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use crate::result::RpcErrorKind;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn call(call_id: u64) -> (PendingCall, ClientContext, DuplexStream) {
        let (local, remote) = duplex(4096);
        let (writer, _task) = spawn_writer_task(local, WriterConfig::default());
        let (pending, ctx) = channel(call_id, writer);
        (pending, ctx, remote)
    }

    async fn read_kinds(remote: &mut DuplexStream, count: usize) -> Vec<(FrameKind, u64)> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 1024];
        while frames.len() < count {
            let n = remote.read(&mut buf).await.unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }
        frames.iter().map(|f| (f.kind(), f.call_id())).collect()
    }

    #[tokio::test]
    async fn test_updates_then_result() {
        let (pending, mut ctx, mut remote) = call(5);

        assert!(pending.update(json!({"count": 0})));
        assert!(pending.update(json!({"count": 1})));
        pending.finish(RpcResult::ok(json!({"foo": "blah"})));

        assert_eq!(ctx.recv().await, Some(json!({"count": 0})));
        assert_eq!(ctx.recv().await, Some(json!({"count": 1})));
        assert_eq!(ctx.recv().await, None);
        assert_eq!(ctx.recv().await, None);
        assert_eq!(ctx.wait().await, RpcResult::ok(json!({"foo": "blah"})));

        let kinds = read_kinds(&mut remote, 2).await;
        assert_eq!(kinds, vec![(FrameKind::Ack, 5), (FrameKind::Ack, 5)]);
    }

    #[tokio::test]
    async fn test_try_recv_keeps_updates_before_result() {
        let (pending, mut ctx, _remote) = call(1);

        assert_eq!(ctx.try_recv(), None);
        assert!(!ctx.done());

        pending.update(json!(1));
        pending.finish(RpcResult::ok(json!(2)));

        assert!(ctx.done());
        assert_eq!(ctx.try_recv(), Some(json!(1)));
        assert_eq!(ctx.try_recv(), None);
        assert_eq!(ctx.wait().await, RpcResult::ok(json!(2)));
    }

    #[tokio::test]
    async fn test_wait_drains_and_repeats() {
        let (pending, mut ctx, _remote) = call(1);
        pending.update(json!("skipped"));
        pending.finish(RpcResult::not_handled());

        assert!(ctx.wait().await.is_not_handled());
        assert!(ctx.wait().await.is_not_handled());
    }

    #[tokio::test]
    async fn test_lost_read_side_is_io_error() {
        let (pending, mut ctx, _remote) = call(1);
        drop(pending);

        let result = ctx.wait().await;
        assert_eq!(result.unwrap_err().kind, RpcErrorKind::Io);
        assert!(ctx.done());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (local, mut remote) = duplex(4096);
        let (writer, _task) = spawn_writer_task(local, WriterConfig::default());
        let (pending, ctx) = channel(9, writer.clone());

        ctx.cancel();
        ctx.cancel();
        pending.finish(RpcResult::not_handled());
        ctx.cancel();
        drop(ctx);

        // marker frame right behind the single CANCEL
        writer.send_control(Frame::empty(FrameKind::Ack, 0)).unwrap();
        let kinds = read_kinds(&mut remote, 2).await;
        assert_eq!(kinds, vec![(FrameKind::Cancel, 9), (FrameKind::Ack, 0)]);
    }

    #[tokio::test]
    async fn test_drop_unfinished_sends_cancel() {
        let (_pending, ctx, mut remote) = call(4);
        drop(ctx);

        let kinds = read_kinds(&mut remote, 1).await;
        assert_eq!(kinds, vec![(FrameKind::Cancel, 4)]);
    }
}
