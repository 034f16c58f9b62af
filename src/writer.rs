//! Dedicated writer task for frame sending.
//!
//! Every session owns one writer task that receives frames over an mpsc
//! channel and writes them to the socket in batches.
//!
//! # Architecture
//!
//! ```text
//! Call task 1 ─┐
//! Call task 2 ─┼─► mpsc::UnboundedSender<Frame> ─► Writer Task ─► Socket
//! Read loop   ─┘
//! ```
//!
//! A single queue keeps frame order across kinds: a CANCEL can never
//! overtake the CALL it refers to. Backpressure is a pending-frame counter:
//! [`WriterHandle::send`] waits while too many frames are queued, while
//! [`WriterHandle::send_control`] enqueues immediately so ACK and CANCEL can
//! be sent from synchronous code.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{CallbusError, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by the read loop and every call task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Frame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::UnboundedSender<Frame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }
        self.enqueue(frame)
    }

    /// Send a frame without waiting for backpressure to clear.
    ///
    /// Used for ACK and CANCEL, which are tiny and must not be delayed
    /// behind the traffic they regulate.
    pub fn send_control(&self, frame: Frame) -> Result<()> {
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            CallbusError::Disconnected
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(CallbusError::Disconnected);
            }
            if start.elapsed() > self.timeout {
                return Err(CallbusError::BackpressureTimeout);
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Check if backpressure is currently active.
    #[cfg(test)]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task is gone.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch.len(), Ordering::Release);
        if let Err(e) = result {
            tracing::debug!("Writer stopped: {}", e);
            return Err(e);
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Frame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let headers: Vec<[u8; HEADER_SIZE]> = batch.iter().map(|f| f.header.encode()).collect();
    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(&headers, batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(CallbusError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices<'a>(
    headers: &'a [[u8; HEADER_SIZE]],
    batch: &'a [Frame],
    skip_bytes: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for (header, frame) in headers.iter().zip(batch) {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            slices.push(IoSlice::new(&header[skip_bytes.saturating_sub(offset)..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                slices.push(IoSlice::new(&frame.payload[skip_bytes.saturating_sub(offset)..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, FrameKind};
    use serde_json::json;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn update(call_id: u64, count: i64) -> Frame {
        Frame::with_body(FrameKind::Update, call_id, &json!({ "count": count })).unwrap()
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_frames_keep_order_across_lanes() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle
            .send(Frame::with_body(FrameKind::Call, 1, &json!(null)).unwrap())
            .await
            .unwrap();
        handle.send_control(Frame::empty(FrameKind::Cancel, 1)).unwrap();
        handle.send(update(2, 0)).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 1024];
        while frames.len() < 3 {
            let n = server.read(&mut buf).await.unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }

        let kinds: Vec<_> = frames.iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec![FrameKind::Call, FrameKind::Cancel, FrameKind::Update]);
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (client, _server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        task.abort();
        let _ = task.await;

        let result = handle.send_control(Frame::empty(FrameKind::Ack, 1));
        assert!(matches!(result, Err(CallbusError::Disconnected)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_backpressure_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel::<Frame>();
        let pending = Arc::new(AtomicUsize::new(10));
        let handle = WriterHandle::new(tx, pending, 10, Duration::from_millis(10));

        assert!(handle.is_backpressure_active());
        let result = handle.send(update(1, 0)).await;
        assert!(matches!(result, Err(CallbusError::BackpressureTimeout)));
        assert_eq!(handle.pending_count(), 10);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![update(42, 1)];
        let headers: Vec<_> = batch.iter().map(|f| f.header.encode()).collect();

        let slices = build_remaining_slices(&headers, &batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), batch[0].payload.len());
    }

    #[test]
    fn test_build_remaining_slices_skip_first_frame() {
        let batch = vec![Frame::empty(FrameKind::Ack, 1), update(2, 1)];
        let headers: Vec<_> = batch.iter().map(|f| f.header.encode()).collect();

        let slices = build_remaining_slices(&headers, &batch, HEADER_SIZE);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| update(i, i as i64)).collect();
        let expected: usize = batch.iter().map(|f| f.size()).sum();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), expected);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
