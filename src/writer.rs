//! Dedicated writer task for the reliable channel.
//!
//! Every outbound frame goes through a single task that owns the write half
//! of the connection, so heartbeats, commands and results never interleave
//! mid-frame and no lock guards the stream.
//!
//! ```text
//! Bridge send ──┐
//! Heartbeat ────┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Pipe
//! Worker reply ─┘
//! ```
//!
//! Ready frames are drained in batches and written with one vectored write.
//! A pending-frame counter gives callers backpressure before the queue fills.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RenderwireError, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 32;

/// A frame with its header already encoded.
#[derive(Debug)]
pub struct OutboundFrame {
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header.encode(),
            payload: frame.payload,
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting up to the backpressure timeout if the writer
    /// is behind.
    pub async fn send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.is_backpressure_active() {
            self.wait_for_capacity().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame.into()).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RenderwireError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(RenderwireError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame.into()).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => RenderwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => RenderwireError::ConnectionClosed,
            }
        })
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while self.is_backpressure_active() {
            if self.tx.is_closed() {
                return Err(RenderwireError::ConnectionClosed);
            }
            if Instant::now() >= deadline {
                return Err(RenderwireError::BackpressureTimeout);
            }
            tokio::time::sleep(Duration::from_micros(100)).await;
        }
        Ok(())
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// the underlying stream fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));
    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let count = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(count, Ordering::Release);
        batch.clear();
        if let Err(e) = result {
            tracing::warn!(error = %e, "pipe writer stopped");
            return Err(e);
        }
    }
    Ok(())
}

/// Write a batch with as few vectored writes as the kernel allows.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = slices_from(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(RenderwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "pipe accepted zero bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything in `batch` after the first `skip` bytes.
fn slices_from(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            slices.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
    }
    slices
}
