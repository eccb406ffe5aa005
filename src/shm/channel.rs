//! Two-slot command/result channel over a shared-memory segment.
//!
//! The data area is split into a command half written by the controller and
//! a result half written by the worker. Each half holds one sealed envelope
//! at a time, guarded by the header's `ready` flag and sequence counter.
//! Copies in and out happen under the cross-process lock in [`super::lock`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::header::{Header, Slot, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION};
use super::lock::{self, DEFAULT_LOCK_TIMEOUT};
use super::segment::{default_segment_dir, ShmSegment};
use crate::config::{MAX_SHARED_MEMORY_SIZE, MIN_SHARED_MEMORY_SIZE};
use crate::error::{RenderwireError, Result};
use crate::protocol::{
    encode_command, encode_result, open_command, open_result, seal, Command, RenderResult,
    ENVELOPE_HEADER_SIZE,
};

/// Default share of the data area given to the command half.
pub const DEFAULT_COMMAND_FRACTION: f64 = 0.5;

/// Snapshot of channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShmStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_operations: u64,
    pub read_operations: u64,
    pub sync_timeouts: u64,
    pub sync_errors: u64,
}

#[derive(Default)]
struct Counters {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    write_operations: AtomicU64,
    read_operations: AtomicU64,
    sync_timeouts: AtomicU64,
    sync_errors: AtomicU64,
}

/// Double-buffered shared-memory channel.
///
/// The segment holds a 128-byte header followed by a command half and a
/// result half. Each half is a single slot: a message must be consumed before
/// the next one can be written. The controller creates the segment and
/// writes commands; the worker connects, reads commands and writes results.
///
/// # Example
///
/// ```no_run
/// use renderwire::protocol::{Command, CommandKind};
/// use renderwire::shm::SharedMemoryChannel;
///
/// let controller = SharedMemoryChannel::create("render.shm", 64 * 1024)?;
/// let worker = SharedMemoryChannel::connect("render.shm")?;
///
/// let mut cmd = Command::new(CommandKind::Render, 1);
/// cmd.id = 1;
/// controller.write_command(&cmd)?;
/// assert_eq!(worker.read_command()?.map(|c| c.id), Some(1));
/// # Ok::<(), renderwire::RenderwireError>(())
/// ```
pub struct SharedMemoryChannel {
    segment: ShmSegment,
    name: String,
    command_offset: usize,
    command_capacity: usize,
    result_offset: usize,
    result_capacity: usize,
    lock_timeout: Duration,
    last_command_sequence: AtomicU64,
    last_result_sequence: AtomicU64,
    counters: Counters,
}

impl SharedMemoryChannel {
    /// Create a segment in the default directory with a 50/50 split.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::create_in(default_segment_dir(), name, size, DEFAULT_COMMAND_FRACTION)
    }

    /// Create a segment in the default directory with a custom split.
    pub fn create_with_split(name: &str, size: usize, command_fraction: f64) -> Result<Self> {
        Self::create_in(default_segment_dir(), name, size, command_fraction)
    }

    /// Create a segment under `dir`.
    ///
    /// `command_fraction` is the share of the data area given to commands and
    /// must lie in `0.05..=0.95`.
    pub fn create_in(
        dir: impl AsRef<Path>,
        name: &str,
        size: usize,
        command_fraction: f64,
    ) -> Result<Self> {
        if !(MIN_SHARED_MEMORY_SIZE..=MAX_SHARED_MEMORY_SIZE).contains(&size) {
            return Err(RenderwireError::Config(format!(
                "shared memory size {size} outside {MIN_SHARED_MEMORY_SIZE}..={MAX_SHARED_MEMORY_SIZE}"
            )));
        }
        if !(0.05..=0.95).contains(&command_fraction) {
            return Err(RenderwireError::Config(format!(
                "command fraction {command_fraction} outside 0.05..=0.95"
            )));
        }

        let data = size - SEGMENT_HEADER_SIZE;
        // Keep the result half 8-byte aligned.
        let command_capacity = ((data as f64 * command_fraction) as usize) & !7;

        let segment = ShmSegment::create(dir.as_ref().join(name), size)?;
        Header::new(&segment).init(command_capacity as u64);

        tracing::info!(
            path = %segment.path().display(),
            size,
            command_capacity,
            "created shared-memory channel"
        );
        Ok(Self::from_segment(segment, name, command_capacity))
    }

    /// Open an existing segment in the default directory.
    pub fn connect(name: &str) -> Result<Self> {
        Self::connect_in(default_segment_dir(), name)
    }

    /// Open an existing segment under `dir`, validating its header.
    pub fn connect_in(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let segment = ShmSegment::open(dir.as_ref().join(name))?;
        if segment.len() < SEGMENT_HEADER_SIZE + 2 * ENVELOPE_HEADER_SIZE {
            return Err(RenderwireError::Protocol(format!(
                "segment of {} bytes is too small",
                segment.len()
            )));
        }

        let header = Header::new(&segment);
        if header.magic() != SEGMENT_MAGIC {
            return Err(RenderwireError::Protocol(format!(
                "bad segment magic {:#010x}",
                header.magic()
            )));
        }
        if header.version() != SEGMENT_VERSION {
            return Err(RenderwireError::Protocol(format!(
                "unsupported segment version {}",
                header.version()
            )));
        }
        let command_capacity = header.command_capacity() as usize;
        if command_capacity >= segment.len() - SEGMENT_HEADER_SIZE {
            return Err(RenderwireError::Protocol(format!(
                "command capacity {command_capacity} exceeds segment"
            )));
        }

        tracing::info!(path = %segment.path().display(), size = segment.len(), "connected to shared-memory channel");
        Ok(Self::from_segment(segment, name, command_capacity))
    }

    fn from_segment(segment: ShmSegment, name: &str, command_capacity: usize) -> Self {
        let header = Header::new(&segment);
        // A slot that is already pending on connect is still unread.
        let seen = |slot: Slot| {
            let seq = header.sequence(slot).load(Ordering::Acquire);
            let pending = header.ready(slot).load(Ordering::Acquire) as u64;
            seq.saturating_sub(pending)
        };
        let last_command_sequence = AtomicU64::new(seen(Slot::Command));
        let last_result_sequence = AtomicU64::new(seen(Slot::Result));

        let command_offset = SEGMENT_HEADER_SIZE;
        let result_offset = command_offset + command_capacity;
        let result_capacity = segment.len() - result_offset;
        Self {
            segment,
            name: name.to_owned(),
            command_offset,
            command_capacity,
            result_offset,
            result_capacity,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            last_command_sequence,
            last_result_sequence,
            counters: Counters::default(),
        }
    }

    /// Override the bounded lock wait (default 5 s).
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn header(&self) -> Header<'_> {
        Header::new(&self.segment)
    }

    fn region(&self, slot: Slot) -> (usize, usize) {
        match slot {
            Slot::Command => (self.command_offset, self.command_capacity),
            Slot::Result => (self.result_offset, self.result_capacity),
        }
    }

    fn last_seen(&self, slot: Slot) -> &AtomicU64 {
        match slot {
            Slot::Command => &self.last_command_sequence,
            Slot::Result => &self.last_result_sequence,
        }
    }

    fn lock(&self) -> Result<lock::ShmLockGuard<'_>> {
        lock::acquire(self.header().lock_word(), self.lock_timeout)
            .map_err(|e| self.lock_failed(e))
    }

    async fn lock_async(&self) -> Result<lock::ShmLockGuard<'_>> {
        lock::acquire_async(self.header().lock_word(), self.lock_timeout)
            .await
            .map_err(|e| self.lock_failed(e))
    }

    fn lock_failed(&self, e: RenderwireError) -> RenderwireError {
        self.counters.sync_timeouts.fetch_add(1, Ordering::Relaxed);
        e
    }

    /// Size-check and seal `body` for a slot.
    fn seal_for(&self, slot: Slot, body: &[u8]) -> Result<Vec<u8>> {
        let (_, capacity) = self.region(slot);
        let needed = ENVELOPE_HEADER_SIZE + body.len();
        if needed > capacity {
            return Err(RenderwireError::Serialization(format!(
                "{needed} bytes exceed the {capacity}-byte {} half",
                slot.name()
            )));
        }
        seal(body)
    }

    /// Seal `body` into a slot and publish it. Returns the new sequence.
    fn write_slot(&self, slot: Slot, body: &[u8]) -> Result<u64> {
        let sealed = self.seal_for(slot, body)?;
        let _guard = self.lock()?;
        self.publish_locked(slot, &sealed)
    }

    async fn write_slot_async(&self, slot: Slot, body: &[u8]) -> Result<u64> {
        let sealed = self.seal_for(slot, body)?;
        let _guard = self.lock_async().await?;
        self.publish_locked(slot, &sealed)
    }

    /// Caller holds the lock.
    fn publish_locked(&self, slot: Slot, sealed: &[u8]) -> Result<u64> {
        let header = self.header();
        if header.ready(slot).load(Ordering::Acquire) != 0 {
            return Err(RenderwireError::SlotOccupied(slot.name()));
        }

        let (offset, _) = self.region(slot);
        self.segment.write_bytes(offset, sealed)?;
        header.size(slot).store(sealed.len() as u64, Ordering::Relaxed);
        let sequence = header.sequence(slot).load(Ordering::Relaxed) + 1;
        header.sequence(slot).store(sequence, Ordering::Relaxed);
        header.ready(slot).store(1, Ordering::Release);

        self.counters
            .bytes_written
            .fetch_add(sealed.len() as u64, Ordering::Relaxed);
        self.counters.write_operations.fetch_add(1, Ordering::Relaxed);
        Ok(sequence)
    }

    /// Take the envelope out of a ready slot and clear it.
    fn read_slot<T>(&self, slot: Slot, decode: impl FnOnce(&[u8]) -> Result<T>) -> Result<Option<T>> {
        if self.header().ready(slot).load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        let _guard = self.lock()?;
        self.take_locked(slot, decode)
    }

    async fn read_slot_async<T>(
        &self,
        slot: Slot,
        decode: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        if self.header().ready(slot).load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        let _guard = self.lock_async().await?;
        self.take_locked(slot, decode)
    }

    /// Caller holds the lock. `decode` runs before the slot is released; a
    /// slot that fails it is discarded.
    fn take_locked<T>(&self, slot: Slot, decode: impl FnOnce(&[u8]) -> Result<T>) -> Result<Option<T>> {
        let header = self.header();
        if header.ready(slot).load(Ordering::Acquire) == 0 {
            return Ok(None);
        }

        let sequence = header.sequence(slot).load(Ordering::Relaxed);
        let last = self.last_seen(slot).load(Ordering::Relaxed);
        if sequence <= last {
            header.ready(slot).store(0, Ordering::Release);
            self.counters.sync_errors.fetch_add(1, Ordering::Relaxed);
            return Err(RenderwireError::StaleSequence {
                slot: slot.name(),
                sequence,
            });
        }

        let (offset, capacity) = self.region(slot);
        let size = (header.size(slot).load(Ordering::Relaxed) as usize).min(capacity);
        let decoded = self
            .segment
            .read_bytes(offset, size)
            .and_then(|bytes| decode(&bytes));

        self.last_seen(slot).store(sequence, Ordering::Relaxed);
        header.ready(slot).store(0, Ordering::Release);

        match decoded {
            Ok(value) => {
                self.counters
                    .bytes_read
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.counters.read_operations.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Err(e) => {
                self.counters.sync_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot = slot.name(), sequence, error = %e, "discarded corrupt shared-memory slot");
                Err(e)
            }
        }
    }

    /// Publish a command (controller side).
    pub fn write_command(&self, cmd: &Command) -> Result<u64> {
        self.write_command_body(&encode_command(cmd)?)
    }

    /// Publish an already encoded command body.
    pub fn write_command_body(&self, body: &[u8]) -> Result<u64> {
        self.write_slot(Slot::Command, body)
    }

    /// [`write_command_body`](Self::write_command_body) for async callers;
    /// waits for the lock on the runtime timer.
    pub async fn write_command_body_async(&self, body: &[u8]) -> Result<u64> {
        self.write_slot_async(Slot::Command, body).await
    }

    /// Consume the pending command, if any (worker side).
    pub fn read_command(&self) -> Result<Option<Command>> {
        self.read_slot(Slot::Command, open_command)
    }

    pub async fn read_command_async(&self) -> Result<Option<Command>> {
        self.read_slot_async(Slot::Command, open_command).await
    }

    /// Publish a result (worker side).
    pub fn write_result(&self, result: &RenderResult) -> Result<u64> {
        self.write_slot(Slot::Result, &encode_result(result)?)
    }

    pub async fn write_result_async(&self, result: &RenderResult) -> Result<u64> {
        self.write_slot_async(Slot::Result, &encode_result(result)?)
            .await
    }

    /// Consume the pending result, if any (controller side).
    pub fn read_result(&self) -> Result<Option<RenderResult>> {
        self.read_slot(Slot::Result, open_result)
    }

    pub async fn read_result_async(&self) -> Result<Option<RenderResult>> {
        self.read_slot_async(Slot::Result, open_result).await
    }

    pub fn signal_command_ready(&self) {
        lock::signal(self.header().event(Slot::Command));
    }

    pub fn signal_result_ready(&self) {
        lock::signal(self.header().event(Slot::Result));
    }

    /// Wait for a command signal. A `false` return does not mean the slot is
    /// empty; check with [`read_command`](Self::read_command).
    pub async fn wait_for_command(&self, timeout: Duration) -> bool {
        lock::wait(self.header().event(Slot::Command), timeout).await
    }

    /// Wait for a result signal.
    pub async fn wait_for_result(&self, timeout: Duration) -> bool {
        lock::wait(self.header().event(Slot::Result), timeout).await
    }

    pub fn is_command_ready(&self) -> bool {
        self.header().ready(Slot::Command).load(Ordering::Acquire) != 0
    }

    pub fn is_result_ready(&self) -> bool {
        self.header().ready(Slot::Result).load(Ordering::Acquire) != 0
    }

    pub fn command_sequence(&self) -> u64 {
        self.header().sequence(Slot::Command).load(Ordering::Acquire)
    }

    pub fn result_sequence(&self) -> u64 {
        self.header().sequence(Slot::Result).load(Ordering::Acquire)
    }

    /// Largest envelope the command half holds.
    pub fn command_capacity(&self) -> usize {
        self.command_capacity
    }

    /// Largest envelope the result half holds.
    pub fn result_capacity(&self) -> usize {
        self.result_capacity
    }

    /// Whether an encoded command body of `len` bytes fits the command half.
    pub fn fits_command(&self, len: usize) -> bool {
        ENVELOPE_HEADER_SIZE + len <= self.command_capacity
    }

    /// Whether an encoded result body of `len` bytes fits the result half.
    pub fn fits_result(&self, len: usize) -> bool {
        ENVELOPE_HEADER_SIZE + len <= self.result_capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    /// Total segment size in bytes.
    pub fn size(&self) -> usize {
        self.segment.len()
    }

    pub fn is_creator(&self) -> bool {
        self.segment.is_owner()
    }

    pub fn stats(&self) -> ShmStats {
        let c = &self.counters;
        ShmStats {
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            write_operations: c.write_operations.load(Ordering::Relaxed),
            read_operations: c.read_operations.load(Ordering::Relaxed),
            sync_timeouts: c.sync_timeouts.load(Ordering::Relaxed),
            sync_errors: c.sync_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        let c = &self.counters;
        for counter in [
            &c.bytes_written,
            &c.bytes_read,
            &c.write_operations,
            &c.read_operations,
            &c.sync_timeouts,
            &c.sync_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("name", &self.name)
            .field("size", &self.segment.len())
            .field("command_capacity", &self.command_capacity)
            .field("result_capacity", &self.result_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, ResultStatus};

    const SIZE: usize = 64 * 1024;

    fn pair(dir: &Path) -> (SharedMemoryChannel, SharedMemoryChannel) {
        let controller =
            SharedMemoryChannel::create_in(dir, "chan", SIZE, DEFAULT_COMMAND_FRACTION).unwrap();
        let worker = SharedMemoryChannel::connect_in(dir, "chan").unwrap();
        (controller, worker)
    }

    fn command(id: u64) -> Command {
        let mut cmd = Command::new(CommandKind::Render, 1);
        cmd.id = id;
        cmd
    }

    #[test]
    fn test_command_and_result_flow() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());

        assert_eq!(controller.write_command(&command(1)).unwrap(), 1);
        assert!(worker.is_command_ready());
        let received = worker.read_command().unwrap().unwrap();
        assert_eq!(received, command(1));
        assert!(!worker.is_command_ready());
        assert!(worker.read_command().unwrap().is_none());

        let result = RenderResult::success(&received);
        worker.write_result(&result).unwrap();
        assert_eq!(controller.read_result().unwrap(), Some(result));
    }

    #[test]
    fn test_split_is_shared_with_opener() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SharedMemoryChannel::create_in(dir.path(), "chan", SIZE, 0.25).unwrap();
        let worker = SharedMemoryChannel::connect_in(dir.path(), "chan").unwrap();

        assert_eq!(worker.command_capacity(), controller.command_capacity());
        assert_eq!(
            controller.command_capacity() + controller.result_capacity(),
            SIZE - SEGMENT_HEADER_SIZE
        );
        assert!(controller.command_capacity() < controller.result_capacity());
        assert_eq!(
            SharedMemoryChannel::create_in(dir.path(), "equal", SIZE, DEFAULT_COMMAND_FRACTION)
                .unwrap()
                .command_capacity(),
            (SIZE - SEGMENT_HEADER_SIZE) / 2
        );
    }

    #[test]
    fn test_size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        for size in [MIN_SHARED_MEMORY_SIZE - 1, MAX_SHARED_MEMORY_SIZE + 1] {
            assert!(matches!(
                SharedMemoryChannel::create_in(dir.path(), "c", size, 0.5),
                Err(RenderwireError::Config(_))
            ));
        }
        assert!(SharedMemoryChannel::create_in(dir.path(), "c", SIZE, 0.99).is_err());
    }

    #[test]
    fn test_create_fails_if_exists_and_connect_fails_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (_controller, _worker) = pair(dir.path());
        assert!(SharedMemoryChannel::create_in(dir.path(), "chan", SIZE, 0.5).is_err());
        assert!(SharedMemoryChannel::connect_in(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_connect_rejects_foreign_segment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk"), vec![0u8; SIZE]).unwrap();
        let err = SharedMemoryChannel::connect_in(dir.path(), "junk").unwrap_err();
        assert!(err.to_string().contains("bad segment magic"));
    }

    #[test]
    fn test_connect_rejects_wrong_version() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SharedMemoryChannel::create_in(dir.path(), "chan", SIZE, 0.5).unwrap();
        controller.segment.u32_at(4).store(7, Ordering::Release);

        let err = SharedMemoryChannel::connect_in(dir.path(), "chan").unwrap_err();
        assert!(err.to_string().contains("unsupported segment version 7"));
    }

    #[test]
    fn test_second_write_before_read_fails_without_corrupting() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());

        controller.write_command(&command(1)).unwrap();
        assert!(matches!(
            controller.write_command(&command(2)),
            Err(RenderwireError::SlotOccupied("command"))
        ));
        assert_eq!(worker.read_command().unwrap().unwrap().id, 1);
        assert_eq!(controller.command_sequence(), 1);

        controller.write_command(&command(2)).unwrap();
        assert_eq!(worker.read_command().unwrap().unwrap().id, 2);
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());

        let mut last = 0;
        for id in 1..=20 {
            controller.write_command(&command(id)).unwrap();
            let seq = worker.command_sequence();
            assert!(seq > last);
            last = seq;
            worker.read_command().unwrap().unwrap();
        }
        assert_eq!(last, 20);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _worker) = pair(dir.path());

        let mut cmd = command(1);
        cmd.content_params.source_url = "x".repeat(SIZE);
        assert!(!controller.fits_command(SIZE));
        assert!(matches!(
            controller.write_command(&cmd),
            Err(RenderwireError::Serialization(_))
        ));
        assert!(!controller.is_command_ready());
    }

    #[test]
    fn test_corrupt_slot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());
        controller.write_command(&command(1)).unwrap();

        // Flip a payload byte in the command half.
        let at = SEGMENT_HEADER_SIZE + ENVELOPE_HEADER_SIZE + 3;
        let byte = controller.segment.read_bytes(at, 1).unwrap()[0];
        controller.segment.write_bytes(at, &[byte ^ 0x10]).unwrap();

        assert!(matches!(
            worker.read_command(),
            Err(RenderwireError::ChecksumMismatch { .. })
        ));
        assert!(!worker.is_command_ready());
        assert_eq!(worker.stats().sync_errors, 1);
        controller.write_command(&command(2)).unwrap();
        assert_eq!(worker.read_command().unwrap().unwrap().id, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_io_waits_for_a_busy_lock_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let guard = worker.lock().unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            drop(guard);
            worker
        });
        held_rx.recv().unwrap();

        let ticks = std::sync::Arc::new(AtomicU64::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let sequence = controller
            .write_command_body_async(&encode_command(&command(1)).unwrap())
            .await
            .unwrap();
        assert_eq!(sequence, 1);
        assert!(ticks.load(Ordering::Relaxed) >= 5);
        ticker.abort();

        let worker = holder.join().unwrap();
        let got = worker.read_command_async().await.unwrap().unwrap();
        assert_eq!(got.id, 1);
        worker
            .write_result_async(&RenderResult::success(&got))
            .await
            .unwrap();
        assert_eq!(
            controller.read_result_async().await.unwrap().unwrap().command_id,
            1
        );
    }

    #[tokio::test]
    async fn test_async_lock_timeout_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());
        let worker = worker.with_lock_timeout(Duration::from_millis(20));
        let _guard = controller.lock().unwrap();

        assert!(matches!(
            worker.write_result_async(&RenderResult::success(&command(1))).await,
            Err(RenderwireError::LockTimeout)
        ));
        assert_eq!(worker.stats().sync_timeouts, 1);
    }

    #[test]
    fn test_result_failure_status_survives() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());
        let result = RenderResult::failure(&command(9), ResultStatus::InvalidParams, "bad bounds");
        worker.write_result(&result).unwrap();
        let got = controller.read_result().unwrap().unwrap();
        assert_eq!(got.status, ResultStatus::InvalidParams);
        assert_eq!(got.error_message, "bad bounds");
    }

    #[test]
    fn test_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());
        controller.write_command(&command(1)).unwrap();
        worker.read_command().unwrap();

        let written = controller.stats();
        assert_eq!(written.write_operations, 1);
        assert!(written.bytes_written > 0);
        assert_eq!(worker.stats().read_operations, 1);
        assert_eq!(worker.stats().bytes_read, written.bytes_written);

        controller.reset_statistics();
        assert_eq!(controller.stats(), ShmStats::default());
    }

    #[test]
    fn test_pending_slot_visible_to_late_connector() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SharedMemoryChannel::create_in(dir.path(), "chan", SIZE, 0.5).unwrap();
        controller.write_command(&command(5)).unwrap();

        let worker = SharedMemoryChannel::connect_in(dir.path(), "chan").unwrap();
        assert_eq!(worker.read_command().unwrap().unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_signal_and_wait() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());

        assert!(!worker.wait_for_command(Duration::from_millis(5)).await);
        controller.write_command(&command(1)).unwrap();
        controller.signal_command_ready();
        assert!(worker.wait_for_command(Duration::from_millis(100)).await);

        worker.signal_result_ready();
        assert!(controller.wait_for_result(Duration::from_millis(100)).await);
    }

    #[test]
    fn test_creator_removes_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, worker) = pair(dir.path());
        let path = controller.path().to_path_buf();
        drop(worker);
        assert!(path.exists());
        drop(controller);
        assert!(!path.exists());
    }
}
