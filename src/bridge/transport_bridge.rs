//! Command submission over whichever channel can carry it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::pending::{PendingResult, PendingTable};
use crate::backpressure::{BackpressureController, DEFAULT_MAX_IN_FLIGHT};
use crate::config::{IpcMode, RenderConfig};
use crate::error::{RenderwireError, Result};
use crate::protocol::{encode_command, now_millis, Command, Frame, MessageType, RenderResult};
use crate::shm::SharedMemoryChannel;
use crate::transport::ReliableChannel;

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ipc_mode: IpcMode,
    /// Deadline applied by [`TransportBridge::send_async`].
    pub command_timeout: Duration,
    /// Consecutive send failures before a channel is bypassed.
    pub failure_threshold: u32,
    /// How long a bypassed channel rests before it is tried again.
    pub recovery_interval: Duration,
    pub max_in_flight: usize,
    /// How long a send waits for the worker to drain the command slot.
    pub slot_wait: Duration,
    /// Result polling and timeout sweep period.
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ipc_mode: IpcMode::Hybrid,
            command_timeout: Duration::from_millis(5000),
            failure_threshold: 3,
            recovery_interval: Duration::from_secs(1),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            slot_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl BridgeConfig {
    pub fn ipc_mode(mut self, mode: IpcMode) -> Self {
        self.ipc_mode = mode;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn failure_threshold(mut self, failures: u32) -> Self {
        self.failure_threshold = failures.max(1);
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    pub fn slot_wait(mut self, wait: Duration) -> Self {
        self.slot_wait = wait;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl From<&RenderConfig> for BridgeConfig {
    fn from(config: &RenderConfig) -> Self {
        Self::default()
            .ipc_mode(config.ipc_mode)
            .command_timeout(config.command_timeout())
    }
}

/// The two ways a command can reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    SharedMemory,
    Pipe,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::SharedMemory => "shared_memory",
            Channel::Pipe => "pipe",
        }
    }
}

/// Health of one channel as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    /// Configured and permitted by the IPC mode.
    pub available: bool,
    /// Connected (always true for shared memory once mapped).
    pub connected: bool,
    pub healthy: bool,
    pub consecutive_failures: u32,
}

/// Snapshot of bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BridgeStats {
    pub commands_sent: u64,
    pub results_received: u64,
    pub average_round_trip_ms: f64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub unmatched_results: u64,
    /// Commands waiting for a result.
    pub queued: usize,
    pub shared_memory_sends: u64,
    pub pipe_sends: u64,
    pub fallbacks: u64,
}

#[derive(Default)]
struct ChannelHealth {
    consecutive_failures: AtomicU32,
    last_failure_ms: AtomicU64,
}

impl ChannelHealth {
    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, now_ms: u64) -> u32 {
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Below the threshold, or rested long enough to be tried again.
    fn is_usable(&self, threshold: u32, recovery: Duration, now_ms: u64) -> bool {
        self.failures() < threshold
            || now_ms.saturating_sub(self.last_failure_ms.load(Ordering::Relaxed))
                >= recovery.as_millis() as u64
    }
}

#[derive(Default)]
struct Counters {
    commands_sent: AtomicU64,
    results_received: AtomicU64,
    shared_memory_sends: AtomicU64,
    pipe_sends: AtomicU64,
    fallbacks: AtomicU64,
}

struct Outbound {
    command: Command,
    correlated: bool,
}

struct Shared {
    config: BridgeConfig,
    shm: Option<Arc<SharedMemoryChannel>>,
    pipe: Option<Arc<ReliableChannel>>,
    pending: Arc<PendingTable>,
    limiter: BackpressureController,
    shm_health: ChannelHealth,
    pipe_health: ChannelHealth,
    counters: Counters,
    activity: watch::Sender<u64>,
    shutting_down: AtomicBool,
    created: Instant,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    fn health(&self, channel: Channel) -> &ChannelHealth {
        match channel {
            Channel::SharedMemory => &self.shm_health,
            Channel::Pipe => &self.pipe_health,
        }
    }

    fn status(&self, channel: Channel) -> ChannelStatus {
        let mode = self.config.ipc_mode;
        let (available, connected) = match channel {
            Channel::SharedMemory => (mode.uses_shared_memory() && self.shm.is_some(), true),
            Channel::Pipe => (
                mode.uses_pipe() && self.pipe.is_some(),
                self.pipe.as_ref().is_some_and(|p| p.is_alive()),
            ),
        };
        let health = self.health(channel);
        ChannelStatus {
            available,
            connected: available && connected,
            healthy: health.is_usable(
                self.config.failure_threshold,
                self.config.recovery_interval,
                self.now_ms(),
            ),
            consecutive_failures: health.failures(),
        }
    }

    /// Channels worth trying for a body of `len` bytes, preferred first.
    fn route(&self, len: usize) -> Vec<Channel> {
        let mut order = Vec::with_capacity(2);
        let shm = self.status(Channel::SharedMemory);
        if shm.available
            && shm.healthy
            && self.shm.as_ref().is_some_and(|s| s.fits_command(len))
        {
            order.push(Channel::SharedMemory);
        }
        let pipe = self.status(Channel::Pipe);
        if pipe.available && pipe.connected && pipe.healthy {
            order.push(Channel::Pipe);
        }
        order
    }

    async fn transmit(&self, command: &Command) -> Result<Channel> {
        let body = encode_command(command)?;
        let route = self.route(body.len());
        if route.is_empty() {
            return Err(RenderwireError::TransportUnavailable(format!(
                "no healthy channel for command {} ({} bytes)",
                command.id,
                body.len()
            )));
        }

        let mut last_error = None;
        for (attempt, channel) in route.into_iter().enumerate() {
            if attempt > 0 {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::info!(command_id = command.id, channel = channel.name(), "falling back");
            }
            let sent = match channel {
                Channel::SharedMemory => self.send_shared_memory(&body).await,
                Channel::Pipe => self.send_pipe(command.id, body.clone()).await,
            };
            match sent {
                Ok(()) => {
                    self.health(channel).record_success();
                    let counter = match channel {
                        Channel::SharedMemory => &self.counters.shared_memory_sends,
                        Channel::Pipe => &self.counters.pipe_sends,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(channel);
                }
                Err(e) => {
                    let failures = self.health(channel).record_failure(self.now_ms());
                    if failures == self.config.failure_threshold {
                        tracing::warn!(channel = channel.name(), failures, "channel marked unhealthy");
                    }
                    tracing::warn!(command_id = command.id, channel = channel.name(), error = %e, "send failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RenderwireError::TransportUnavailable("all channels failed".into())
        }))
    }

    async fn send_shared_memory(&self, body: &[u8]) -> Result<()> {
        let shm = self
            .shm
            .as_ref()
            .ok_or_else(|| RenderwireError::TransportUnavailable("no shared memory".into()))?;

        let deadline = Instant::now() + self.config.slot_wait;
        let mut backoff = Duration::from_micros(50);
        loop {
            match shm.write_command_body_async(body).await {
                Ok(_) => {
                    shm.signal_command_ready();
                    return Ok(());
                }
                Err(RenderwireError::SlotOccupied(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(2));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_pipe(&self, command_id: u64, body: Bytes) -> Result<()> {
        let pipe = self
            .pipe
            .as_ref()
            .ok_or_else(|| RenderwireError::TransportUnavailable("no pipe".into()))?;
        pipe.send(Frame::with_payload(MessageType::Command, command_id, body))
            .await
    }

    fn accept_result(&self, result: RenderResult, channel: Channel) {
        self.counters.results_received.fetch_add(1, Ordering::Relaxed);
        self.health(channel).record_success();
        self.activity.send_modify(|n| *n += 1);
        if !self.pending.complete(result) {
            tracing::debug!(channel = channel.name(), "late or unknown result discarded");
        }
    }
}

async fn send_loop(shared: Arc<Shared>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(Outbound {
        command,
        correlated,
    }) = outbound.recv().await
    {
        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }
        // A handle that already timed out or was dropped needs no send.
        if correlated && !shared.pending.contains(command.id) {
            continue;
        }
        if let Err(e) = shared.transmit(&command).await {
            if correlated {
                shared.pending.fail(command.id, e);
            }
        }
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let poll = shared.config.poll_interval;
    loop {
        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }
        match shared.shm.clone() {
            Some(shm) if shared.config.ipc_mode.uses_shared_memory() => {
                shm.wait_for_result(poll).await;
                loop {
                    match shm.read_result_async().await {
                        Ok(Some(result)) => shared.accept_result(result, Channel::SharedMemory),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "shared-memory result dropped");
                            break;
                        }
                    }
                }
            }
            _ => tokio::time::sleep(poll).await,
        }
        shared.pending.expire(Instant::now());
    }
}

async fn forward_activity(shared: Weak<Shared>, mut pipe_activity: watch::Receiver<u64>) {
    while pipe_activity.changed().await.is_ok() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.activity.send_modify(|n| *n += 1);
    }
}

/// Submits commands to the worker and correlates the results.
///
/// Shared memory is preferred when configured, healthy and large enough; the
/// pipe carries everything else. A command is assigned its id and timestamp
/// here and not touched again.
///
/// Must be created inside a tokio runtime.
pub struct TransportBridge {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportBridge {
    pub fn new(
        config: BridgeConfig,
        shm: Option<Arc<SharedMemoryChannel>>,
        pipe: Option<Arc<ReliableChannel>>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.max_in_flight.max(1));
        let limiter = BackpressureController::new(config.max_in_flight);
        let shared = Arc::new(Shared {
            config,
            shm,
            pipe,
            pending: Arc::new(PendingTable::default()),
            limiter,
            shm_health: ChannelHealth::default(),
            pipe_health: ChannelHealth::default(),
            counters: Counters::default(),
            activity: watch::channel(0).0,
            shutting_down: AtomicBool::new(false),
            created: Instant::now(),
        });

        let mut tasks = vec![
            tokio::spawn(send_loop(shared.clone(), outbound_rx)),
            tokio::spawn(receive_loop(shared.clone())),
        ];

        if let Some(pipe) = &shared.pipe {
            let weak = Arc::downgrade(&shared);
            pipe.set_callback(Arc::new(move |frame: Frame| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match frame.decode_result() {
                    Ok(result) => shared.accept_result(result, Channel::Pipe),
                    Err(e) => tracing::warn!(
                        message_id = frame.message_id(),
                        error = %e,
                        "ignoring non-result pipe frame"
                    ),
                }
            }));
            tasks.push(tokio::spawn(forward_activity(
                Arc::downgrade(&shared),
                pipe.subscribe_activity(),
            )));
        }

        tracing::debug!(
            mode = ?shared.config.ipc_mode,
            shared_memory = shared.shm.is_some(),
            pipe = shared.pipe.is_some(),
            "transport bridge started"
        );

        Self {
            shared,
            outbound,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    fn stamp(&self, mut command: Command) -> Command {
        command.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        command.timestamp = now_millis();
        command
    }

    fn submit(&self, command: Command, timeout: Duration) -> PendingResult {
        let command = self.stamp(command);
        let command_id = command.id;
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return PendingResult::ready(command_id, Err(RenderwireError::Shutdown));
        }

        let slot = match self.shared.limiter.try_acquire() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(command_id, in_flight = self.shared.limiter.in_flight(), "too many commands in flight");
                return PendingResult::ready(command_id, Err(e));
            }
        };

        let pending = self.shared.pending.register(command_id, timeout, Some(slot));
        let queued = self.outbound.try_send(Outbound {
            command,
            correlated: true,
        });
        if queued.is_err() {
            self.shared
                .pending
                .fail(command_id, RenderwireError::BackpressureTimeout);
        }
        pending
    }

    /// Submit without waiting. The handle resolves to the result, to
    /// `Timeout` after the configured window, or to the transport error.
    pub fn send_async(&self, command: Command) -> PendingResult {
        self.submit(command, self.shared.config.command_timeout)
    }

    /// Submit and wait up to `timeout` for the result.
    pub async fn send_sync(&self, command: Command, timeout: Duration) -> Result<RenderResult> {
        self.submit(command, timeout).await
    }

    /// Best-effort send with no correlation. Returns whether it was queued.
    pub fn send_fire_and_forget(&self, command: Command) -> bool {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        let command = self.stamp(command);
        self.outbound
            .try_send(Outbound {
                command,
                correlated: false,
            })
            .is_ok()
    }

    /// Expire overdue commands now rather than at the next sweep.
    pub fn expire_overdue(&self) -> usize {
        self.shared.pending.expire(Instant::now())
    }

    /// Whether any permitted channel can carry traffic.
    pub fn is_healthy(&self) -> bool {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        [Channel::SharedMemory, Channel::Pipe].into_iter().any(|c| {
            let s = self.shared.status(c);
            s.available && s.connected && s.healthy
        })
    }

    pub fn channel_status(&self, channel: Channel) -> ChannelStatus {
        self.shared.status(channel)
    }

    pub fn shared_memory(&self) -> Option<&Arc<SharedMemoryChannel>> {
        self.shared.shm.as_ref()
    }

    pub fn pipe(&self) -> Option<&Arc<ReliableChannel>> {
        self.shared.pipe.as_ref()
    }

    /// Counter bumped on every inbound result or pipe heartbeat.
    pub fn subscribe_activity(&self) -> watch::Receiver<u64> {
        self.shared.activity.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.shared.counters;
        let pending = &self.shared.pending;
        BridgeStats {
            commands_sent: c.commands_sent.load(Ordering::Relaxed),
            results_received: c.results_received.load(Ordering::Relaxed),
            average_round_trip_ms: pending.average_round_trip_ms(),
            commands_failed: pending.failed(),
            commands_timed_out: pending.timed_out(),
            unmatched_results: pending.unmatched(),
            queued: pending.len(),
            shared_memory_sends: c.shared_memory_sends.load(Ordering::Relaxed),
            pipe_sends: c.pipe_sends.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Cancel every pending command with `Shutdown` and stop the background
    /// tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.shared.pending.cancel_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(pipe) = &self.shared.pipe {
            pipe.clear_callback();
        }
        tracing::debug!(cancelled, "transport bridge shut down");
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, ContentParameters, ContentSourceKind};

    fn shm_pair() -> (tempfile::TempDir, Arc<SharedMemoryChannel>, SharedMemoryChannel) {
        let dir = tempfile::tempdir().unwrap();
        let controller =
            SharedMemoryChannel::create_in(dir.path(), "bridge.shm", 64 * 1024, 0.5).unwrap();
        let worker = SharedMemoryChannel::connect_in(dir.path(), "bridge.shm").unwrap();
        (dir, Arc::new(controller), worker)
    }

    /// Answers every command on the shared-memory slot until aborted.
    fn echo_worker(worker: SharedMemoryChannel) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                worker.wait_for_command(Duration::from_millis(5)).await;
                while let Ok(Some(cmd)) = worker.read_command() {
                    let mut result = RenderResult::success(&cmd);
                    result.render_time_ms = 1;
                    while matches!(
                        worker.write_result(&result),
                        Err(RenderwireError::SlotOccupied(_))
                    ) {
                        tokio::time::sleep(Duration::from_micros(200)).await;
                    }
                    worker.signal_result_ready();
                }
            }
        })
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (_dir, shm, worker) = shm_pair();
        let _worker = echo_worker(worker);
        let bridge = TransportBridge::new(
            BridgeConfig::default().ipc_mode(IpcMode::SharedMemory),
            Some(shm),
            None,
        );

        let first = bridge.send_async(Command::new(CommandKind::Initialize, 1));
        let second = bridge.send_async(Command::new(CommandKind::Render, 1));
        assert_eq!(first.command_id(), 1);
        assert_eq!(second.command_id(), 2);

        assert_eq!(first.await.unwrap().command_id, 1);
        assert_eq!(second.await.unwrap().command_id, 2);
        assert_eq!(bridge.stats().shared_memory_sends, 2);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_resolve_to_their_own_results() {
        let (_dir, shm, worker) = shm_pair();
        let _worker = echo_worker(worker);
        let bridge = Arc::new(TransportBridge::new(
            BridgeConfig::default().ipc_mode(IpcMode::SharedMemory),
            Some(shm),
            None,
        ));

        let handles: Vec<_> = (0..16u32)
            .map(|w| bridge.send_async(Command::new(CommandKind::Render, w)))
            .collect();
        for handle in handles {
            let id = handle.command_id();
            let result = handle.await.unwrap();
            assert_eq!(result.command_id, id);
        }
        assert_eq!(bridge.stats().results_received, 16);
    }

    #[tokio::test]
    async fn test_no_channel_fails_fast() {
        let bridge = TransportBridge::new(BridgeConfig::default(), None, None);
        let err = bridge
            .send_sync(Command::new(CommandKind::Render, 1), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderwireError::TransportUnavailable(_)));
        assert!(!bridge.is_healthy());
        assert_eq!(bridge.stats().commands_failed, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_pipe_peer_is_not_routed() {
        use crate::transport::{generate_pipe_path, ReliableConfig};

        let path = generate_pipe_path("rw-bridge-silent");
        let pipe = ReliableChannel::listen(
            &path,
            ReliableConfig::default().heartbeat_interval(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        let _peer = tokio::net::UnixStream::connect(&path).await.unwrap();
        pipe.wait_for_connection(Duration::from_secs(2))
            .await
            .unwrap();
        let bridge = TransportBridge::new(
            BridgeConfig::default().ipc_mode(IpcMode::NamedPipe),
            None,
            Some(Arc::new(pipe)),
        );
        assert!(bridge.channel_status(Channel::Pipe).connected);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!bridge.channel_status(Channel::Pipe).connected);

        let started = Instant::now();
        let Err(err) = bridge
            .send_sync(Command::new(CommandKind::Render, 1), Duration::from_secs(5))
            .await
        else {
            panic!("send over a dead pipe succeeded");
        };
        assert!(matches!(err, RenderwireError::TransportUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let (_dir, shm, _worker) = shm_pair();
        let bridge = TransportBridge::new(
            BridgeConfig::default().ipc_mode(IpcMode::SharedMemory),
            Some(shm),
            None,
        );
        let err = bridge
            .send_sync(Command::new(CommandKind::Render, 1), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderwireError::Timeout { command_id: 1 }));
        assert_eq!(bridge.stats().commands_timed_out, 1);
    }

    #[tokio::test]
    async fn test_oversized_command_without_pipe_is_rejected() {
        let (_dir, shm, _worker) = shm_pair();
        let bridge = TransportBridge::new(BridgeConfig::default(), Some(shm), None);
        let big = ContentParameters::from_source(ContentSourceKind::Web, "x".repeat(64 * 1024));
        let err = bridge
            .send_sync(
                Command::new(CommandKind::UpdateContent, 1).with_content(big),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RenderwireError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_occupied_slot_marks_channel_unhealthy() {
        let (_dir, shm, _worker) = shm_pair();
        let bridge = TransportBridge::new(
            BridgeConfig::default()
                .ipc_mode(IpcMode::SharedMemory)
                .slot_wait(Duration::from_millis(5))
                .recovery_interval(Duration::from_secs(60)),
            Some(shm),
            None,
        );

        // The first command fills the slot; nobody drains it.
        let _first = bridge.send_async(Command::new(CommandKind::Render, 1));
        for _ in 0..3 {
            let err = bridge
                .send_sync(Command::new(CommandKind::Render, 1), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, RenderwireError::SlotOccupied(_)));
        }
        let status = bridge.channel_status(Channel::SharedMemory);
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 3);

        let err = bridge
            .send_sync(Command::new(CommandKind::Render, 1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderwireError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let (_dir, shm, _worker) = shm_pair();
        let bridge = TransportBridge::new(BridgeConfig::default(), Some(shm), None);
        let pending = bridge.send_async(Command::new(CommandKind::Render, 1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        bridge.shutdown();
        assert!(matches!(pending.await, Err(RenderwireError::Shutdown)));
        assert!(matches!(
            bridge.send_async(Command::new(CommandKind::Render, 1)).await,
            Err(RenderwireError::Shutdown)
        ));
        assert!(!bridge.send_fire_and_forget(Command::new(CommandKind::Render, 1)));
    }

    #[tokio::test]
    async fn test_in_flight_limit() {
        let (_dir, shm, _worker) = shm_pair();
        let bridge = TransportBridge::new(
            BridgeConfig::default().max_in_flight(1),
            Some(shm),
            None,
        );
        let _held = bridge.send_async(Command::new(CommandKind::Render, 1));
        assert!(matches!(
            bridge.send_async(Command::new(CommandKind::Render, 2)).await,
            Err(RenderwireError::BackpressureTimeout)
        ));
    }

    #[test]
    fn test_config_from_render_config() {
        let render = RenderConfig {
            ipc_mode: IpcMode::NamedPipe,
            command_timeout_ms: 750,
            ..RenderConfig::default()
        };
        let config = BridgeConfig::from(&render);
        assert_eq!(config.ipc_mode, IpcMode::NamedPipe);
        assert_eq!(config.command_timeout, Duration::from_millis(750));
        assert_eq!(config.failure_threshold, 3);
    }
}
