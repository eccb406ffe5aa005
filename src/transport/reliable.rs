//! Reliable message channel over a pipe or socket.
//!
//! Each connection gets three tasks:
//!
//! ```text
//!            ┌─────────────┐   frames   ┌──────────────────────┐
//!  socket ──►│  read loop  │──────────► │ callback or inbound  │
//!            └─────────────┘            │ queue (receive())    │
//!            ┌─────────────┐            └──────────────────────┘
//!  socket ◄──│ writer task │◄── send() / heartbeat loop
//!            └─────────────┘
//! ```
//!
//! The listening side keeps accepting: a restarted worker that connects again
//! replaces the previous connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::pipe::{connect_pipe, PipeListener, PipeStream};
use crate::config::RenderConfig;
use crate::error::{RenderwireError, Result};
use crate::protocol::{
    Command, Frame, FrameBuffer, MessageType, RenderResult, DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Handler invoked from the read task for every command or result frame.
pub type MessageCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Missed heartbeat intervals tolerated before a connection counts as dead.
pub const HEARTBEAT_GRACE_INTERVALS: u32 = 3;

/// Reliable channel settings.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    pub heartbeat_interval: Duration,
    pub max_message_size: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub inbound_capacity: usize,
    pub writer: WriterConfig,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(5000),
            max_message_size: DEFAULT_MAX_PAYLOAD_SIZE,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(200),
            inbound_capacity: 256,
            writer: WriterConfig::default(),
        }
    }
}

impl ReliableConfig {
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn max_message_size(mut self, bytes: u64) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn connect_attempts(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_retry_delay = delay;
        self
    }

    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }
}

impl From<&RenderConfig> for ReliableConfig {
    fn from(config: &RenderConfig) -> Self {
        Self::default().heartbeat_interval(config.heartbeat_interval())
    }
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipeStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub acks_received: u64,
    pub connection_attempts: u64,
    pub disconnections: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Milliseconds since the last inbound frame.
    pub idle_ms: u64,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    acks_received: AtomicU64,
    connection_attempts: AtomicU64,
    disconnections: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Connection {
    generation: u64,
    writer: WriterHandle,
    tasks: Vec<JoinHandle<()>>,
    writer_task: JoinHandle<Result<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.writer_task.abort();
    }
}

struct Inner {
    path: PathBuf,
    config: ReliableConfig,
    created: Instant,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    callback: RwLock<Option<MessageCallback>>,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    counters: Counters,
    last_received_ms: AtomicU64,
    last_sent_ms: AtomicU64,
    connected: watch::Sender<bool>,
    activity: watch::Sender<u64>,
}

impl Inner {
    fn new(path: PathBuf, config: ReliableConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        Arc::new(Self {
            path,
            config,
            created: Instant::now(),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            callback: RwLock::new(None),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            counters: Counters::default(),
            last_received_ms: AtomicU64::new(0),
            last_sent_ms: AtomicU64::new(0),
            connected: watch::channel(false).0,
            activity: watch::channel(0).0,
        })
    }

    fn now_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    fn attach(self: &Arc<Self>, stream: PipeStream) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (reader, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, self.config.writer.clone());

        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
        let tasks = vec![
            tokio::spawn(read_loop(self.clone(), reader, generation)),
            tokio::spawn(heartbeat_loop(self.clone(), writer.clone(), generation)),
        ];

        let previous = self.connection.lock().replace(Connection {
            generation,
            writer,
            tasks,
            writer_task,
        });
        if previous.is_some() {
            tracing::info!(path = %self.path.display(), generation, "pipe peer reconnected, replacing connection");
        } else {
            tracing::info!(path = %self.path.display(), generation, "pipe connected");
        }
        drop(previous);
        self.connected.send_replace(true);
    }

    fn detach(&self, generation: u64, reason: &str) {
        let mut slot = self.connection.lock();
        if slot.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        let gone = slot.take();
        drop(slot);

        bump(&self.counters.disconnections);
        self.connected.send_replace(false);
        tracing::info!(path = %self.path.display(), generation, reason, "pipe disconnected");
        drop(gone);
    }

    fn current_writer(&self) -> Option<WriterHandle> {
        self.connection.lock().as_ref().map(|c| c.writer.clone())
    }

    fn dispatch(&self, frame: Frame) {
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
        bump(&self.counters.messages_received);

        match frame.message_type() {
            Some(MessageType::Heartbeat) => bump(&self.counters.heartbeats_received),
            Some(MessageType::Ack) => bump(&self.counters.acks_received),
            Some(MessageType::Command) | Some(MessageType::Result) => {
                let callback = self.callback.read().clone();
                match callback {
                    Some(cb) => cb(frame),
                    None => {
                        if self.inbound_tx.try_send(frame).is_err() {
                            bump(&self.counters.errors);
                            tracing::warn!("pipe inbound queue full, dropping message");
                        }
                    }
                }
            }
            None => {}
        }
        self.activity.send_modify(|n| *n += 1);
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(inner.config.max_message_size);
    let mut buf = vec![0u8; 64 * 1024];

    let reason = 'conn: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "closed by peer",
            Ok(n) => n,
            Err(e) => {
                bump(&inner.counters.errors);
                tracing::warn!(error = %e, "pipe read failed");
                break "read error";
            }
        };
        inner
            .counters
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        frames.extend(&buf[..n]);

        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => inner.dispatch(frame),
                Ok(None) => break,
                Err(e @ RenderwireError::ChecksumMismatch { .. }) => {
                    bump(&inner.counters.errors);
                    tracing::warn!(error = %e, "dropped corrupt pipe frame");
                }
                Err(e) => {
                    bump(&inner.counters.errors);
                    tracing::error!(error = %e, "pipe stream desynchronized");
                    break 'conn "protocol error";
                }
            }
        }
    };

    inner.detach(generation, reason);
}

/// Sends a heartbeat whenever the write side has been idle for a full
/// interval, and drops the connection once the peer has been silent for
/// longer than the grace period.
async fn heartbeat_loop(inner: Arc<Inner>, writer: WriterHandle, generation: u64) {
    let interval = inner.config.heartbeat_interval;
    let interval_ms = interval.as_millis() as u64;
    let grace_ms = interval_ms * HEARTBEAT_GRACE_INTERVALS as u64;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut sequence = 0u64;
    loop {
        ticker.tick().await;
        let now = inner.now_ms();
        let silent = now.saturating_sub(inner.last_received_ms.load(Ordering::Relaxed));
        if silent > grace_ms {
            bump(&inner.counters.errors);
            tracing::warn!(path = %inner.path.display(), silent_ms = silent, "pipe peer missed its heartbeats");
            inner.detach(generation, "heartbeat timeout");
            break;
        }

        let idle = now.saturating_sub(inner.last_sent_ms.load(Ordering::Relaxed));
        if idle < interval_ms {
            continue;
        }

        sequence += 1;
        let frame = Frame::heartbeat(sequence);
        let size = frame.wire_len() as u64;
        match writer.try_send(frame) {
            Ok(()) => {
                bump(&inner.counters.heartbeats_sent);
                inner.counters.bytes_sent.fetch_add(size, Ordering::Relaxed);
                inner.last_sent_ms.store(inner.now_ms(), Ordering::Relaxed);
            }
            Err(RenderwireError::ConnectionClosed) => break,
            Err(_) => {}
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: PipeListener) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                bump(&inner.counters.connection_attempts);
                inner.attach(stream);
            }
            Err(e) => {
                bump(&inner.counters.errors);
                tracing::warn!(error = %e, "pipe accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Reliable framed channel; the controller listens, the worker connects.
///
/// # Example
///
/// ```ignore
/// use renderwire::transport::{ReliableChannel, ReliableConfig};
///
/// let server = ReliableChannel::listen("/tmp/render.sock", ReliableConfig::default()).await?;
/// let client = ReliableChannel::connect("/tmp/render.sock", ReliableConfig::default()).await?;
/// client.send_result(&result).await?;
/// let frame = server.receive(Duration::from_secs(1)).await?;
/// ```
pub struct ReliableChannel {
    inner: Arc<Inner>,
    accept_task: Option<JoinHandle<()>>,
}

impl ReliableChannel {
    /// Bind `path` and accept connections in the background.
    pub async fn listen(path: impl AsRef<Path>, config: ReliableConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = PipeListener::bind(&path).await?;
        tracing::info!(path = %path.display(), "pipe listening");

        let inner = Inner::new(path, config);
        let accept_task = tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self {
            inner,
            accept_task: Some(accept_task),
        })
    }

    /// Connect to a listening controller, retrying per the config.
    pub async fn connect(path: impl AsRef<Path>, config: ReliableConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = connect_pipe(&path, config.connect_attempts, config.connect_retry_delay).await?;

        let inner = Inner::new(path, config);
        bump(&inner.counters.connection_attempts);
        inner.attach(stream);
        Ok(Self {
            inner,
            accept_task: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether this end accepts connections.
    pub fn is_listener(&self) -> bool {
        self.accept_task.is_some()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Connected and heard from within the heartbeat grace period.
    pub fn is_alive(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let grace = self.inner.config.heartbeat_interval.as_millis() as u64
            * HEARTBEAT_GRACE_INTERVALS as u64;
        let idle = self
            .inner
            .now_ms()
            .saturating_sub(self.inner.last_received_ms.load(Ordering::Relaxed));
        idle <= grace
    }

    /// Wait until a peer is connected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.connected.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|c| *c))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RenderwireError::ConnectionClosed),
            Err(_) => {
                bump(&self.inner.counters.timeouts);
                Err(RenderwireError::TransportUnavailable(format!(
                    "no pipe peer on {} within {timeout:?}",
                    self.inner.path.display()
                )))
            }
        }
    }

    /// Queue a frame on the current connection.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let writer = self.inner.current_writer().ok_or_else(|| {
            RenderwireError::TransportUnavailable("pipe not connected".into())
        })?;
        let size = frame.wire_len() as u64;
        match writer.send(frame).await {
            Ok(()) => {
                let c = &self.inner.counters;
                bump(&c.messages_sent);
                c.bytes_sent.fetch_add(size, Ordering::Relaxed);
                self.inner
                    .last_sent_ms
                    .store(self.inner.now_ms(), Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                bump(&self.inner.counters.errors);
                if matches!(e, RenderwireError::BackpressureTimeout) {
                    bump(&self.inner.counters.timeouts);
                }
                Err(e)
            }
        }
    }

    pub async fn send_command(&self, cmd: &Command) -> Result<()> {
        self.send(Frame::command(cmd)?).await
    }

    pub async fn send_result(&self, result: &RenderResult) -> Result<()> {
        self.send(Frame::result(result)?).await
    }

    /// Acknowledge receipt of `message_id`.
    pub async fn send_ack(&self, message_id: u64) -> Result<()> {
        self.send(Frame::ack(message_id)).await
    }

    /// Next queued command or result frame, or `None` after `timeout`.
    ///
    /// Frames only reach the queue while no callback is registered.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Frame>> {
        let mut rx = self.inner.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(RenderwireError::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }

    /// Deliver frames to `callback` from the read task instead of the queue.
    pub fn set_callback(&self, callback: MessageCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.inner.callback.write() = None;
    }

    /// Counter bumped on every inbound frame, heartbeats included.
    pub fn subscribe_activity(&self) -> watch::Receiver<u64> {
        self.inner.activity.subscribe()
    }

    /// Observe connect/disconnect transitions.
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn stats(&self) -> PipeStats {
        let c = &self.inner.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        PipeStats {
            bytes_sent: load(&c.bytes_sent),
            bytes_received: load(&c.bytes_received),
            messages_sent: load(&c.messages_sent),
            messages_received: load(&c.messages_received),
            heartbeats_sent: load(&c.heartbeats_sent),
            heartbeats_received: load(&c.heartbeats_received),
            acks_received: load(&c.acks_received),
            connection_attempts: load(&c.connection_attempts),
            disconnections: load(&c.disconnections),
            errors: load(&c.errors),
            timeouts: load(&c.timeouts),
            idle_ms: self
                .inner
                .now_ms()
                .saturating_sub(load(&self.inner.last_received_ms)),
        }
    }

    /// Drop the connection and stop accepting. Idempotent.
    pub fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let gone = self.inner.connection.lock().take();
        if gone.is_some() {
            self.inner.connected.send_replace(false);
            tracing::debug!(path = %self.inner.path.display(), "pipe closed");
        }
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, ResultStatus};
    use crate::transport::generate_pipe_path;

    fn fast() -> ReliableConfig {
        ReliableConfig::default()
            .heartbeat_interval(Duration::from_millis(50))
            .connect_attempts(5, Duration::from_millis(20))
    }

    async fn pair() -> (ReliableChannel, ReliableChannel) {
        let path = generate_pipe_path("rw-reliable");
        let server = ReliableChannel::listen(&path, fast()).await.unwrap();
        let client = ReliableChannel::connect(&path, fast()).await.unwrap();
        server
            .wait_for_connection(Duration::from_secs(2))
            .await
            .unwrap();
        (server, client)
    }

    fn command(id: u64) -> Command {
        let mut cmd = Command::new(CommandKind::Render, 2);
        cmd.id = id;
        cmd
    }

    #[tokio::test]
    async fn test_command_and_result_roundtrip() {
        let (server, client) = pair().await;

        server.send_command(&command(7)).await.unwrap();
        let frame = client
            .receive(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let cmd = frame.decode_command().unwrap();
        assert_eq!(cmd.id, 7);

        let result = RenderResult::failure(&cmd, ResultStatus::ContentError, "missing");
        client.send_result(&result).await.unwrap();
        let frame = server
            .receive(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.message_id(), 7);
        assert_eq!(frame.decode_result().unwrap(), result);

        assert_eq!(server.stats().messages_sent, 1);
        assert_eq!(server.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_callback_replaces_queue() {
        let (server, client) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_callback(Arc::new(move |frame: Frame| {
            let _ = tx.send(frame.message_id());
        }));

        for id in 1..=3 {
            client
                .send_result(&RenderResult::success(&command(id)))
                .await
                .unwrap();
        }
        for id in 1..=3 {
            assert_eq!(rx.recv().await, Some(id));
        }
        assert!(server
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_keep_connection_alive() {
        let (server, client) = pair().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(server.is_alive());
        assert!(client.is_alive());
        assert!(server.stats().heartbeats_received >= 1);
        assert!(client.stats().heartbeats_sent >= 1);
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped_after_grace() {
        let path = generate_pipe_path("rw-reliable-silent");
        let server = ReliableChannel::listen(&path, fast()).await.unwrap();
        // A peer that holds the socket open but never sends a byte.
        let _peer = tokio::net::UnixStream::connect(&path).await.unwrap();
        server
            .wait_for_connection(Duration::from_secs(2))
            .await
            .unwrap();

        let mut connection = server.subscribe_connection();
        tokio::time::timeout(Duration::from_secs(2), connection.wait_for(|c| !*c))
            .await
            .unwrap()
            .unwrap();
        assert!(!server.is_connected());
        assert!(!server.is_alive());
        assert_eq!(server.stats().disconnections, 1);
        assert!(matches!(
            server.send_command(&command(1)).await,
            Err(RenderwireError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_acks_are_counted_not_delivered() {
        let (server, client) = pair().await;
        client.send_ack(42).await.unwrap();

        let mut activity = server.subscribe_activity();
        tokio::time::timeout(Duration::from_secs(2), activity.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.stats().acks_received, 1);
        assert!(server
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let (server, client) = pair().await;
        let mut connection = server.subscribe_connection();
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), connection.wait_for(|c| !*c))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.stats().disconnections, 1);
        assert!(matches!(
            server.send_command(&command(1)).await,
            Err(RenderwireError::TransportUnavailable(_))
        ));

        let client = ReliableChannel::connect(server.path(), fast()).await.unwrap();
        server
            .wait_for_connection(Duration::from_secs(2))
            .await
            .unwrap();
        server.send_command(&command(2)).await.unwrap();
        let frame = client.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(frame.message_id(), 2);
        assert_eq!(server.stats().connection_attempts, 2);
    }

    #[tokio::test]
    async fn test_listener_removes_socket_on_drop() {
        let path = generate_pipe_path("rw-reliable-drop");
        let server = ReliableChannel::listen(&path, fast()).await.unwrap();
        assert!(path.exists());
        drop(server);

        // The listener lives in the accept task; give the abort a moment.
        for _ in 0..50 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }
}
