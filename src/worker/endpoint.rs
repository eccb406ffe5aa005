//! Worker side of both channels.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::handler::RenderHandler;
use crate::error::{RenderwireError, Result};
use crate::protocol::{encode_result, Command, Frame, RenderResult};
use crate::shm::SharedMemoryChannel;
use crate::transport::{ReliableChannel, ReliableConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long a result waits for the controller to drain the result slot
/// before it is sent over the pipe instead.
const RESULT_SLOT_WAIT: Duration = Duration::from_millis(500);

/// Channel locations handed to the worker on its command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerArgs {
    pub shared_memory: Option<PathBuf>,
    pub named_pipe: Option<PathBuf>,
}

impl WorkerArgs {
    /// Pick `--shared-memory=<path>` and `--named-pipe=<path>` out of
    /// `args`; anything else is ignored.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            if let Some(path) = arg.strip_prefix("--shared-memory=") {
                parsed.shared_memory = Some(PathBuf::from(path));
            } else if let Some(path) = arg.strip_prefix("--named-pipe=") {
                parsed.named_pipe = Some(PathBuf::from(path));
            }
        }
        parsed
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::args().skip(1))
    }
}

/// Counters for a serving worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub commands_handled: u64,
    pub results_via_shared_memory: u64,
    pub results_via_pipe: u64,
    pub dropped_results: u64,
    pub receive_errors: u64,
}

#[derive(Default)]
struct Counters {
    commands_handled: AtomicU64,
    results_via_shared_memory: AtomicU64,
    results_via_pipe: AtomicU64,
    dropped_results: AtomicU64,
    receive_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    SharedMemory,
    Pipe { message_id: u64 },
}

/// Reads commands from the controller and writes results back on the
/// channel each command arrived on.
pub struct WorkerEndpoint {
    shm: Option<SharedMemoryChannel>,
    pipe: Option<ReliableChannel>,
    counters: Counters,
}

impl WorkerEndpoint {
    /// Open every channel named in `args`.
    pub async fn connect(args: &WorkerArgs, pipe_config: ReliableConfig) -> Result<Self> {
        let shm = match &args.shared_memory {
            Some(path) => Some(open_segment(path)?),
            None => None,
        };
        let pipe = match &args.named_pipe {
            Some(path) => Some(ReliableChannel::connect(path, pipe_config).await?),
            None => None,
        };
        Self::from_channels(shm, pipe)
    }

    pub fn from_channels(
        shm: Option<SharedMemoryChannel>,
        pipe: Option<ReliableChannel>,
    ) -> Result<Self> {
        if shm.is_none() && pipe.is_none() {
            return Err(RenderwireError::Config(
                "worker needs a shared-memory segment or a pipe".into(),
            ));
        }
        Ok(Self {
            shm,
            pipe,
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        WorkerStats {
            commands_handled: load(&c.commands_handled),
            results_via_shared_memory: load(&c.results_via_shared_memory),
            results_via_pipe: load(&c.results_via_pipe),
            dropped_results: load(&c.dropped_results),
            receive_errors: load(&c.receive_errors),
        }
    }

    /// Serve commands until `shutdown` resolves, or until the pipe peer goes
    /// away when the pipe is the only channel.
    pub async fn serve<H, S>(&self, handler: H, shutdown: S) -> Result<WorkerStats>
    where
        H: RenderHandler,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(
            shared_memory = self.shm.is_some(),
            pipe = self.pipe.is_some(),
            "worker serving"
        );

        loop {
            if self.shm.is_none() && self.pipe.as_ref().is_some_and(|p| !p.is_connected()) {
                tracing::info!("controller disconnected");
                break;
            }
            let incoming = tokio::select! {
                _ = &mut shutdown => break,
                incoming = self.next_command() => incoming,
            };
            let Some((command, origin)) = incoming else {
                continue;
            };

            if let Origin::Pipe { message_id } = origin {
                if let Some(pipe) = &self.pipe {
                    if let Err(e) = pipe.send_ack(message_id).await {
                        tracing::debug!(message_id, error = %e, "ack not sent");
                    }
                }
            }

            let command_id = command.id;
            let widget_id = command.widget_id;
            let mut result = handler.handle(command).await;
            result.command_id = command_id;
            result.widget_id = widget_id;
            self.counters.commands_handled.fetch_add(1, Ordering::Relaxed);
            self.reply(&result, origin).await;
        }

        let stats = self.stats();
        tracing::info!(handled = stats.commands_handled, "worker stopped serving");
        Ok(stats)
    }

    async fn next_command(&self) -> Option<(Command, Origin)> {
        if let Some(shm) = &self.shm {
            if let Some(command) = self.read_shared_memory(shm).await {
                return Some((command, Origin::SharedMemory));
            }
        }

        match (&self.shm, &self.pipe) {
            (Some(shm), Some(pipe)) => {
                tokio::select! {
                    _ = shm.wait_for_command(POLL_INTERVAL) => None,
                    frame = pipe.receive(POLL_INTERVAL) => self.decode_pipe(frame),
                }
            }
            (Some(shm), None) => {
                shm.wait_for_command(POLL_INTERVAL).await;
                None
            }
            (None, Some(pipe)) => self.decode_pipe(pipe.receive(POLL_INTERVAL).await),
            (None, None) => None,
        }
    }

    async fn read_shared_memory(&self, shm: &SharedMemoryChannel) -> Option<Command> {
        match shm.read_command_async().await {
            Ok(command) => command,
            Err(e) => {
                self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "discarded shared-memory command");
                None
            }
        }
    }

    fn decode_pipe(&self, frame: Result<Option<Frame>>) -> Option<(Command, Origin)> {
        let frame = match frame {
            Ok(frame) => frame?,
            Err(e) => {
                self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "pipe receive failed");
                return None;
            }
        };
        match frame.decode_command() {
            Ok(command) => Some((
                command,
                Origin::Pipe {
                    message_id: frame.message_id(),
                },
            )),
            Err(e) => {
                self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(message_id = frame.message_id(), error = %e, "ignoring pipe frame");
                None
            }
        }
    }

    async fn reply(&self, result: &RenderResult, origin: Origin) {
        if origin == Origin::SharedMemory {
            match self.reply_shared_memory(result).await {
                Ok(()) => {
                    self.counters
                        .results_via_shared_memory
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => tracing::debug!(command_id = result.command_id, error = %e, "result falls back to pipe"),
            }
        }

        match &self.pipe {
            Some(pipe) => match pipe.send_result(result).await {
                Ok(()) => {
                    self.counters.results_via_pipe.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.dropped_results.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(command_id = result.command_id, error = %e, "result lost");
                }
            },
            None => {
                self.counters.dropped_results.fetch_add(1, Ordering::Relaxed);
                tracing::error!(command_id = result.command_id, "result lost, no channel left");
            }
        }
    }

    async fn reply_shared_memory(&self, result: &RenderResult) -> Result<()> {
        let shm = self
            .shm
            .as_ref()
            .ok_or_else(|| RenderwireError::TransportUnavailable("no shared memory".into()))?;
        let len = encode_result(result)?.len();
        if !shm.fits_result(len) {
            return Err(RenderwireError::Serialization(format!(
                "{len}-byte result exceeds the result half"
            )));
        }

        let deadline = Instant::now() + RESULT_SLOT_WAIT;
        loop {
            match shm.write_result_async(result).await {
                Ok(_) => {
                    shm.signal_result_ready();
                    return Ok(());
                }
                Err(RenderwireError::SlotOccupied(_))
                    if self.pipe.is_none() || Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_micros(200)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn open_segment(path: &Path) -> Result<SharedMemoryChannel> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RenderwireError::Config(format!("bad segment path {}", path.display())))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    SharedMemoryChannel::connect_in(dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, Rect};
    use crate::worker::StubRenderer;

    #[test]
    fn test_parse_args() {
        let args = WorkerArgs::parse([
            "--verbose",
            "--shared-memory=/dev/shm/rw.shm",
            "--named-pipe=/tmp/rw.sock",
        ]);
        assert_eq!(args.shared_memory, Some(PathBuf::from("/dev/shm/rw.shm")));
        assert_eq!(args.named_pipe, Some(PathBuf::from("/tmp/rw.sock")));
        assert_eq!(WorkerArgs::parse(Vec::<String>::new()), WorkerArgs::default());
    }

    #[test]
    fn test_endpoint_needs_a_channel() {
        assert!(matches!(
            WorkerEndpoint::from_channels(None, None),
            Err(RenderwireError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serves_shared_memory_commands() {
        let dir = tempfile::tempdir().unwrap();
        let controller =
            SharedMemoryChannel::create_in(dir.path(), "worker.shm", 64 * 1024, 0.5).unwrap();
        let endpoint = WorkerEndpoint::connect(
            &WorkerArgs {
                shared_memory: Some(dir.path().join("worker.shm")),
                named_pipe: None,
            },
            ReliableConfig::default(),
        )
        .await
        .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            endpoint
                .serve(StubRenderer::new(), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut init = Command::new(CommandKind::Initialize, 1).with_bounds(Rect::new(0, 0, 300, 150));
        init.id = 1;
        controller.write_command(&init).unwrap();
        controller.signal_command_ready();

        let mut result = None;
        for _ in 0..200 {
            controller.wait_for_result(Duration::from_millis(10)).await;
            if let Some(r) = controller.read_result().unwrap() {
                result = Some(r);
                break;
            }
        }
        let result = result.unwrap();
        assert_eq!(result.command_id, 1);
        assert!(result.is_success());

        stop_tx.send(()).unwrap();
        let stats = server.await.unwrap().unwrap();
        assert_eq!(stats.commands_handled, 1);
        assert_eq!(stats.results_via_shared_memory, 1);
    }
}
