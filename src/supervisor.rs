//! Worker process supervision.
//!
//! The supervisor spawns the worker, watches it from a monitor task and
//! restarts it according to the [`RestartPolicy`]:
//!
//! ```text
//! NotStarted ─start()─► Starting ─mark_running()─► Running
//!                          ▲                          │ exit
//!                          └──── Restarting ◄─────────┤
//!                                                     ├─► Stopped  (stop() or clean exit)
//!                                                     └─► Failed   (budget exhausted / policy)
//! ```
//!
//! Graceful shutdown closes the worker's stdin, waits for it to exit, and
//! kills it once the timeout passes.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{RenderConfig, RestartPolicy};
use crate::error::{RenderwireError, Result};
use crate::shm::default_segment_dir;

/// Lifecycle of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed,
}

impl ProcessState {
    /// A process exists or is about to.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Restarting
        )
    }
}

/// Notifications from the monitor task, delivered on a bounded queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { pid: u32 },
    Exited { exit_code: Option<i32> },
    Crashed { exit_code: Option<i32> },
    Restarted { pid: u32, attempt: u32 },
    RestartBudgetExhausted { attempts: u32 },
    /// The executable could not be launched again; the supervisor gives up.
    RespawnFailed { attempt: u32, error: String },
    Stopped { exit_code: Option<i32> },
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub restart_policy: RestartPolicy,
    pub max_restart_attempts: u32,
    pub restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub stop_timeout: Duration,
    pub event_capacity: usize,
    /// Passed to the worker as `--shared-memory=<path>`.
    pub shared_memory_path: Option<PathBuf>,
    /// Passed to the worker as `--named-pipe=<path>`.
    pub pipe_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::OnCrash,
            max_restart_attempts: 3,
            restart_delay: Duration::from_millis(2000),
            max_restart_delay: Duration::from_millis(30_000),
            stop_timeout: Duration::from_millis(10_000),
            event_capacity: 64,
            shared_memory_path: None,
            pipe_path: None,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn restart_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.restart_delay = delay;
        self.max_restart_delay = max;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn channel_paths(mut self, shared_memory: Option<PathBuf>, pipe: Option<PathBuf>) -> Self {
        self.shared_memory_path = shared_memory;
        self.pipe_path = pipe;
        self
    }

    /// Delay before restart number `attempt` (1-based).
    pub fn restart_delay_for(&self, attempt: u32) -> Duration {
        match self.restart_policy {
            RestartPolicy::ExponentialBackoff => {
                let factor = 1u32 << attempt.min(5);
                (self.restart_delay * factor).min(self.max_restart_delay)
            }
            _ => self.restart_delay * attempt.max(1),
        }
    }

    fn should_restart(&self, crashed: bool) -> bool {
        match self.restart_policy {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnCrash | RestartPolicy::ExponentialBackoff => crashed,
        }
    }

    fn worker_args(&self, args: &[String]) -> Vec<String> {
        let mut all = args.to_vec();
        if let Some(path) = &self.shared_memory_path {
            all.push(format!("--shared-memory={}", path.display()));
        }
        if let Some(path) = &self.pipe_path {
            all.push(format!("--named-pipe={}", path.display()));
        }
        all
    }
}

impl From<&RenderConfig> for SupervisorConfig {
    fn from(config: &RenderConfig) -> Self {
        let shared_memory = config
            .ipc_mode
            .uses_shared_memory()
            .then(|| default_segment_dir().join(&config.shared_memory_name));
        let pipe = config.ipc_mode.uses_pipe().then(|| config.pipe_path());
        Self::default()
            .restart_policy(config.effective_restart_policy())
            .max_restart_attempts(config.max_restart_attempts)
            .restart_delay(
                Duration::from_millis(config.restart_delay_ms),
                Duration::from_millis(config.max_restart_delay_ms),
            )
            .stop_timeout(config.stop_timeout())
            .event_capacity(config.event_queue_capacity)
            .channel_paths(shared_memory, pipe)
    }
}

struct Shared {
    config: SupervisorConfig,
    state: watch::Sender<ProcessState>,
    pid: AtomicU32,
    spawned_at: Mutex<Option<Instant>>,
    restart_count: AtomicU32,
    last_exit_code: Mutex<Option<i32>>,
    events: mpsc::Sender<SupervisorEvent>,
}

impl Shared {
    fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "worker state");
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "supervisor event queue full, dropping event");
        }
    }

    fn record_spawn(&self, child: &Child) -> u32 {
        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::Release);
        *self.spawned_at.lock() = Some(Instant::now());
        pid
    }

    fn record_exit(&self, exit_code: Option<i32>) {
        self.pid.store(0, Ordering::Release);
        *self.spawned_at.lock() = None;
        *self.last_exit_code.lock() = exit_code;
    }
}

fn spawn_child(program: &Path, args: &[String]) -> Result<Child> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Stop(Duration),
}

/// Close stdin, wait up to `timeout`, then kill.
async fn shut_down_child(child: &mut Child, timeout: Duration) -> Option<i32> {
    drop(child.stdin.take());
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "waiting for worker failed");
            None
        }
        Err(_) => {
            tracing::warn!(?timeout, "worker ignored shutdown request, killing");
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "failed to kill worker");
            }
            None
        }
    }
}

async fn monitor(
    shared: Arc<Shared>,
    program: PathBuf,
    args: Vec<String>,
    mut child: Child,
    mut stop_rx: watch::Receiver<Option<Duration>>,
) {
    let default_timeout = shared.config.stop_timeout;
    let mut attempt = 0u32;

    loop {
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = stop_rx.changed() => Wake::Stop((*stop_rx.borrow()).unwrap_or(default_timeout)),
        };

        let status = match wake {
            Wake::Stop(timeout) => {
                let exit_code = shut_down_child(&mut child, timeout).await;
                shared.record_exit(exit_code);
                shared.emit(SupervisorEvent::Stopped { exit_code });
                shared.set_state(ProcessState::Stopped);
                tracing::info!(?exit_code, "worker stopped");
                return;
            }
            Wake::Exited(status) => status,
        };

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let crashed = !matches!(&status, Ok(s) if s.success());
        shared.record_exit(exit_code);
        shared.emit(SupervisorEvent::Exited { exit_code });
        if crashed {
            tracing::warn!(?exit_code, "worker crashed");
            shared.emit(SupervisorEvent::Crashed { exit_code });
        } else {
            tracing::info!("worker exited");
        }

        if !shared.config.should_restart(crashed) {
            shared.set_state(if crashed {
                ProcessState::Failed
            } else {
                ProcessState::Stopped
            });
            return;
        }
        if attempt >= shared.config.max_restart_attempts {
            tracing::error!(attempts = attempt, "worker restart budget exhausted");
            shared.emit(SupervisorEvent::RestartBudgetExhausted { attempts: attempt });
            shared.set_state(ProcessState::Failed);
            return;
        }

        attempt += 1;
        shared.set_state(ProcessState::Restarting);
        let delay = shared.config.restart_delay_for(attempt);
        tracing::info!(attempt, ?delay, "restarting worker");

        let stopped = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = stop_rx.changed() => true,
        };
        if stopped {
            shared.emit(SupervisorEvent::Stopped { exit_code });
            shared.set_state(ProcessState::Stopped);
            return;
        }

        child = match spawn_child(&program, &args) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, program = %program.display(), "worker respawn failed");
                shared.emit(SupervisorEvent::RespawnFailed {
                    attempt,
                    error: e.to_string(),
                });
                shared.set_state(ProcessState::Failed);
                return;
            }
        };
        let pid = shared.record_spawn(&child);
        shared.restart_count.fetch_add(1, Ordering::Relaxed);
        shared.set_state(ProcessState::Starting);
        shared.emit(SupervisorEvent::Restarted { pid, attempt });
    }
}

/// Owns the worker process and its restart loop.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    events: tokio::sync::Mutex<mpsc::Receiver<SupervisorEvent>>,
    stop_tx: Mutex<Option<watch::Sender<Option<Duration>>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                state: watch::channel(ProcessState::NotStarted).0,
                pid: AtomicU32::new(0),
                spawned_at: Mutex::new(None),
                restart_count: AtomicU32::new(0),
                last_exit_code: Mutex::new(None),
                events: events_tx,
            }),
            events: tokio::sync::Mutex::new(events_rx),
            stop_tx: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Spawn the worker and enter `Starting`.
    ///
    /// The channel paths from the config are appended to `args`. Fails with
    /// `InvalidState` if a worker is already supervised.
    pub async fn start(&self, program: impl AsRef<Path>, args: &[String]) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            return Err(RenderwireError::InvalidState(format!(
                "worker already {state:?}"
            )));
        }
        // Reap a previous monitor that has already finished.
        if let Some(previous) = self.monitor.lock().take() {
            previous.abort();
        }

        let program = program.as_ref().to_path_buf();
        let args = self.shared.config.worker_args(args);
        self.shared.set_state(ProcessState::Starting);

        let child = match spawn_child(&program, &args) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, program = %program.display(), "worker spawn failed");
                self.shared.set_state(ProcessState::Failed);
                return Err(e);
            }
        };
        let pid = self.shared.record_spawn(&child);
        tracing::info!(pid, program = %program.display(), "worker started");
        self.shared.emit(SupervisorEvent::Started { pid });

        let (stop_tx, stop_rx) = watch::channel(None);
        *self.stop_tx.lock() = Some(stop_tx);
        *self.monitor.lock() = Some(tokio::spawn(monitor(
            self.shared.clone(),
            program,
            args,
            child,
            stop_rx,
        )));
        Ok(())
    }

    /// Record the worker handshake: `Starting` becomes `Running`.
    pub fn mark_running(&self) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state == ProcessState::Starting {
                *state = ProcessState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Request a graceful stop and wait for the monitor to finish.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let stop_tx = self.stop_tx.lock().take();
        let monitor = self.monitor.lock().take();
        let (Some(stop_tx), Some(monitor)) = (stop_tx, monitor) else {
            return Ok(());
        };

        let _ = stop_tx.send(Some(timeout));
        if let Err(e) = monitor.await {
            tracing::error!(error = %e, "supervisor monitor task failed");
        }
        // The monitor may have finished in Failed before the request landed.
        if self.state() != ProcessState::Failed {
            self.shared.set_state(ProcessState::Stopped);
        }
        Ok(())
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.shared.state.subscribe()
    }

    /// Wait until `predicate` holds for the state, up to `timeout`.
    pub async fn wait_for_state(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&ProcessState) -> bool,
    ) -> Result<ProcessState> {
        let mut rx = self.subscribe_state();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(predicate))
            .await
            .map(|r| r.map(|state| *state));
        match outcome {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(RenderwireError::Shutdown),
            Err(_) => Err(RenderwireError::InvalidState(format!(
                "worker still {:?} after {timeout:?}",
                self.state()
            ))),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Time since the current process was spawned.
    pub fn uptime(&self) -> Option<Duration> {
        self.shared.spawned_at.lock().map(|at| at.elapsed())
    }

    /// Restarts performed over the supervisor's lifetime.
    pub fn restart_count(&self) -> u32 {
        self.shared.restart_count.load(Ordering::Relaxed)
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        *self.shared.last_exit_code.lock()
    }

    /// Next queued event, if any.
    pub fn try_next_event(&self) -> Option<SupervisorEvent> {
        self.events.try_lock().ok()?.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub async fn next_event(&self, timeout: Duration) -> Option<SupervisorEvent> {
        let mut events = self.events.lock().await;
        tokio::time::timeout(timeout, events.recv()).await.ok().flatten()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Dropping the child kills it.
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fast(policy: RestartPolicy, attempts: u32) -> SupervisorConfig {
        SupervisorConfig::default()
            .restart_policy(policy)
            .max_restart_attempts(attempts)
            .restart_delay(Duration::from_millis(10), Duration::from_millis(100))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into()]
    }

    async fn drain(sup: &ProcessSupervisor) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        while let Some(e) = sup.next_event(Duration::from_millis(50)).await {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_linear_and_exponential_delays() {
        let linear = fast(RestartPolicy::OnCrash, 3);
        assert_eq!(linear.restart_delay_for(1), Duration::from_millis(10));
        assert_eq!(linear.restart_delay_for(3), Duration::from_millis(30));

        let exp = fast(RestartPolicy::ExponentialBackoff, 3);
        assert_eq!(exp.restart_delay_for(1), Duration::from_millis(20));
        assert_eq!(exp.restart_delay_for(2), Duration::from_millis(40));
        assert_eq!(exp.restart_delay_for(9), Duration::from_millis(100));
    }

    #[test]
    fn test_worker_args_carry_channel_paths() {
        let config = SupervisorConfig::default().channel_paths(
            Some(PathBuf::from("/dev/shm/rw.shm")),
            Some(PathBuf::from("/tmp/rw.sock")),
        );
        assert_eq!(
            config.worker_args(&["--verbose".into()]),
            vec![
                "--verbose".to_string(),
                "--shared-memory=/dev/shm/rw.shm".to_string(),
                "--named-pipe=/tmp/rw.sock".to_string(),
            ]
        );
    }

    #[test]
    fn test_auto_restart_off_means_never() {
        let render = RenderConfig {
            auto_restart: false,
            ..RenderConfig::default()
        };
        assert_eq!(
            SupervisorConfig::from(&render).restart_policy,
            RestartPolicy::Never
        );
    }

    #[tokio::test]
    async fn test_crash_loop_exhausts_budget() {
        let sup = ProcessSupervisor::new(fast(RestartPolicy::OnCrash, 3));
        sup.start("/bin/sh", &sh("exit 1")).await.unwrap();

        let state = sup
            .wait_for_state(Duration::from_secs(5), |s| *s == ProcessState::Failed)
            .await
            .unwrap();
        assert_eq!(state, ProcessState::Failed);
        assert_eq!(sup.restart_count(), 3);
        assert_eq!(sup.last_exit_code(), Some(1));
        assert_eq!(sup.pid(), None);

        let events = drain(&sup).await;
        let restarts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::Restarted { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(restarts, vec![1, 2, 3]);
        assert_eq!(
            events.last(),
            Some(&SupervisorEvent::RestartBudgetExhausted { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn test_respawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("worker");
        std::os::unix::fs::symlink("/bin/sh", &link).unwrap();

        // The worker removes its own executable and crashes.
        let script = format!("rm -f '{}'; exit 1", link.display());
        let sup = ProcessSupervisor::new(fast(RestartPolicy::OnCrash, 3));
        sup.start(&link, &sh(&script)).await.unwrap();

        let state = sup
            .wait_for_state(Duration::from_secs(5), |s| *s == ProcessState::Failed)
            .await
            .unwrap();
        assert_eq!(state, ProcessState::Failed);
        assert_eq!(sup.restart_count(), 0);

        let events = drain(&sup).await;
        assert!(events.contains(&SupervisorEvent::Crashed { exit_code: Some(1) }));
        assert!(matches!(
            events.last(),
            Some(SupervisorEvent::RespawnFailed { attempt: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted_on_crash_policy() {
        let sup = ProcessSupervisor::new(fast(RestartPolicy::OnCrash, 3));
        sup.start("/bin/sh", &sh("exit 0")).await.unwrap();
        sup.wait_for_state(Duration::from_secs(5), |s| *s == ProcessState::Stopped)
            .await
            .unwrap();
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_closes_stdin() {
        let sup = ProcessSupervisor::new(fast(RestartPolicy::OnCrash, 3));
        sup.start("cat", &[]).await.unwrap();
        assert!(sup.pid().is_some());
        assert!(sup.mark_running());
        assert!(sup.is_running());
        assert!(!sup.mark_running());
        assert!(sup.uptime().is_some());

        sup.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert_eq!(sup.last_exit_code(), Some(0));
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_kills_unresponsive_worker() {
        let sup = ProcessSupervisor::new(fast(RestartPolicy::Always, 3));
        sup.start("sleep", &["30".into()]).await.unwrap();

        let start = Instant::now();
        sup.stop(Duration::from_millis(100)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let sup = ProcessSupervisor::new(fast(RestartPolicy::Never, 0));
        sup.start("cat", &[]).await.unwrap();
        assert!(matches!(
            sup.start("cat", &[]).await,
            Err(RenderwireError::InvalidState(_))
        ));
        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let sup = ProcessSupervisor::new(SupervisorConfig::default());
        assert!(sup
            .start("/nonexistent/renderwire-worker", &[])
            .await
            .is_err());
        assert_eq!(sup.state(), ProcessState::Failed);
    }
}
