//! Widget registry and lifecycle on top of the transport bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::events::{ErrorEvent, EventQueues, ReadyEvent};
use super::widget::{PerformanceMetrics, WidgetInfo, WidgetState, WidgetSummary};
use crate::bridge::{BridgeConfig, Channel, TransportBridge};
use crate::config::{IpcMode, RenderConfig};
use crate::error::{RenderwireError, Result};
use crate::protocol::{
    BackendKind, Command, CommandKind, ContentParameters, ContentSourceKind, Rect,
    RenderProperties, RenderResult, ResultStatus, SurfaceHandle,
};
use crate::shm::SharedMemoryChannel;
use crate::supervisor::{ProcessState, ProcessSupervisor, SupervisorConfig, SupervisorEvent};
use crate::transport::{ReliableChannel, ReliableConfig};

/// Counters over the coordinator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    pub commands_issued: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub retries: u64,
    pub widgets_created: u64,
    pub widgets_destroyed: u64,
    pub widgets_pruned: u64,
    pub backend_switches: u64,
}

#[derive(Default)]
struct StatCounters {
    commands_issued: AtomicU64,
    commands_succeeded: AtomicU64,
    commands_failed: AtomicU64,
    retries: AtomicU64,
    widgets_created: AtomicU64,
    widgets_destroyed: AtomicU64,
    widgets_pruned: AtomicU64,
    backend_switches: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn describe_failure(result: &RenderResult) -> String {
    if result.error_message.is_empty() {
        format!("{:?}", result.status)
    } else {
        format!("{:?}: {}", result.status, result.error_message)
    }
}

struct Inner {
    config: RwLock<RenderConfig>,
    bridge: Arc<TransportBridge>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    widgets: RwLock<HashMap<u32, WidgetInfo>>,
    next_widget_id: AtomicU32,
    running: AtomicBool,
    stats: StatCounters,
    events: EventQueues,
    overall: Mutex<PerformanceMetrics>,
}

impl Inner {
    /// Send through the bridge, retrying transient failures.
    async fn execute(&self, command: Command) -> Result<RenderResult> {
        let (attempts, timeout) = {
            let config = self.config.read();
            (1 + config.command_retry_attempts, config.command_timeout())
        };
        let mut attempt = 1;
        loop {
            bump(&self.stats.commands_issued);
            match self.bridge.send_sync(command.clone(), timeout).await {
                Ok(result) => {
                    if result.is_success() {
                        bump(&self.stats.commands_succeeded);
                    } else {
                        bump(&self.stats.commands_failed);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    bump(&self.stats.retries);
                    tracing::debug!(
                        widget_id = command.widget_id,
                        kind = ?command.kind,
                        attempt,
                        error = %e,
                        "retrying command"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    bump(&self.stats.commands_failed);
                    return Err(e);
                }
            }
        }
    }

    /// Fold an outcome into the widget's metrics. Returns whether it succeeded.
    fn record_outcome(&self, widget_id: u32, outcome: &Result<RenderResult>) -> bool {
        let success = matches!(outcome, Ok(r) if r.is_success());
        if let Some(info) = self.widgets.write().get_mut(&widget_id) {
            match outcome {
                Ok(result) if success => info.metrics.record(result),
                _ => info.metrics.record_failure(),
            }
        }
        if !success {
            let message = match outcome {
                Ok(result) => describe_failure(result),
                Err(e) => e.to_string(),
            };
            self.events.error(Some(widget_id), message);
        }
        success
    }

    /// Issue `kind` for a widget after applying `update` optimistically;
    /// the update is rolled back unless the worker reports success.
    async fn widget_command(
        &self,
        widget_id: u32,
        kind: CommandKind,
        update: impl FnOnce(&mut WidgetInfo),
    ) -> Result<RenderResult> {
        let (snapshot, command) = {
            let mut widgets = self.widgets.write();
            let info = widgets
                .get_mut(&widget_id)
                .ok_or(RenderwireError::WidgetNotFound(widget_id))?;
            let snapshot = info.clone();
            update(info);
            info.touch();
            (snapshot, info.command(kind))
        };

        let outcome = self.execute(command).await;
        if !self.record_outcome(widget_id, &outcome) {
            if let Some(info) = self.widgets.write().get_mut(&widget_id) {
                info.restore(snapshot);
            }
            tracing::debug!(widget_id, ?kind, "rolled back widget update");
        }
        outcome
    }

    async fn initialize(&self, widget_id: u32) -> Result<RenderResult> {
        let command = self
            .widgets
            .read()
            .get(&widget_id)
            .map(|info| info.command(CommandKind::Initialize))
            .ok_or(RenderwireError::WidgetNotFound(widget_id))?;
        self.execute(command).await
    }

    fn activate(&self, widget_id: u32, result: &RenderResult) {
        if let Some(info) = self.widgets.write().get_mut(&widget_id) {
            info.state = WidgetState::Active;
            info.is_active = true;
            info.metrics.record(result);
            info.touch();
        }
        self.events.ready(widget_id);
    }

    fn deactivate_all(&self) {
        for info in self.widgets.write().values_mut() {
            info.is_active = false;
            info.state = WidgetState::Suspended;
        }
    }

    /// Replay Initialize (and the cached content) for every widget after the
    /// worker restarted.
    async fn reinitialize_all(&self) {
        let mut ids: Vec<u32> = self.widgets.read().keys().copied().collect();
        ids.sort_unstable();

        for widget_id in ids {
            let outcome = self.initialize(widget_id).await;
            match &outcome {
                Ok(result) if result.is_success() => self.activate(widget_id, result),
                Ok(result) => {
                    self.events.error(Some(widget_id), describe_failure(result));
                    continue;
                }
                Err(e) => {
                    self.events.error(Some(widget_id), e.to_string());
                    continue;
                }
            }

            let content = self
                .widgets
                .read()
                .get(&widget_id)
                .filter(|info| info.last_content.is_some())
                .map(|info| info.command(CommandKind::UpdateContent));
            if let Some(command) = content {
                let outcome = self.execute(command).await;
                self.record_outcome(widget_id, &outcome);
            }
        }
    }

    fn aggregate(&self) -> PerformanceMetrics {
        let widgets = self.widgets.read();
        PerformanceMetrics::aggregate(widgets.values().map(|w| &w.metrics))
    }

    fn prune_inactive(&self, timeout: Duration) -> Vec<u32> {
        let pruned: Vec<WidgetInfo> = {
            let mut widgets = self.widgets.write();
            let stale: Vec<u32> = widgets
                .values()
                .filter(|w| w.idle_for() > timeout)
                .map(|w| w.widget_id)
                .collect();
            stale.iter().filter_map(|id| widgets.remove(id)).collect()
        };

        pruned
            .into_iter()
            .map(|info| {
                bump(&self.stats.widgets_pruned);
                bump(&self.stats.widgets_destroyed);
                tracing::info!(widget_id = info.widget_id, idle = ?info.idle_for(), "pruning inactive widget");
                self.bridge.send_fire_and_forget(
                    Command::new(CommandKind::Destroy, info.widget_id)
                        .with_surface(info.target_surface),
                );
                info.widget_id
            })
            .collect()
    }

    fn perform_maintenance(&self) -> Vec<u32> {
        let (profiling, inactive_timeout) = {
            let config = self.config.read();
            (config.profiling_enabled, config.inactive_widget_timeout())
        };
        self.bridge.expire_overdue();

        let overall = self.aggregate();
        *self.overall.lock() = overall;
        if profiling {
            self.events.performance(overall);
        }
        self.prune_inactive(inactive_timeout)
    }
}

async fn maintenance_loop(inner: Arc<Inner>) {
    loop {
        let interval = {
            let config = inner.config.read();
            if config.profiling_enabled && config.profile_interval_ms > 0 {
                config.profile_interval()
            } else {
                Duration::from_secs(1)
            }
        };
        tokio::time::sleep(interval).await;
        inner.perform_maintenance();
    }
}

/// Completes the supervisor handshake once the worker is heard from.
async fn handshake_loop(inner: Arc<Inner>, supervisor: Arc<ProcessSupervisor>) {
    let mut activity = inner.bridge.subscribe_activity();
    while activity.changed().await.is_ok() {
        if supervisor.mark_running() {
            tracing::info!(pid = ?supervisor.pid(), "worker handshake complete");
        }
    }
}

#[derive(Serialize)]
struct Diagnostics {
    running: bool,
    healthy: bool,
    widget_count: usize,
    widgets: Vec<WidgetSummary>,
    render_stats: RenderStats,
    overall_metrics: PerformanceMetrics,
    bridge: crate::bridge::BridgeStats,
    shared_memory: crate::bridge::ChannelStatus,
    pipe: crate::bridge::ChannelStatus,
    worker: Option<WorkerDiagnostics>,
    ipc_mode: IpcMode,
}

#[derive(Serialize)]
struct WorkerDiagnostics {
    state: ProcessState,
    pid: Option<u32>,
    uptime_ms: Option<u64>,
    restart_count: u32,
    last_exit_code: Option<i32>,
}

/// Top-level render component.
///
/// Owns the widget registry and turns widget operations into commands sent
/// through the [`TransportBridge`]. The bridge and the optional supervisor are
/// injected by the host.
///
/// # Example
///
/// ```ignore
/// let coordinator = RenderCoordinator::new(config, bridge, Some(supervisor));
/// coordinator.start().await?;
/// let id = coordinator
///     .create_widget(SurfaceHandle(hwnd), Rect::new(0, 0, 300, 150), BackendKind::Auto)
///     .await?;
/// let result = coordinator
///     .render_widget_async(id, content, RenderProperties::default())
///     .await?;
/// ```
pub struct RenderCoordinator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RenderCoordinator {
    pub fn new(
        config: RenderConfig,
        bridge: Arc<TransportBridge>,
        supervisor: Option<ProcessSupervisor>,
    ) -> Self {
        let events = EventQueues::new(config.event_queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                bridge,
                supervisor: supervisor.map(Arc::new),
                widgets: RwLock::new(HashMap::new()),
                next_widget_id: AtomicU32::new(1),
                running: AtomicBool::new(false),
                stats: StatCounters::default(),
                events,
                overall: Mutex::new(PerformanceMetrics::default()),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open the channels `config.ipc_mode` asks for, wire a bridge over them
    /// and attach a supervisor when a worker executable is configured.
    ///
    /// The worker is not spawned until [`start`](Self::start).
    pub async fn launch(config: RenderConfig) -> Result<Self> {
        config.validate()?;

        let shm = if config.ipc_mode.uses_shared_memory() {
            Some(Arc::new(SharedMemoryChannel::create(
                &config.shared_memory_name,
                config.shared_memory_size,
            )?))
        } else {
            None
        };
        let pipe = if config.ipc_mode.uses_pipe() {
            Some(Arc::new(
                ReliableChannel::listen(config.pipe_path(), ReliableConfig::from(&config)).await?,
            ))
        } else {
            None
        };

        let bridge = Arc::new(TransportBridge::new(BridgeConfig::from(&config), shm, pipe));
        let supervisor = config
            .worker_process_path
            .as_ref()
            .map(|_| ProcessSupervisor::new(SupervisorConfig::from(&config)));
        Ok(Self::new(config, bridge, supervisor))
    }

    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.inner.bridge
    }

    pub fn supervisor(&self) -> Option<&ProcessSupervisor> {
        self.inner.supervisor.as_deref()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RenderwireError::InvalidState(
                "render coordinator is not running".into(),
            ))
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Launch the worker (when a supervisor and a worker path are configured)
    /// and the background maintenance task.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let config = self.inner.config.read().clone();
        if !config.enabled {
            self.inner.running.store(false, Ordering::Release);
            return Err(RenderwireError::InvalidState("rendering is disabled".into()));
        }

        let mut tasks = Vec::new();
        if let Some(supervisor) = &self.inner.supervisor {
            if let Some(path) = &config.worker_process_path {
                if let Err(e) = supervisor
                    .start(path, &config.worker_process_arguments)
                    .await
                {
                    self.inner.running.store(false, Ordering::Release);
                    return Err(e);
                }
            }
            tasks.push(tokio::spawn(handshake_loop(
                self.inner.clone(),
                supervisor.clone(),
            )));
        }
        tasks.push(tokio::spawn(maintenance_loop(self.inner.clone())));
        self.tasks.lock().extend(tasks);

        tracing::info!(mode = ?config.ipc_mode, "render coordinator started");
        Ok(())
    }

    /// Destroy all widgets, stop the worker and shut the bridge down.
    ///
    /// The bridge cannot be reused afterwards.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let widgets: Vec<WidgetInfo> = self.inner.widgets.write().drain().map(|(_, w)| w).collect();
        for info in &widgets {
            bump(&self.inner.stats.widgets_destroyed);
            self.inner.bridge.send_fire_and_forget(
                Command::new(CommandKind::Destroy, info.widget_id).with_surface(info.target_surface),
            );
        }

        let stopped = match &self.inner.supervisor {
            Some(supervisor) => supervisor.stop(timeout).await,
            None => Ok(()),
        };
        self.inner.bridge.shutdown();
        tracing::info!(widgets = widgets.len(), "render coordinator stopped");
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Widgets
    // ---------------------------------------------------------------------

    /// Register a widget and initialize it in the worker.
    ///
    /// `BackendKind::Auto` resolves to the configured default backend. If the
    /// worker does not support the backend, initialization is retried once
    /// with the fallback backend. On failure the widget is not registered.
    pub async fn create_widget(
        &self,
        surface: SurfaceHandle,
        bounds: Rect,
        backend_hint: BackendKind,
    ) -> Result<u32> {
        self.ensure_running()?;
        let (max_widgets, default_backend, fallback_backend) = {
            let config = self.inner.config.read();
            (
                config.max_concurrent_widgets,
                config.default_backend,
                config.fallback_backend,
            )
        };
        let backend = match backend_hint {
            BackendKind::Auto => default_backend,
            hint => hint,
        };

        let widget_id = {
            let mut widgets = self.inner.widgets.write();
            if widgets.len() >= max_widgets {
                return Err(RenderwireError::WidgetLimitReached(max_widgets));
            }
            let widget_id = self.inner.next_widget_id.fetch_add(1, Ordering::Relaxed);
            let mut info = WidgetInfo::new(widget_id, surface, bounds, backend);
            info.state = WidgetState::Initializing;
            widgets.insert(widget_id, info);
            widget_id
        };

        let mut outcome = self.inner.initialize(widget_id).await;
        let unsupported =
            matches!(&outcome, Ok(r) if r.status == ResultStatus::BackendUnsupported);
        if unsupported && backend != fallback_backend {
            tracing::warn!(widget_id, ?backend, fallback = ?fallback_backend, "backend unsupported, falling back");
            if let Some(info) = self.inner.widgets.write().get_mut(&widget_id) {
                info.backend_type = fallback_backend;
            }
            outcome = self.inner.initialize(widget_id).await;
        }

        match outcome {
            Ok(result) if result.is_success() => {
                self.inner.activate(widget_id, &result);
                bump(&self.inner.stats.widgets_created);
                tracing::info!(widget_id, "widget created");
                Ok(widget_id)
            }
            Ok(result) => {
                self.inner.widgets.write().remove(&widget_id);
                let message = describe_failure(&result);
                self.inner.events.error(Some(widget_id), message.clone());
                Err(RenderwireError::CommandFailed(message))
            }
            Err(e) => {
                self.inner.widgets.write().remove(&widget_id);
                self.inner.events.error(Some(widget_id), e.to_string());
                Err(e)
            }
        }
    }

    /// Remove a widget. The worker is told best-effort; the registry entry is
    /// removed regardless of its answer.
    pub async fn destroy_widget(&self, widget_id: u32) -> Result<()> {
        let info = self
            .inner
            .widgets
            .write()
            .remove(&widget_id)
            .ok_or(RenderwireError::WidgetNotFound(widget_id))?;
        bump(&self.inner.stats.widgets_destroyed);

        let command = Command::new(CommandKind::Destroy, widget_id).with_surface(info.target_surface);
        let timeout = self.inner.config.read().command_timeout();
        match self.inner.bridge.send_sync(command, timeout).await {
            Ok(result) if !result.is_success() => {
                tracing::debug!(widget_id, status = ?result.status, "worker refused destroy")
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(widget_id, error = %e, "destroy not delivered"),
        }
        tracing::info!(widget_id, "widget destroyed");
        Ok(())
    }

    pub async fn render_widget_async(
        &self,
        widget_id: u32,
        content: ContentParameters,
        properties: RenderProperties,
    ) -> Result<RenderResult> {
        self.inner
            .widget_command(widget_id, CommandKind::Render, |info| {
                info.last_content = Some(content);
                info.properties = properties;
            })
            .await
    }

    pub async fn update_widget_content_async(
        &self,
        widget_id: u32,
        content: ContentParameters,
    ) -> Result<RenderResult> {
        self.inner
            .widget_command(widget_id, CommandKind::UpdateContent, |info| {
                info.last_content = Some(content);
            })
            .await
    }

    pub async fn resize_widget_async(&self, widget_id: u32, bounds: Rect) -> Result<RenderResult> {
        self.inner
            .widget_command(widget_id, CommandKind::Resize, |info| info.bounds = bounds)
            .await
    }

    pub async fn switch_widget_backend_async(
        &self,
        widget_id: u32,
        backend: BackendKind,
    ) -> Result<RenderResult> {
        let outcome = self
            .inner
            .widget_command(widget_id, CommandKind::SwitchBackend, |info| {
                info.backend_type = backend
            })
            .await;
        if matches!(&outcome, Ok(r) if r.is_success()) {
            bump(&self.inner.stats.backend_switches);
        }
        outcome
    }

    /// Hide a widget in the worker.
    pub async fn suspend_widget(&self, widget_id: u32) -> Result<RenderResult> {
        self.inner
            .widget_command(widget_id, CommandKind::SetProperty, |info| {
                info.properties.visible = false;
                info.state = WidgetState::Suspended;
                info.is_active = false;
            })
            .await
    }

    pub async fn resume_widget(&self, widget_id: u32) -> Result<RenderResult> {
        self.inner
            .widget_command(widget_id, CommandKind::SetProperty, |info| {
                info.properties.visible = true;
                info.state = WidgetState::Active;
                info.is_active = true;
            })
            .await
    }

    /// Render every active widget with its cached content. Commands are in
    /// flight concurrently; results are returned by widget id.
    pub async fn render_all_widgets_async(&self) -> Vec<(u32, Result<RenderResult>)> {
        let mut commands: Vec<(u32, Command)> = {
            let mut widgets = self.inner.widgets.write();
            widgets
                .values_mut()
                .filter(|w| w.is_active)
                .map(|w| {
                    w.touch();
                    (w.widget_id, w.command(CommandKind::Render))
                })
                .collect()
        };
        commands.sort_unstable_by_key(|(id, _)| *id);

        let pending: Vec<_> = commands
            .into_iter()
            .map(|(id, command)| {
                bump(&self.inner.stats.commands_issued);
                (id, self.inner.bridge.send_async(command))
            })
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for (widget_id, handle) in pending {
            let outcome = handle.await;
            if self.inner.record_outcome(widget_id, &outcome) {
                bump(&self.inner.stats.commands_succeeded);
            } else {
                bump(&self.inner.stats.commands_failed);
            }
            results.push((widget_id, outcome));
        }
        results
    }

    pub fn get_active_widgets(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .inner
            .widgets
            .read()
            .values()
            .filter(|w| w.is_active)
            .map(|w| w.widget_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn widget_count(&self) -> usize {
        self.inner.widgets.read().len()
    }

    pub fn widget_info(&self, widget_id: u32) -> Option<WidgetInfo> {
        self.inner.widgets.read().get(&widget_id).cloned()
    }

    /// Backend suited to a content source.
    pub fn recommended_backend(&self, content: ContentSourceKind) -> BackendKind {
        match content {
            ContentSourceKind::Web | ContentSourceKind::Api | ContentSourceKind::Office => {
                BackendKind::Web
            }
            ContentSourceKind::Media => BackendKind::Gpu,
            _ => self.inner.config.read().default_backend,
        }
    }

    // ---------------------------------------------------------------------
    // Metrics and events
    // ---------------------------------------------------------------------

    pub fn get_widget_performance_metrics(&self, widget_id: u32) -> Result<PerformanceMetrics> {
        self.inner
            .widgets
            .read()
            .get(&widget_id)
            .map(|w| w.metrics)
            .ok_or(RenderwireError::WidgetNotFound(widget_id))
    }

    pub fn get_overall_performance_metrics(&self) -> PerformanceMetrics {
        self.inner.aggregate()
    }

    /// Figures computed by the last maintenance pass.
    pub fn last_sampled_metrics(&self) -> PerformanceMetrics {
        *self.inner.overall.lock()
    }

    pub fn stats(&self) -> RenderStats {
        let s = &self.inner.stats;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RenderStats {
            commands_issued: load(&s.commands_issued),
            commands_succeeded: load(&s.commands_succeeded),
            commands_failed: load(&s.commands_failed),
            retries: load(&s.retries),
            widgets_created: load(&s.widgets_created),
            widgets_destroyed: load(&s.widgets_destroyed),
            widgets_pruned: load(&s.widgets_pruned),
            backend_switches: load(&s.backend_switches),
        }
    }

    pub fn next_ready_event(&self) -> Option<ReadyEvent> {
        self.inner.events.next_ready()
    }

    pub fn next_error_event(&self) -> Option<ErrorEvent> {
        self.inner.events.next_error()
    }

    pub fn next_performance_sample(&self) -> Option<PerformanceMetrics> {
        self.inner.events.next_performance()
    }

    /// Aggregate metrics, expire overdue commands and prune idle widgets now.
    /// Returns the pruned widget ids. The background task does the same
    /// every profile interval.
    pub fn perform_maintenance(&self) -> Vec<u32> {
        self.inner.perform_maintenance()
    }

    /// React to supervisor events: crashes suspend widgets, restarts
    /// re-initialize them, and an exhausted budget or a failed respawn
    /// leaves them suspended for good.
    /// Returns the number of events handled.
    pub async fn process_pending_commands(&self) -> usize {
        self.inner.bridge.expire_overdue();
        let Some(supervisor) = self.inner.supervisor.clone() else {
            return 0;
        };

        let mut handled = 0;
        while let Some(event) = supervisor.try_next_event() {
            handled += 1;
            match event {
                SupervisorEvent::Crashed { exit_code } => {
                    self.inner.deactivate_all();
                    self.inner.events.error(
                        None,
                        RenderwireError::WorkerCrashed { exit_code }.to_string(),
                    );
                }
                SupervisorEvent::Restarted { pid, attempt } => {
                    tracing::info!(pid, attempt, "worker restarted, re-initializing widgets");
                    self.inner.reinitialize_all().await;
                }
                SupervisorEvent::RestartBudgetExhausted { attempts } => {
                    self.inner.deactivate_all();
                    self.inner.events.error(
                        None,
                        RenderwireError::RestartBudgetExhausted { attempts }.to_string(),
                    );
                }
                SupervisorEvent::RespawnFailed { attempt, error } => {
                    self.inner.deactivate_all();
                    self.inner.events.error(
                        None,
                        RenderwireError::RespawnFailed {
                            attempt,
                            reason: error,
                        }
                        .to_string(),
                    );
                }
                other => tracing::debug!(event = ?other, "supervisor event"),
            }
        }
        handled
    }

    // ---------------------------------------------------------------------
    // Health, diagnostics and settings
    // ---------------------------------------------------------------------

    pub fn validate_system_health(&self) -> bool {
        if !self.is_running() || !self.inner.bridge.is_healthy() {
            return false;
        }
        let supervised = self.inner.config.read().worker_process_path.is_some();
        match &self.inner.supervisor {
            Some(supervisor) if supervised => matches!(
                supervisor.state(),
                ProcessState::Starting | ProcessState::Running
            ),
            _ => true,
        }
    }

    /// JSON snapshot of the whole subsystem.
    pub fn diagnostic_info(&self) -> Result<String> {
        let mut widgets: Vec<WidgetSummary> = self
            .inner
            .widgets
            .read()
            .values()
            .map(WidgetInfo::summary)
            .collect();
        widgets.sort_unstable_by_key(|w| w.widget_id);

        let ipc_mode = self.inner.config.read().ipc_mode;
        let bridge = &self.inner.bridge;
        let diagnostics = Diagnostics {
            running: self.is_running(),
            healthy: self.validate_system_health(),
            widget_count: widgets.len(),
            widgets,
            render_stats: self.stats(),
            overall_metrics: self.get_overall_performance_metrics(),
            bridge: bridge.stats(),
            shared_memory: bridge.channel_status(Channel::SharedMemory),
            pipe: bridge.channel_status(Channel::Pipe),
            worker: self.inner.supervisor.as_ref().map(|s| WorkerDiagnostics {
                state: s.state(),
                pid: s.pid(),
                uptime_ms: s.uptime().map(|u| u.as_millis() as u64),
                restart_count: s.restart_count(),
                last_exit_code: s.last_exit_code(),
            }),
            ipc_mode,
        };
        Ok(serde_json::to_string_pretty(&diagnostics)?)
    }

    pub fn current_configuration(&self) -> Result<String> {
        self.inner.config.read().to_json()
    }

    /// Merge a partial JSON object into the live configuration.
    ///
    /// Widget limits, backends, retries, timeouts and profiling apply
    /// immediately; channel and worker settings take effect on the next start.
    pub fn update_render_settings(&self, settings: &str) -> Result<()> {
        let updated = self.inner.config.read().merged_with(settings)?;
        *self.inner.config.write() = updated;
        tracing::info!("render settings updated");
        Ok(())
    }
}

impl Drop for RenderCoordinator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
