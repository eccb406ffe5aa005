//! Render handlers invoked by the worker endpoint.
//!
//! A handler turns one [`Command`] into one [`RenderResult`]. Closures are
//! wrapped with [`handler_fn`]; [`StubRenderer`] is a self-contained handler
//! used by tests and the demo worker.

use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::{
    BackendKind, Command, CommandKind, ContentSourceKind, RenderResult, ResultStatus,
};

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces the result for a command.
pub trait RenderHandler: Send + Sync + 'static {
    fn handle(&self, command: Command) -> BoxFuture<'static, RenderResult>;
}

/// Adapter turning an async closure into a [`RenderHandler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RenderResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> RenderHandler for FnHandler<F, Fut>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RenderResult> + Send + 'static,
{
    fn handle(&self, command: Command) -> BoxFuture<'static, RenderResult> {
        Box::pin((self.handler)(command))
    }
}

/// Wrap `handler` so it can be served.
///
/// ```ignore
/// let handler = handler_fn(|cmd: Command| async move { RenderResult::success(&cmd) });
/// ```
pub fn handler_fn<F, Fut>(handler: F) -> FnHandler<F, Fut>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RenderResult> + Send + 'static,
{
    FnHandler {
        handler,
        _phantom: PhantomData,
    }
}

/// Handler that pretends to render.
///
/// It tracks initialized widgets, rejects backends it was told not to
/// support, validates bounds and content, and reports a non-zero render time
/// for every successful command.
pub struct StubRenderer {
    render_delay: Duration,
    unsupported: Vec<BackendKind>,
    widgets: Mutex<HashSet<u32>>,
}

impl StubRenderer {
    pub fn new() -> Self {
        Self {
            render_delay: Duration::from_millis(1),
            unsupported: Vec::new(),
            widgets: Mutex::new(HashSet::new()),
        }
    }

    /// Time spent per Render or UpdateContent command.
    pub fn render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    /// Answer `BackendUnsupported` when initializing with `backend`.
    pub fn without_backend(mut self, backend: BackendKind) -> Self {
        self.unsupported.push(backend);
        self
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.lock().len()
    }

    /// Check a command against current state without doing any work.
    fn check(&self, command: &Command) -> Result<(), (ResultStatus, String)> {
        let widgets = self.widgets.lock();
        let known = widgets.contains(&command.widget_id);
        match command.kind {
            CommandKind::Initialize => {
                if self.unsupported.contains(&command.backend_hint) {
                    return Err((
                        ResultStatus::BackendUnsupported,
                        format!("backend {:?} is not available", command.backend_hint),
                    ));
                }
                if command.bounds.is_empty() {
                    return Err((ResultStatus::InvalidParams, "empty bounds".into()));
                }
            }
            CommandKind::GetSystemSnapshot | CommandKind::GetProcessSnapshot => {}
            _ if !known => {
                return Err((
                    ResultStatus::InvalidParams,
                    format!("widget {} is not initialized", command.widget_id),
                ));
            }
            CommandKind::Resize if command.bounds.is_empty() => {
                return Err((ResultStatus::InvalidParams, "empty bounds".into()));
            }
            CommandKind::SwitchBackend if self.unsupported.contains(&command.backend_hint) => {
                return Err((
                    ResultStatus::BackendUnsupported,
                    format!("backend {:?} is not available", command.backend_hint),
                ));
            }
            CommandKind::UpdateContent | CommandKind::Render
                if command.content_params.source_kind != ContentSourceKind::Static
                    && command.content_params.source_url.is_empty() =>
            {
                return Err((ResultStatus::ContentError, "content source has no URL".into()));
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&self, command: &Command) {
        let mut widgets = self.widgets.lock();
        match command.kind {
            CommandKind::Initialize => {
                widgets.insert(command.widget_id);
            }
            CommandKind::Destroy => {
                widgets.remove(&command.widget_id);
            }
            _ => {}
        }
    }
}

impl Default for StubRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderHandler for StubRenderer {
    fn handle(&self, command: Command) -> BoxFuture<'static, RenderResult> {
        let started = Instant::now();
        if let Err((status, message)) = self.check(&command) {
            tracing::debug!(command_id = command.id, ?status, %message, "rejecting command");
            return Box::pin(async move { RenderResult::failure(&command, status, message) });
        }
        self.apply(&command);

        let delay = match command.kind {
            CommandKind::Render | CommandKind::UpdateContent => self.render_delay,
            _ => Duration::ZERO,
        };
        let frames = u32::from(command.kind == CommandKind::Render);
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let elapsed_ms = (started.elapsed().as_millis() as u64).max(1);
            RenderResult {
                render_time_ms: elapsed_ms,
                frame_count: frames,
                avg_fps: if frames > 0 {
                    1000.0 / elapsed_ms as f32
                } else {
                    0.0
                },
                memory_mb: 1,
                ..RenderResult::success(&command)
            }
        })
    }
}
