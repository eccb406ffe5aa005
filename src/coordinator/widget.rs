//! Per-widget bookkeeping held by the coordinator.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::protocol::{
    BackendKind, Command, CommandKind, ContentParameters, Rect, RenderProperties, RenderResult,
    SurfaceHandle,
};

/// Widget lifecycle as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetState {
    Created,
    Initializing,
    Active,
    Suspended,
    Destroyed,
}

/// Rendering statistics for one widget, or aggregated over all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub current_fps: f32,
    pub average_fps: f32,
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub memory_usage_mb: u64,
    pub render_time_ms: u64,
    pub commands_completed: u64,
    pub commands_failed: u64,
}

impl PerformanceMetrics {
    /// Fold a successful result into the running figures.
    pub fn record(&mut self, result: &RenderResult) {
        self.commands_completed += 1;
        self.render_time_ms = result.render_time_ms;
        self.total_frames += u64::from(result.frame_count);
        self.memory_usage_mb = result.memory_mb;
        if result.avg_fps > 0.0 {
            self.current_fps = result.avg_fps;
            let n = self.commands_completed as f32;
            self.average_fps += (result.avg_fps - self.average_fps) / n;
        }
    }

    pub fn record_failure(&mut self) {
        self.commands_failed += 1;
    }

    /// Combine per-widget figures: rates are averaged, totals summed.
    pub fn aggregate<'a>(metrics: impl IntoIterator<Item = &'a PerformanceMetrics>) -> Self {
        let mut total = Self::default();
        let mut count = 0u32;
        for m in metrics {
            count += 1;
            total.current_fps += m.current_fps;
            total.average_fps += m.average_fps;
            total.total_frames += m.total_frames;
            total.dropped_frames += m.dropped_frames;
            total.memory_usage_mb += m.memory_usage_mb;
            total.render_time_ms = total.render_time_ms.max(m.render_time_ms);
            total.commands_completed += m.commands_completed;
            total.commands_failed += m.commands_failed;
        }
        if count > 0 {
            total.current_fps /= count as f32;
            total.average_fps /= count as f32;
        }
        total
    }
}

/// Registry entry for one widget.
#[derive(Debug, Clone)]
pub struct WidgetInfo {
    pub widget_id: u32,
    pub target_surface: SurfaceHandle,
    pub bounds: Rect,
    pub backend_type: BackendKind,
    pub last_activity: Instant,
    pub is_active: bool,
    pub properties: RenderProperties,
    pub last_content: Option<ContentParameters>,
    pub metrics: PerformanceMetrics,
    pub state: WidgetState,
}

impl WidgetInfo {
    pub(crate) fn new(
        widget_id: u32,
        target_surface: SurfaceHandle,
        bounds: Rect,
        backend_type: BackendKind,
    ) -> Self {
        Self {
            widget_id,
            target_surface,
            bounds,
            backend_type,
            last_activity: Instant::now(),
            is_active: false,
            properties: RenderProperties::default(),
            last_content: None,
            metrics: PerformanceMetrics::default(),
            state: WidgetState::Created,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// A command of `kind` carrying the widget's cached parameters.
    pub(crate) fn command(&self, kind: CommandKind) -> Command {
        Command::new(kind, self.widget_id)
            .with_surface(self.target_surface)
            .with_backend(self.backend_type)
            .with_bounds(self.bounds)
            .with_content(self.last_content.clone().unwrap_or_default())
            .with_properties(self.properties.clone())
    }

    /// Undo an optimistic update, keeping metrics and activity.
    pub(crate) fn restore(&mut self, snapshot: WidgetInfo) {
        self.bounds = snapshot.bounds;
        self.backend_type = snapshot.backend_type;
        self.properties = snapshot.properties;
        self.last_content = snapshot.last_content;
        self.state = snapshot.state;
        self.is_active = snapshot.is_active;
    }

    pub(crate) fn summary(&self) -> WidgetSummary {
        WidgetSummary {
            widget_id: self.widget_id,
            state: self.state,
            is_active: self.is_active,
            backend: self.backend_type,
            bounds: self.bounds,
            idle_ms: self.idle_for().as_millis() as u64,
            metrics: self.metrics,
        }
    }
}

/// Serializable view of a widget for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct WidgetSummary {
    pub widget_id: u32,
    pub state: WidgetState,
    pub is_active: bool,
    pub backend: BackendKind,
    pub bounds: Rect,
    pub idle_ms: u64,
    pub metrics: PerformanceMetrics,
}
