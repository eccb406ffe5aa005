//! Render coordinator - widget registry, lifecycle and metrics.

mod events;
mod render_coordinator;
mod widget;

pub use events::{ErrorEvent, ReadyEvent};
pub use render_coordinator::{RenderCoordinator, RenderStats};
pub use widget::{PerformanceMetrics, WidgetInfo, WidgetState, WidgetSummary};
