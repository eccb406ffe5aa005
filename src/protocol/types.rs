//! Command and result types exchanged with the render worker.
//!
//! Every enum carries a stable numeric code; the codes are part of the wire
//! contract and must never be renumbered.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, used for command and result timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Rendering action requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Initialize,
    Render,
    Resize,
    Destroy,
    SwitchBackend,
    UpdateContent,
    SetProperty,
    GetSystemSnapshot,
    GetProcessSnapshot,
}

impl CommandKind {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            CommandKind::Initialize => 0,
            CommandKind::Render => 1,
            CommandKind::Resize => 2,
            CommandKind::Destroy => 3,
            CommandKind::SwitchBackend => 4,
            CommandKind::UpdateContent => 5,
            CommandKind::SetProperty => 6,
            CommandKind::GetSystemSnapshot => 100,
            CommandKind::GetProcessSnapshot => 101,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => CommandKind::Initialize,
            1 => CommandKind::Render,
            2 => CommandKind::Resize,
            3 => CommandKind::Destroy,
            4 => CommandKind::SwitchBackend,
            5 => CommandKind::UpdateContent,
            6 => CommandKind::SetProperty,
            100 => CommandKind::GetSystemSnapshot,
            101 => CommandKind::GetProcessSnapshot,
            _ => return None,
        })
    }
}

/// Outcome reported by the worker for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Pending,
    BackendUnsupported,
    ContentError,
    InvalidParams,
}

impl ResultStatus {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            ResultStatus::Success => 0,
            ResultStatus::Failure => 1,
            ResultStatus::Pending => 2,
            ResultStatus::BackendUnsupported => 3,
            ResultStatus::ContentError => 4,
            ResultStatus::InvalidParams => 5,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ResultStatus::Success,
            1 => ResultStatus::Failure,
            2 => ResultStatus::Pending,
            3 => ResultStatus::BackendUnsupported,
            4 => ResultStatus::ContentError,
            5 => ResultStatus::InvalidParams,
            _ => return None,
        })
    }
}

/// Rendering backend a widget is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// CPU rasterizer.
    Software,
    /// Hardware-accelerated renderer.
    Gpu,
    /// Embedded browser engine.
    Web,
    /// Let the worker pick.
    Auto,
}

impl BackendKind {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            BackendKind::Software => 0,
            BackendKind::Gpu => 1,
            BackendKind::Web => 2,
            BackendKind::Auto => 99,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => BackendKind::Software,
            1 => BackendKind::Gpu,
            2 => BackendKind::Web,
            99 => BackendKind::Auto,
            _ => return None,
        })
    }
}

/// Where a widget's content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSourceKind {
    #[default]
    Static,
    Web,
    Api,
    Media,
    File,
    Office,
    Custom,
}

impl ContentSourceKind {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            ContentSourceKind::Static => 0,
            ContentSourceKind::Web => 1,
            ContentSourceKind::Api => 2,
            ContentSourceKind::Media => 3,
            ContentSourceKind::File => 4,
            ContentSourceKind::Office => 5,
            ContentSourceKind::Custom => 99,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ContentSourceKind::Static,
            1 => ContentSourceKind::Web,
            2 => ContentSourceKind::Api,
            3 => ContentSourceKind::Media,
            4 => ContentSourceKind::File,
            5 => ContentSourceKind::Office,
            99 => ContentSourceKind::Custom,
            _ => return None,
        })
    }
}

/// Opaque handle of the surface a widget draws into (window handle on the
/// host side). The transport never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SurfaceHandle(pub u64);

/// Widget bounds in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rect with non-positive width or height cannot be rendered into.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
}

impl Default for Color {
    fn default() -> Self {
        Color::rgba(0, 0, 0, 255)
    }
}

/// Content source description handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentParameters {
    pub source_kind: ContentSourceKind,
    /// URL, file path or API endpoint.
    pub source_url: String,
    pub template_path: String,
    pub auth_token: String,
    pub refresh_interval_ms: i32,
    pub cache_enabled: bool,
    pub custom_headers: Vec<(String, String)>,
    pub parameters: Vec<(String, String)>,
}

impl ContentParameters {
    /// Content pointing at a single source.
    pub fn from_source(source_kind: ContentSourceKind, source_url: impl Into<String>) -> Self {
        Self {
            source_kind,
            source_url: source_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ContentParameters {
    fn default() -> Self {
        Self {
            source_kind: ContentSourceKind::Static,
            source_url: String::new(),
            template_path: String::new(),
            auth_token: String::new(),
            refresh_interval_ms: 0,
            cache_enabled: true,
            custom_headers: Vec::new(),
            parameters: Vec::new(),
        }
    }
}

/// Presentation properties of a widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderProperties {
    pub opacity: f32,
    pub visible: bool,
    pub click_through: bool,
    pub top_most: bool,
    pub background_color: Color,
    pub z_order: i32,
    pub enable_animations: bool,
    pub target_fps: i32,
    pub enable_vsync: bool,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation: f32,
    pub enable_blur: bool,
    pub blur_radius: f32,
    pub enable_shadow: bool,
    pub shadow_color: Color,
    pub shadow_offset_x: i32,
    pub shadow_offset_y: i32,
}

impl Default for RenderProperties {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            visible: true,
            click_through: false,
            top_most: false,
            background_color: Color::TRANSPARENT,
            z_order: 0,
            enable_animations: true,
            target_fps: 60,
            enable_vsync: true,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            enable_blur: false,
            blur_radius: 0.0,
            enable_shadow: false,
            shadow_color: Color::rgba(0, 0, 0, 128),
            shadow_offset_x: 2,
            shadow_offset_y: 2,
        }
    }
}

/// A render request for one widget.
///
/// `id` and `timestamp` are assigned by the bridge at submission; after that
/// the command is owned by the transport and never changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: u64,
    pub kind: CommandKind,
    pub widget_id: u32,
    pub target_surface: SurfaceHandle,
    pub backend_hint: BackendKind,
    pub bounds: Rect,
    pub content_params: ContentParameters,
    pub render_properties: RenderProperties,
    pub timestamp: u64,
}

impl Command {
    /// Create an unsent command for a widget.
    pub fn new(kind: CommandKind, widget_id: u32) -> Self {
        Self {
            id: 0,
            kind,
            widget_id,
            target_surface: SurfaceHandle::default(),
            backend_hint: BackendKind::Auto,
            bounds: Rect::default(),
            content_params: ContentParameters::default(),
            render_properties: RenderProperties::default(),
            timestamp: 0,
        }
    }

    pub fn with_surface(mut self, surface: SurfaceHandle) -> Self {
        self.target_surface = surface;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend_hint = backend;
        self
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_content(mut self, content: ContentParameters) -> Self {
        self.content_params = content;
        self
    }

    pub fn with_properties(mut self, properties: RenderProperties) -> Self {
        self.render_properties = properties;
        self
    }
}

/// The worker's answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    pub command_id: u64,
    pub widget_id: u32,
    pub status: ResultStatus,
    pub error_message: String,
    pub render_time_ms: u64,
    pub frame_count: u32,
    pub avg_fps: f32,
    pub memory_mb: u64,
    pub timestamp: u64,
}

impl RenderResult {
    /// Successful result for a command.
    pub fn success(command: &Command) -> Self {
        Self {
            command_id: command.id,
            widget_id: command.widget_id,
            status: ResultStatus::Success,
            error_message: String::new(),
            render_time_ms: 0,
            frame_count: 0,
            avg_fps: 0.0,
            memory_mb: 0,
            timestamp: now_millis(),
        }
    }

    /// Failed result carrying a human-readable message.
    pub fn failure(command: &Command, status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: message.into(),
            ..Self::success(command)
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_codes_roundtrip() {
        for kind in [
            CommandKind::Initialize,
            CommandKind::Render,
            CommandKind::Resize,
            CommandKind::Destroy,
            CommandKind::SwitchBackend,
            CommandKind::UpdateContent,
            CommandKind::SetProperty,
            CommandKind::GetSystemSnapshot,
            CommandKind::GetProcessSnapshot,
        ] {
            assert_eq!(CommandKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(CommandKind::from_code(7), None);
        assert_eq!(CommandKind::GetSystemSnapshot.code(), 100);
    }

    #[test]
    fn test_status_and_backend_codes() {
        assert_eq!(ResultStatus::from_code(3), Some(ResultStatus::BackendUnsupported));
        assert_eq!(ResultStatus::from_code(6), None);
        assert_eq!(BackendKind::from_code(99), Some(BackendKind::Auto));
        assert_eq!(BackendKind::from_code(3), None);
        assert_eq!(ContentSourceKind::from_code(99), Some(ContentSourceKind::Custom));
    }

    #[test]
    fn test_property_defaults() {
        let props = RenderProperties::default();
        assert_eq!(props.opacity, 1.0);
        assert!(props.visible);
        assert_eq!(props.target_fps, 60);
        assert_eq!(props.shadow_color, Color::rgba(0, 0, 0, 128));
        assert_eq!(props.background_color, Color::TRANSPARENT);
    }

    #[test]
    fn test_command_builder() {
        let cmd = Command::new(CommandKind::Initialize, 7)
            .with_surface(SurfaceHandle(0xABCD))
            .with_bounds(Rect::new(0, 0, 300, 150))
            .with_backend(BackendKind::Gpu);

        assert_eq!(cmd.id, 0);
        assert_eq!(cmd.widget_id, 7);
        assert_eq!(cmd.target_surface, SurfaceHandle(0xABCD));
        assert_eq!(cmd.bounds.width, 300);
        assert_eq!(cmd.backend_hint, BackendKind::Gpu);
    }

    #[test]
    fn test_result_constructors() {
        let mut cmd = Command::new(CommandKind::Render, 3);
        cmd.id = 42;

        let ok = RenderResult::success(&cmd);
        assert!(ok.is_success());
        assert_eq!(ok.command_id, 42);
        assert_eq!(ok.widget_id, 3);

        let failed = RenderResult::failure(&cmd, ResultStatus::ContentError, "404");
        assert!(!failed.is_success());
        assert_eq!(failed.error_message, "404");
        assert_eq!(failed.command_id, 42);
    }

    #[test]
    fn test_rect_is_empty() {
        assert!(Rect::new(0, 0, 0, 10).is_empty());
        assert!(!Rect::new(0, 0, 300, 150).is_empty());
    }
}
