//! Render subsystem configuration.
//!
//! [`RenderConfig`] is the single serde model loaded from JSON; every field
//! has a default so partial documents are accepted. Component configs
//! ([`BridgeConfig`](crate::bridge::BridgeConfig),
//! [`SupervisorConfig`](crate::supervisor::SupervisorConfig),
//! [`ReliableConfig`](crate::transport::ReliableConfig)) are derived from it.
//!
//! # Example
//!
//! ```
//! use renderwire::config::RenderConfig;
//!
//! let config = RenderConfig::from_json(r#"{"max_concurrent_widgets": 8}"#).unwrap();
//! assert_eq!(config.max_concurrent_widgets, 8);
//! assert_eq!(config.command_timeout_ms, 5000);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RenderwireError, Result};
use crate::protocol::BackendKind;

/// Smallest shared-memory segment accepted by `create`.
pub const MIN_SHARED_MEMORY_SIZE: usize = 64 * 1024;

/// Largest shared-memory segment accepted by `create`.
pub const MAX_SHARED_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Default shared-memory segment size.
pub const DEFAULT_SHARED_MEMORY_SIZE: usize = 4 * 1024 * 1024;

/// Which channels the bridge may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMode {
    /// Shared memory only.
    SharedMemory,
    /// Reliable pipe only.
    NamedPipe,
    /// Shared memory first, pipe for large payloads and fallback.
    #[default]
    Hybrid,
}

impl IpcMode {
    pub fn uses_shared_memory(self) -> bool {
        matches!(self, IpcMode::SharedMemory | IpcMode::Hybrid)
    }

    pub fn uses_pipe(self) -> bool {
        matches!(self, IpcMode::NamedPipe | IpcMode::Hybrid)
    }
}

/// When the supervisor restarts an exited worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    /// Restart on non-zero exit or signal.
    #[default]
    OnCrash,
    /// Restart on any exit not requested through `stop`.
    Always,
    /// Like `OnCrash`, doubling the delay per attempt.
    ExponentialBackoff,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub enabled: bool,
    pub default_backend: BackendKind,
    pub fallback_backend: BackendKind,
    pub worker_process_path: Option<PathBuf>,
    pub worker_process_arguments: Vec<String>,
    pub auto_restart: bool,
    pub restart_policy: RestartPolicy,
    pub max_restart_attempts: u32,
    pub restart_delay_ms: u64,
    pub max_restart_delay_ms: u64,
    pub max_concurrent_widgets: usize,
    pub profiling_enabled: bool,
    pub profile_interval_ms: u64,
    pub inactive_widget_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub command_retry_attempts: u32,
    pub ipc_mode: IpcMode,
    pub shared_memory_name: String,
    pub shared_memory_size: usize,
    pub pipe_name: String,
    pub heartbeat_interval_ms: u64,
    pub event_queue_capacity: usize,
    pub stop_timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let pid = std::process::id();
        Self {
            enabled: true,
            default_backend: BackendKind::Auto,
            fallback_backend: BackendKind::Software,
            worker_process_path: None,
            worker_process_arguments: Vec::new(),
            auto_restart: true,
            restart_policy: RestartPolicy::OnCrash,
            max_restart_attempts: 3,
            restart_delay_ms: 2000,
            max_restart_delay_ms: 30_000,
            max_concurrent_widgets: 50,
            profiling_enabled: true,
            profile_interval_ms: 1000,
            inactive_widget_timeout_ms: 300_000,
            command_timeout_ms: 5000,
            command_retry_attempts: 2,
            ipc_mode: IpcMode::Hybrid,
            shared_memory_name: format!("renderwire-{pid}.shm"),
            shared_memory_size: DEFAULT_SHARED_MEMORY_SIZE,
            pipe_name: format!("renderwire-{pid}.sock"),
            heartbeat_interval_ms: 5000,
            event_queue_capacity: 64,
            stop_timeout_ms: 10_000,
        }
    }
}

impl RenderConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), "loaded render configuration");
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply a partial JSON object on top of this configuration.
    ///
    /// Keys absent from `patch` keep their current value. The merged result
    /// is validated before it is returned.
    pub fn merged_with(&self, patch: &str) -> Result<Self> {
        let patch: serde_json::Value = serde_json::from_str(patch)?;
        let patch = match patch {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(RenderwireError::Config(
                    "settings update must be a JSON object".into(),
                ))
            }
        };

        let mut current = serde_json::to_value(self)?;
        if let serde_json::Value::Object(fields) = &mut current {
            for (key, value) in patch {
                if !fields.contains_key(&key) {
                    return Err(RenderwireError::Config(format!("unknown setting `{key}`")));
                }
                fields.insert(key, value);
            }
        }

        let merged: Self = serde_json::from_value(current)?;
        merged.validate()?;
        Ok(merged)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("command_timeout_ms", self.command_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("inactive_widget_timeout_ms", self.inactive_widget_timeout_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(RenderwireError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.profiling_enabled && self.profile_interval_ms == 0 {
            return Err(RenderwireError::Config(
                "profile_interval_ms must be non-zero when profiling".into(),
            ));
        }
        if !(MIN_SHARED_MEMORY_SIZE..=MAX_SHARED_MEMORY_SIZE).contains(&self.shared_memory_size) {
            return Err(RenderwireError::Config(format!(
                "shared_memory_size {} outside {}..={}",
                self.shared_memory_size, MIN_SHARED_MEMORY_SIZE, MAX_SHARED_MEMORY_SIZE
            )));
        }
        if self.max_concurrent_widgets == 0 {
            return Err(RenderwireError::Config(
                "max_concurrent_widgets must be at least 1".into(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(RenderwireError::Config(
                "event_queue_capacity must be at least 1".into(),
            ));
        }
        if self.shared_memory_name.is_empty() || self.pipe_name.is_empty() {
            return Err(RenderwireError::Config("channel names must not be empty".into()));
        }
        Ok(())
    }

    /// Restart policy after applying the `auto_restart` switch.
    pub fn effective_restart_policy(&self) -> RestartPolicy {
        if self.auto_restart {
            self.restart_policy
        } else {
            RestartPolicy::Never
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn profile_interval(&self) -> Duration {
        Duration::from_millis(self.profile_interval_ms)
    }

    pub fn inactive_widget_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_widget_timeout_ms)
    }

    /// Path of the reliable-channel endpoint.
    ///
    /// A bare name is placed in the temp directory on Unix and under
    /// `\\.\pipe\` on Windows; names containing a separator are used as is.
    pub fn pipe_path(&self) -> PathBuf {
        endpoint_path(&self.pipe_name)
    }
}

#[cfg(unix)]
fn endpoint_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

#[cfg(windows)]
fn endpoint_path(name: &str) -> PathBuf {
    if name.starts_with(r"\\") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RenderConfig::default();
        assert!(config.enabled);
        assert!(config.auto_restart);
        assert_eq!(config.default_backend, BackendKind::Auto);
        assert_eq!(config.fallback_backend, BackendKind::Software);
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.restart_delay_ms, 2000);
        assert_eq!(config.max_concurrent_widgets, 50);
        assert_eq!(config.profile_interval_ms, 1000);
        assert_eq!(config.shared_memory_size, 4 * 1024 * 1024);
        assert_eq!(config.ipc_mode, IpcMode::Hybrid);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RenderConfig::from_json(
            r#"{"default_backend": "gpu", "ipc_mode": "named_pipe", "restart_policy": "exponential_backoff"}"#,
        )
        .unwrap();
        assert_eq!(config.default_backend, BackendKind::Gpu);
        assert_eq!(config.ipc_mode, IpcMode::NamedPipe);
        assert_eq!(config.restart_policy, RestartPolicy::ExponentialBackoff);
        assert_eq!(config.command_retry_attempts, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            r#"{"command_timeout_ms": 0}"#,
            r#"{"shared_memory_size": 1024}"#,
            r#"{"shared_memory_size": 33554432}"#,
            r#"{"max_concurrent_widgets": 0}"#,
            r#"{"event_queue_capacity": 0}"#,
        ];
        for json in bad {
            assert!(
                matches!(RenderConfig::from_json(json), Err(RenderwireError::Config(_))),
                "{json} accepted"
            );
        }
    }

    #[test]
    fn test_auto_restart_off_means_never() {
        let config = RenderConfig {
            auto_restart: false,
            restart_policy: RestartPolicy::Always,
            ..RenderConfig::default()
        };
        assert_eq!(config.effective_restart_policy(), RestartPolicy::Never);
    }

    #[test]
    fn test_merge_patch() {
        let config = RenderConfig::default();
        let merged = config
            .merged_with(r#"{"profiling_enabled": false, "max_concurrent_widgets": 5}"#)
            .unwrap();
        assert!(!merged.profiling_enabled);
        assert_eq!(merged.max_concurrent_widgets, 5);
        assert_eq!(merged.pipe_name, config.pipe_name);

        assert!(config.merged_with(r#"{"no_such_key": 1}"#).is_err());
        assert!(config.merged_with("[1, 2]").is_err());
        assert!(config.merged_with(r#"{"max_concurrent_widgets": 0}"#).is_err());
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");
        let config = RenderConfig {
            worker_process_path: Some(PathBuf::from("/opt/worker")),
            worker_process_arguments: vec!["--verbose".into()],
            ..RenderConfig::default()
        };
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        assert_eq!(RenderConfig::load(&path).unwrap(), config);
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_path() {
        let mut config = RenderConfig::default();
        config.pipe_name = "render.sock".into();
        assert_eq!(config.pipe_path(), std::env::temp_dir().join("render.sock"));
        config.pipe_name = "/run/render.sock".into();
        assert_eq!(config.pipe_path(), PathBuf::from("/run/render.sock"));
    }
}
