//! Error types for renderwire.

use thiserror::Error;

/// Main error type for all renderwire operations.
#[derive(Debug, Error)]
pub enum RenderwireError {
    /// I/O error during pipe, socket or segment operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration and diagnostics only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or oversized payload. Not retryable.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Declared size does not match the bytes available.
    #[error("Truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Payload checksum did not match the declared checksum.
    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Protocol violation (bad magic, wrong version, unexpected frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Single-slot channel still holds an unconsumed message.
    #[error("Shared-memory {0} slot is still occupied")]
    SlotOccupied(&'static str),

    /// A ready slot carried a sequence number that did not advance.
    #[error("Stale {slot} slot: sequence {sequence} already consumed")]
    StaleSequence { slot: &'static str, sequence: u64 },

    /// Cross-process lock could not be acquired in time.
    #[error("Timed out waiting for shared-memory lock")]
    LockTimeout,

    /// No channel is connected or healthy enough to carry the message.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - too many frames or commands in flight.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// No result arrived for the command before its deadline.
    #[error("Command {command_id} timed out")]
    Timeout { command_id: u64 },

    /// The bridge is shutting down; pending commands are cancelled.
    #[error("Transport shut down")]
    Shutdown,

    /// The worker process exited unexpectedly.
    #[error("Worker process crashed (exit code {exit_code:?})")]
    WorkerCrashed { exit_code: Option<i32> },

    /// The supervisor gave up restarting the worker.
    #[error("Worker restart budget exhausted after {attempts} attempts")]
    RestartBudgetExhausted { attempts: u32 },

    /// The worker executable could not be launched again after a crash.
    #[error("Worker respawn failed on attempt {attempt}: {reason}")]
    RespawnFailed { attempt: u32, reason: String },

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No widget registered under the given id.
    #[error("Widget not found: {0}")]
    WidgetNotFound(u32),

    /// The coordinator already tracks the maximum number of widgets.
    #[error("Widget limit of {0} reached")]
    WidgetLimitReached(usize),

    /// The worker answered with a non-success status.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RenderwireError {
    /// Whether the caller may retry the same operation.
    ///
    /// Timeouts and missing transports are transient; everything else needs
    /// a different input or a fresh worker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RenderwireError::Timeout { .. }
                | RenderwireError::TransportUnavailable(_)
                | RenderwireError::BackpressureTimeout
                | RenderwireError::LockTimeout
        )
    }
}

/// Result type alias using RenderwireError.
pub type Result<T> = std::result::Result<T, RenderwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RenderwireError::Timeout { command_id: 1 }.is_transient());
        assert!(RenderwireError::TransportUnavailable("down".into()).is_transient());
        assert!(!RenderwireError::Serialization("bad".into()).is_transient());
        assert!(!RenderwireError::Shutdown.is_transient());
        assert!(!RenderwireError::RestartBudgetExhausted { attempts: 3 }.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = RenderwireError::ChecksumMismatch {
            expected: 0xDEAD_BEEF,
            actual: 0x0000_0001,
        };
        assert!(err.to_string().contains("0xdeadbeef"));

        let err = RenderwireError::Truncated {
            needed: 10,
            available: 4,
        };
        assert_eq!(
            err.to_string(),
            "Truncated payload: needed 10 bytes, 4 available"
        );
    }
}
