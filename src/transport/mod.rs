//! Transport module - reliable framed messaging over pipes.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)

mod pipe;
mod reliable;

pub use pipe::{connect_pipe, generate_pipe_path, PipeListener, PipeStream};
pub use reliable::{
    MessageCallback, PipeStats, ReliableChannel, ReliableConfig, HEARTBEAT_GRACE_INTERVALS,
};
