//! Worker process side.
//!
//! [`WorkerEndpoint`] opens the channels named on the worker's command line
//! and feeds every incoming [`Command`](crate::protocol::Command) to a
//! [`RenderHandler`].

mod endpoint;
mod handler;

pub use endpoint::{WorkerArgs, WorkerEndpoint, WorkerStats};
pub use handler::{handler_fn, BoxFuture, FnHandler, RenderHandler, StubRenderer};
