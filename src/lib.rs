//! # renderwire
//!
//! Cross-process render transport. A controller process drives an isolated
//! render worker through structured commands and receives correlated
//! results.
//!
//! ## Architecture
//!
//! - **Shared memory** (`shm`): a segment split into a command half and a
//!   result half, each a single sealed slot with a ready flag.
//! - **Reliable channel** (`transport`): framed messages over a Unix domain
//!   socket or Windows named pipe, used for large payloads and as fallback.
//! - **Transport bridge** (`bridge`): picks a channel per command and
//!   correlates results with commands by id.
//! - **Process supervisor** (`supervisor`): spawns the worker and restarts it
//!   on crash with a bounded budget.
//! - **Render coordinator** (`coordinator`): widget registry and lifecycle on
//!   top of the bridge.
//! - **Worker endpoint** (`worker`): the worker's half of both channels.
//!
//! ## Example
//!
//! ```ignore
//! use renderwire::{BackendKind, Rect, RenderConfig, RenderCoordinator, SurfaceHandle};
//!
//! #[tokio::main]
//! async fn main() -> renderwire::Result<()> {
//!     let config = RenderConfig::load("render.json")?;
//!     let coordinator = RenderCoordinator::launch(config).await?;
//!     coordinator.start().await?;
//!
//!     let widget = coordinator
//!         .create_widget(SurfaceHandle(0x1a2b), Rect::new(0, 0, 300, 150), BackendKind::Auto)
//!         .await?;
//!     let result = coordinator
//!         .render_widget_async(widget, Default::default(), Default::default())
//!         .await?;
//!     println!("rendered in {} ms", result.render_time_ms);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod shm;
pub mod supervisor;
pub mod transport;
pub mod worker;

mod backpressure;
mod writer;

pub use bridge::{PendingResult, TransportBridge};
pub use config::{IpcMode, RenderConfig, RestartPolicy};
pub use coordinator::{RenderCoordinator, WidgetInfo, WidgetState};
pub use error::{RenderwireError, Result};
pub use protocol::{
    BackendKind, Command, CommandKind, ContentParameters, Rect, RenderProperties, RenderResult,
    ResultStatus, SurfaceHandle,
};
pub use supervisor::{ProcessState, ProcessSupervisor};
pub use worker::{RenderHandler, WorkerEndpoint};
