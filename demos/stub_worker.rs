//! Stand-in render worker.
//!
//! Launched by the supervisor with `--shared-memory=<path>` and/or
//! `--named-pipe=<path>`. Serves every command with [`StubRenderer`] and exits
//! when stdin reaches EOF, which is how the supervisor asks for a graceful
//! stop.
//!
//! ```text
//! RUST_LOG=debug cargo run --example stub_worker -- --named-pipe=/tmp/render.sock
//! ```

use renderwire::transport::ReliableConfig;
use renderwire::worker::{StubRenderer, WorkerArgs, WorkerEndpoint};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> renderwire::Result<()> {
    // stdout belongs to the parent; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = WorkerArgs::from_env();
    tracing::info!(?args, pid = std::process::id(), "stub worker starting");

    let endpoint = WorkerEndpoint::connect(&args, ReliableConfig::default()).await?;
    let stats = endpoint.serve(StubRenderer::new(), stdin_closed()).await?;

    tracing::info!(
        handled = stats.commands_handled,
        via_shm = stats.results_via_shared_memory,
        via_pipe = stats.results_via_pipe,
        "stub worker exiting"
    );
    Ok(())
}
