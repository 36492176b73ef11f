//! The metronome MCP server binary.
//!
//! Initialization order matters: store (fatal on failure), then the
//! scheduler with its timers, then the stdio transport. Teardown runs in
//! reverse when the client disconnects or the process is interrupted.

use std::sync::Arc;

use tracing::info;

use metronome_core::time;
use metronome_core::{config, Config};
use metronome_mcp::{McpPeer, SamplingClient, StdioTransport};
use metronome_scheduler::{legacy, Scheduler, TaskStore, ToolRouter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, so diagnostics must go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    config::load_dotenv();
    let config = Config::from_env();
    config.log_summary();

    let store = TaskStore::open(&config.db_path).await?;
    legacy::import_if_empty(&store, &config.legacy_file()).await?;

    let tz = time::resolve_zone(config.timezone.as_deref());
    let scheduler = Scheduler::new(store, tz, config.sampling_timeout);
    scheduler.initialize().await?;

    let router = Arc::new(ToolRouter::new(scheduler.clone()));
    let (reader, writer) = StdioTransport::split();
    let peer = McpPeer::spawn(reader, writer, router);
    scheduler.set_sampling_client(Arc::clone(&peer) as Arc<dyn SamplingClient>);
    info!("metronome MCP server ready on stdio");

    tokio::select! {
        _ = peer.closed() => info!("client disconnected"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    peer.shutdown();
    scheduler.shutdown().await;
    Ok(())
}
