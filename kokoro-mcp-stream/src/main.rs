//! Kokoro MCP Streaming Speech Server
//!
//! MCP server for incremental text-to-speech over a Kokoro engine.

use anyhow::{Context, Result};
use clap::Parser;
use kokoro_mcp_common::tracing::init_tracing;
use kokoro_mcp_common::{Config, McpServerBuilder, TransportArgs};
use kokoro_mcp_stream::StreamServer;
use std::time::Duration;

/// How often finished sessions are checked against the retention window.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Command-line arguments for the streaming server.
#[derive(Parser, Debug)]
#[command(name = "kokoro-mcp-stream")]
#[command(about = "MCP server for streaming text-to-speech over a Kokoro engine")]
struct Args {
    /// Transport configuration
    #[command(flatten)]
    transport: TransportArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");

    tracing::info!("kokoro-mcp-stream server starting...");

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        engine_url = %config.engine_url,
        delivery = %config.delivery,
        default_voice = %config.default_voice,
        max_concurrent_syntheses = config.max_concurrent_syntheses,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.temp_audio_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create audio directory {}",
                config.temp_audio_dir.display()
            )
        })?;

    let retention = config.session_retention;

    // Create the server handler
    let server = StreamServer::new(config);
    let registry = server.registry();
    let sweeper = registry.spawn_sweeper(SWEEP_INTERVAL, retention);

    // Build and run the MCP server
    let transport = args.transport.into_transport();
    tracing::info!(transport = %transport, "Starting MCP server");

    McpServerBuilder::new(server)
        .with_transport(transport)
        .on_shutdown(async move {
            registry.cancel_all().await;
            sweeper.abort();
        })
        .run()
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
