//! Database context MCP server entry point.
//!
//! Serves over stdio by default, or over streamable HTTP when built with the
//! `http` feature and `DBCTX_TRANSPORT=http`.
//!
//! Features:
//! - One cached connection per target, closed after an idle period
//! - Signal handling (SIGTERM, SIGINT, SIGHUP)
//! - Graceful shutdown that closes every cached connection

use anyhow::Result;
use dbctx_mcp_server::cache::{spawn_sweeper, ConnectionCache};
use dbctx_mcp_server::database::MssqlDriver;
use dbctx_mcp_server::shutdown::{
    install_signal_handlers, new_shutdown_controller, SharedShutdownController,
};
use dbctx_mcp_server::transport::TransportType;
use dbctx_mcp_server::{Config, DbContextServer};
use rmcp::ServiceExt;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr (stdout is reserved for JSON-RPC)
    init_logging();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("[PANIC] {}", info);
    }));

    let config = Config::from_env()?;
    info!(
        "{} v{} starting (transport: {})",
        config.server_name,
        env!("CARGO_PKG_VERSION"),
        config.transport.transport_type
    );

    let shutdown_controller = new_shutdown_controller(&config.shutdown);
    install_signal_handlers(shutdown_controller.clone()).await;

    let cache = Arc::new(ConnectionCache::new(
        Arc::new(MssqlDriver::default()),
        config.cache,
    )?);
    let sweeper = spawn_sweeper(cache.clone(), shutdown_controller.signal());
    info!(
        "Idle sweep every {:?}, closing connections idle for more than {:?}",
        config.cache.sweep_interval, config.cache.idle_threshold
    );

    let transport = config.transport.clone();
    let server = DbContextServer::new(config, cache.clone());

    let served = match transport.transport_type {
        TransportType::Stdio => serve_stdio(server, &shutdown_controller).await,
        #[cfg(feature = "http")]
        TransportType::Http => {
            dbctx_mcp_server::transport::http_server::start_http_server_with_shutdown(
                server,
                transport.http,
                shutdown_controller.clone(),
            )
            .await
        }
    };
    if let Err(e) = &served {
        error!("Transport failed: {}", e);
    }

    shutdown_controller
        .graceful_shutdown(&cache, Some(sweeper))
        .await;

    served
}

/// Serve on stdin/stdout until the client disconnects or a signal arrives.
async fn serve_stdio(
    server: DbContextServer,
    shutdown_controller: &SharedShutdownController,
) -> Result<()> {
    let service = server.serve(rmcp::transport::stdio()).await?;
    info!("Ready to accept requests on stdio");

    let mut shutdown_signal = shutdown_controller.signal();

    tokio::select! {
        quit_reason = service.waiting() => {
            match quit_reason {
                Ok(reason) => info!("Service stopped: {:?}", reason),
                Err(e) => error!("Service error: {}", e),
            }
        }
        _ = shutdown_signal.recv() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Initialize tracing subscriber with stderr output.
///
/// Logs MUST go to stderr because stdout is used for JSON-RPC communication.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,dbctx_mcp_server=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
