use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shared_canvas_server::config::ServerConfig;
use shared_canvas_server::metrics::{self, Metrics};
use shared_canvas_server::net::canvas_session::CanvasSession;
use shared_canvas_server::net::transport::WebSocketServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Shared Canvas Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {}:{}, grid {}x{}, tick {:?}",
        config.bind_address, config.port, config.grid_rows, config.grid_cols, config.broadcast_tick
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let canvas = Arc::new(CanvasSession::new(&config, metrics.clone()));
    let broadcast_loop = canvas.start_broadcast_loop();

    let server = WebSocketServer::new(config.clone(), canvas.clone(), metrics);
    info!("Server ready on ws://{}", server.bind_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutting down...");
        }
    }

    if !canvas.drain(config.shutdown_grace).await {
        warn!("Closing with undelivered frames");
    }
    broadcast_loop.abort();
    info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
