use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tempdrop::{
    AppState, Config, FileStore, RateLimiter, SharedClock, SystemClock, build_router, metrics,
    utils,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!("Starting tempdrop v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Install the tracing subscriber; `LOG_FORMAT=json` selects JSON output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        upload_dir = %config.upload_dir.display(),
        max_file_size = config.max_file_size,
        rate_limit_enabled = config.rate_limit.enabled,
        rate_limit_store = %config.rate_limit.store,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    let clock: SharedClock = Arc::new(SystemClock);

    // File storage
    let files = FileStore::create(
        &config.upload_dir,
        config.max_file_size,
        config.file_expiry,
        clock.clone(),
    )
    .await
    .map_err(|e| {
        error!(dir = %config.upload_dir.display(), "Failed to prepare upload directory: {e}");
        exitcode::CANTCREAT
    })?;

    // Upload admission
    let limiter = if config.rate_limit.enabled {
        let limiter = RateLimiter::from_config(&config.rate_limit, clock.clone())
            .await
            .map_err(|e| {
                error!("Failed to initialize rate limiter: {e}");
                if e.is_unavailable() {
                    exitcode::UNAVAILABLE
                } else {
                    exitcode::CONFIG
                }
            })?;
        Some(limiter)
    } else {
        None
    };

    // Build application state and router
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let state = AppState::new(config, files, limiter, clock);
    let app = build_router(state.clone());

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  POST /                 - Upload a file (multipart field 'file')");
    info!("  POST /api/upload       - Upload a file (multipart field 'file')");
    info!("  GET  /{{filename}}       - Download a file");
    info!("  GET  /api/rate-limit   - Current upload usage");
    info!("  GET  /health           - Health check");
    info!("  GET  /ready            - Readiness check");

    // Peer addresses feed client identity resolution
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
