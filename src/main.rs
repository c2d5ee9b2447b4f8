//! API Gateway - edge authentication and reverse proxy
//!
//! Verifies bearer tokens, refreshes access tokens and forwards traffic to
//! the identity, post and media services.
//!
//! # Exit codes
//!
//! - `0` after a graceful drain
//! - `1` on startup failure or when the drain deadline forces shutdown

use api_gateway::{
    build_router,
    lifecycle::{self, Lifecycle},
    AppState, Config, ShutdownOutcome,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Initialize structured logging
    init_tracing();

    // Load and validate configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    log_startup_info(&config);

    let bind_addr = format!("{}:{}", config.bind_addr, config.port);
    let lifecycle = Arc::new(Lifecycle::new(config.shutdown_timeout));

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to build downstream HTTP client");
            return ExitCode::FAILURE;
        }
    };

    lifecycle::listen_for_signals(Arc::clone(&lifecycle));

    // Build and serve the application
    let app = build_router(state);
    serve(app, &bind_addr, &lifecycle).await
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("api_gateway=debug,tower_http=info")),
        )
        .init();
}

/// Log startup configuration (no secrets).
fn log_startup_info(config: &Config) {
    info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        identity_service = %config.identity_service_url,
        post_service = %config.post_service_url,
        media_service = %config.media_service_url,
        shutdown_timeout_secs = config.shutdown_timeout.as_secs(),
        max_body_size = config.max_body_size,
        "Starting API gateway"
    );
}

/// Bind to address and serve until the drain completes.
async fn serve(app: axum::Router, bind_addr: &str, lifecycle: &Arc<Lifecycle>) -> ExitCode {
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(addr = %bind_addr, "Port is already in use");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind to address");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %bind_addr, "Server listening");

    match lifecycle::run(listener, app, lifecycle).await {
        Ok(ShutdownOutcome::Graceful) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(ShutdownOutcome::Forced) => {
            error!("Forced shutdown after drain deadline");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
