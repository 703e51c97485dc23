//! # bond-server
//!
//! HTTP server for the bond proximity bonding system.
//!
//! This binary provides:
//! - The beacon session for the configured identity
//! - REST API for nearby peers, bond requests and time together
//! - OpenAPI documentation via Swagger UI
//!
//! ## Running
//!
//! ```bash
//! # Development
//! BOND_IDENTITY__USERNAME=alice cargo run --package bond-server
//!
//! # With a real adapter
//! cargo run --package bond-server --features bluetooth
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bond_core::{default_config_path, BondConfig};
use bond_server::api::create_router;
use bond_server::logging;
use bond_server::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Environment variable overriding the config file location.
const CONFIG_PATH_ENV: &str = "BOND_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_PATH_ENV)
        .map_or_else(default_config_path, PathBuf::from);
    let config = BondConfig::load(Some(&config_path))
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    logging::init(config.server.production)?;
    info!(
        config = %config_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting bond-server"
    );

    let state = Arc::new(AppState::from_config(&config)?);
    let report = state.session().start().await?;
    info!(
        identity = %state.session().owner(),
        broadcasting = ?report.broadcasting,
        scanning = ?report.scanning,
        "Session started"
    );

    let app = create_router(state.clone());
    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    if let Err(e) = state.session().sign_out().await {
        warn!(error = %e, "Sign out during shutdown failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
    }
}
