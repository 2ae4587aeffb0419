//! # parcelbox-server
//!
//! HTTP server for the parcelbox smart parcel box.
//!
//! This binary provides:
//! - REST API for RFID pairing, capacity monitoring and profiles
//! - Server-sent events for pairing progress
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package parcelbox-server
//!
//! # Production
//! PARCELBOX__SERVER__PRODUCTION=true ./parcelbox-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use parcelbox_core::Config;
use parcelbox_server::{api, logging, state::AppState};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    logging::init(config.server.production)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        production = config.server.production,
        "Starting parcelbox-server"
    );

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind_address))?;

    let state = AppState::open(config).await?;

    let app = api::create_router(state.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.finalizer.shutdown().await;
    info!("parcelbox-server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
