//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `pairing` - RFID pairing sessions for the mobile client
//! - `device` - Endpoints called by the parcel box
//! - `capacity` - Box fill level
//! - `profiles` - User and admin profiles
//! - `config` - Loaded configuration
//! - `health` - Service health checks
//! - `system` - Uptime and status
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod capacity;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod openapi;
pub mod pairing;
pub mod profiles;
pub mod system;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /swagger-ui            - Interactive API docs
/// /api
/// ├── /pairing           - Start, cancel, follow and retry pairing sessions
/// ├── /device            - Card codes from the box
/// ├── /capacity          - Fill level and sensor reports
/// ├── /profiles          - Profile administration
/// ├── /config            - Loaded configuration
/// ├── /system            - System status
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/pairing", pairing::router())
                .nest("/device", device::router())
                .nest("/capacity", capacity::router())
                .nest("/profiles", profiles::router())
                .nest("/config", config::router())
                .nest("/system", system::router()),
        )
        .with_state(state)
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
        )
}
