//! Configuration API endpoint.
//!
//! Read-only view of the loaded configuration. Changes go through the config file or
//! `PARCELBOX__*` environment variables and take effect on restart.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parcelbox_core::Config;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the config router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(get_config))
}

/// Current configuration response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "pairing_timeout_secs": 30,
    "credential_pattern": "^[0-9A-F]{8}$",
    "default_max_height": 30.0,
    "default_device_id": "ESP32_001",
    "timezone": "Asia/Jakarta",
    "production": false
}))]
pub struct ConfigResponse {
    /// Seconds a pairing session waits for the box.
    #[schema(example = 30)]
    pub pairing_timeout_secs: u64,

    /// Pattern an upper-cased card code must match.
    #[schema(example = "^[0-9A-F]{8}$")]
    pub credential_pattern: String,

    /// Box height used before the first calibration.
    #[schema(example = 30.0)]
    pub default_max_height: f64,

    /// Sensor id used when a report names none.
    #[schema(example = "ESP32_001")]
    pub default_device_id: String,

    /// Configured timezone (IANA format).
    #[schema(example = "Asia/Jakarta")]
    pub timezone: String,

    /// Whether production logging is enabled.
    pub production: bool,
}

impl From<&Config> for ConfigResponse {
    fn from(config: &Config) -> Self {
        Self {
            pairing_timeout_secs: config.pairing.timeout_secs,
            credential_pattern: config.pairing.credential_pattern.clone(),
            default_max_height: config.capacity.default_max_height,
            default_device_id: config.capacity.default_device_id.clone(),
            timezone: config.system.timezone.clone(),
            production: config.server.production,
        }
    }
}

/// Get current configuration.
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "config",
    operation_id = "getConfig",
    summary = "Get current configuration",
    description = "Returns the configuration the server was started with.",
    responses(
        (status = 200, description = "Configuration retrieved", body = ConfigResponse)
    )
)]
pub async fn get_config(State(state): State<SharedState>) -> ApiResult<Json<ConfigResponse>> {
    let config = state.config.read().await;
    Ok(Json(ConfigResponse::from(&*config)))
}
