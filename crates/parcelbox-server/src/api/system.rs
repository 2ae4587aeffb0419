//! System API endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the system router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new().route("/status", get(get_status))
}

/// System status response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "version": "0.1.0",
    "uptime_secs": 3600,
    "local_time": "2025-01-15T10:30:00+07:00",
    "timezone": "Asia/Jakarta",
    "pairing_active": false,
    "pairing_generation": null
}))]
pub struct SystemStatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Server uptime in seconds.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Current time in the configured timezone (RFC 3339).
    pub local_time: String,

    /// Configured timezone.
    #[schema(example = "Asia/Jakarta")]
    pub timezone: String,

    /// Whether a pairing session occupies the slot.
    pub pairing_active: bool,

    /// Generation of that session.
    pub pairing_generation: Option<u64>,
}

/// Get system status.
#[utoipa::path(
    get,
    path = "/api/system/status",
    tag = "system",
    operation_id = "getSystemStatus",
    summary = "Get system status",
    description = "Returns version, uptime, local time and whether a pairing session \
        is in progress.",
    responses(
        (status = 200, description = "System status retrieved", body = SystemStatusResponse),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<SystemStatusResponse>> {
    let timezone = state.config.read().await.system.timezone.clone();
    let session = state.pairing.status().await?;

    Ok(Json(SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        local_time: local_time(&timezone),
        timezone,
        pairing_active: session.is_some(),
        pairing_generation: session.map(|s| s.generation),
    }))
}

/// Current time in `timezone`, falling back to UTC for an unknown name.
fn local_time(timezone: &str) -> String {
    let now = Utc::now();
    timezone
        .parse::<Tz>()
        .map_or_else(|_| now.to_rfc3339(), |tz| now.with_timezone(&tz).to_rfc3339())
}
