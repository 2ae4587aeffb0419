//! Capacity API endpoints.
//!
//! The box reports parcel height; the app reads the derived fill status.

use axum::extract::State;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parcelbox_core::{CapacityReading, CapacityStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the capacity router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_capacity))
        .route("/height", put(update_height))
        .route("/max-height", put(update_max_height))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Latest reading with its derived status.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "height": 22.0,
    "maxHeight": 30.0,
    "deviceId": "ESP32_001",
    "lastUpdated": "2025-01-15T03:30:00Z",
    "capacity": {
        "percentage": 73.33,
        "status": "Hampir Penuh",
        "message": "Box mulai terisi, perhatikan kapasitas",
        "color": "#F59E0B"
    }
}))]
pub struct CapacityResponse {
    /// Parcel height in cm.
    pub height: f64,
    /// Usable box height in cm.
    pub max_height: f64,
    /// Reporting device.
    pub device_id: String,
    /// Time of the reading.
    pub last_updated: DateTime<Utc>,
    /// Derived fill status.
    pub capacity: CapacityStatus,
}

impl From<CapacityReading> for CapacityResponse {
    fn from(reading: CapacityReading) -> Self {
        let capacity = reading.status();
        Self {
            height: reading.height,
            max_height: reading.max_height,
            device_id: reading.device_id,
            last_updated: reading.last_updated,
            capacity,
        }
    }
}

/// Sensor height report.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({ "height": 15.5, "deviceId": "ESP32_001" }))]
pub struct UpdateHeightRequest {
    /// Parcel height in cm.
    pub height: f64,
    /// Reporting device; defaults to the configured id.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Box calibration.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({ "maxHeight": 25.0 }))]
pub struct UpdateMaxHeightRequest {
    /// Usable box height in cm.
    pub max_height: f64,
    /// Reporting device; defaults to the configured id.
    #[serde(default)]
    pub device_id: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the box fill level.
#[utoipa::path(
    get,
    path = "/api/capacity",
    tag = "capacity",
    operation_id = "getCapacity",
    summary = "Get box fill level",
    description = "Returns the latest sensor reading and its status. An empty reading with \
        default calibration is created on first use.",
    responses(
        (status = 200, description = "Current reading", body = CapacityResponse)
    )
)]
pub async fn get_capacity(State(state): State<SharedState>) -> ApiResult<Json<CapacityResponse>> {
    Ok(Json(state.capacity.get().await?.into()))
}

/// Report parcel height.
#[utoipa::path(
    put,
    path = "/api/capacity/height",
    tag = "capacity",
    operation_id = "updateCapacityHeight",
    summary = "Report parcel height",
    request_body = UpdateHeightRequest,
    responses(
        (status = 200, description = "Reading stored", body = CapacityResponse),
        (status = 400, description = "Negative or non-finite height", body = crate::api::ErrorResponse)
    )
)]
pub async fn update_height(
    State(state): State<SharedState>,
    Json(request): Json<UpdateHeightRequest>,
) -> ApiResult<Json<CapacityResponse>> {
    let reading = state
        .capacity
        .set_height(request.height, request.device_id.as_deref())
        .await?;
    Ok(Json(reading.into()))
}

/// Recalibrate the box height.
#[utoipa::path(
    put,
    path = "/api/capacity/max-height",
    tag = "capacity",
    operation_id = "updateCapacityMaxHeight",
    summary = "Set usable box height",
    request_body = UpdateMaxHeightRequest,
    responses(
        (status = 200, description = "Calibration stored", body = CapacityResponse),
        (status = 400, description = "Non-positive or non-finite height", body = crate::api::ErrorResponse)
    )
)]
pub async fn update_max_height(
    State(state): State<SharedState>,
    Json(request): Json<UpdateMaxHeightRequest>,
) -> ApiResult<Json<CapacityResponse>> {
    let reading = state
        .capacity
        .set_max_height(request.max_height, request.device_id.as_deref())
        .await?;
    Ok(Json(reading.into()))
}
