//! Endpoints called by the box itself.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the device router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/credential", post(submit_credential))
}

/// Code written to a card by the box.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "code": "a1b2c3d4", "generation": 7 }))]
pub struct SubmitCredentialRequest {
    /// Eight hex characters; case and surrounding whitespace are ignored.
    #[schema(example = "A1B2C3D4")]
    pub code: String,

    /// Session the code answers. Omit to answer whichever session is waiting.
    #[serde(default)]
    #[schema(example = 7)]
    pub generation: Option<u64>,
}

/// Acknowledgement of an accepted code.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitCredentialResponse {
    /// Session that received the code.
    #[schema(example = 7)]
    pub generation: u64,
}

/// Submit a freshly written card code.
#[utoipa::path(
    post,
    path = "/api/device/credential",
    tag = "device",
    operation_id = "submitCredential",
    summary = "Submit card code",
    description = "Moves the waiting session to `received`. Rejected without touching the \
        slot when no matching session is waiting.",
    request_body = SubmitCredentialRequest,
    responses(
        (status = 200, description = "Code accepted", body = SubmitCredentialResponse),
        (status = 400, description = "Malformed code", body = crate::api::ErrorResponse),
        (status = 409, description = "No matching session waiting", body = crate::api::ErrorResponse),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn submit_credential(
    State(state): State<SharedState>,
    Json(request): Json<SubmitCredentialRequest>,
) -> ApiResult<Json<SubmitCredentialResponse>> {
    let generation = state
        .pairing
        .submit_credential(request.generation, &request.code)
        .await?;
    Ok(Json(SubmitCredentialResponse { generation }))
}
