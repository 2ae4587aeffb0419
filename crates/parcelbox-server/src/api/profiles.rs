//! Profile administration endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parcelbox_core::{NewProfile, Profile, ProfileUpdate, Role};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Who deletions are attributed to when the request does not say.
const DEFAULT_ACTOR: &str = "admin";

/// Creates the profiles router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_profiles).post(create_profile))
        .route(
            "/{id}",
            get(get_profile).patch(update_profile).delete(delete_profile),
        )
        .route("/{id}/restore", post(restore_profile))
        .route("/{id}/rfid", put(set_rfid).delete(clear_rfid))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Filters for listing profiles.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListProfilesQuery {
    /// Role to list. Defaults to `user`.
    #[serde(default)]
    pub role: Option<Role>,
    /// List soft-deleted profiles instead of active ones.
    #[serde(default)]
    pub deleted: bool,
}

/// Profile creation payload.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateProfileRequest {
    /// Use this id (for example the auth uid); random when omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// Profile fields.
    #[serde(flatten)]
    pub profile: NewProfile,
}

/// Soft-delete options.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeleteProfileQuery {
    /// Who is deleting the profile.
    #[serde(default)]
    pub by: Option<String>,
}

/// RFID binding payload.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "code": "A1B2C3D4" }))]
pub struct SetRfidRequest {
    /// Card code.
    pub code: String,
}

/// Listing response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProfileListResponse {
    /// Matching profiles.
    pub profiles: Vec<Profile>,
    /// Number of profiles returned.
    pub count: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// List profiles.
#[utoipa::path(
    get,
    path = "/api/profiles",
    tag = "profiles",
    operation_id = "listProfiles",
    summary = "List profiles",
    description = "Active profiles are sorted by name, deleted ones by deletion time, \
        newest first.",
    params(ListProfilesQuery),
    responses(
        (status = 200, description = "Profiles", body = ProfileListResponse)
    )
)]
pub async fn list_profiles(
    State(state): State<SharedState>,
    Query(query): Query<ListProfilesQuery>,
) -> ApiResult<Json<ProfileListResponse>> {
    let profiles = state
        .profiles
        .list(query.role.unwrap_or_default(), query.deleted)
        .await?;
    Ok(Json(ProfileListResponse {
        count: profiles.len(),
        profiles,
    }))
}

/// Create a profile.
#[utoipa::path(
    post,
    path = "/api/profiles",
    tag = "profiles",
    operation_id = "createProfile",
    summary = "Create profile",
    request_body = CreateProfileRequest,
    responses(
        (status = 201, description = "Profile created", body = Profile),
        (status = 400, description = "Invalid profile", body = crate::api::ErrorResponse),
        (status = 409, description = "Id already taken", body = crate::api::ErrorResponse)
    )
)]
pub async fn create_profile(
    State(state): State<SharedState>,
    Json(request): Json<CreateProfileRequest>,
) -> ApiResult<(StatusCode, Json<Profile>)> {
    let profile = state.profiles.create(request.id, request.profile).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// Get one profile.
#[utoipa::path(
    get,
    path = "/api/profiles/{id}",
    tag = "profiles",
    operation_id = "getProfile",
    summary = "Get profile",
    params(("id" = String, Path, description = "Profile id")),
    responses(
        (status = 200, description = "Profile", body = Profile),
        (status = 404, description = "Unknown profile", body = crate::api::ErrorResponse),
        (status = 410, description = "Profile deleted", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_profile(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.profiles.get(&id).await?))
}

/// Update a profile.
#[utoipa::path(
    patch,
    path = "/api/profiles/{id}",
    tag = "profiles",
    operation_id = "updateProfile",
    summary = "Update profile",
    params(("id" = String, Path, description = "Profile id")),
    request_body = ProfileUpdate,
    responses(
        (status = 200, description = "Updated profile", body = Profile),
        (status = 400, description = "Invalid field", body = crate::api::ErrorResponse),
        (status = 404, description = "Unknown profile", body = crate::api::ErrorResponse),
        (status = 410, description = "Profile deleted", body = crate::api::ErrorResponse)
    )
)]
pub async fn update_profile(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.profiles.update(&id, update).await?))
}

/// Soft-delete a profile.
#[utoipa::path(
    delete,
    path = "/api/profiles/{id}",
    tag = "profiles",
    operation_id = "deleteProfile",
    summary = "Delete profile",
    description = "Marks the profile deleted. It can be restored later.",
    params(("id" = String, Path, description = "Profile id"), DeleteProfileQuery),
    responses(
        (status = 200, description = "Deleted profile", body = Profile),
        (status = 404, description = "Unknown profile", body = crate::api::ErrorResponse),
        (status = 409, description = "Already deleted", body = crate::api::ErrorResponse)
    )
)]
pub async fn delete_profile(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteProfileQuery>,
) -> ApiResult<Json<Profile>> {
    let by = query.by.as_deref().unwrap_or(DEFAULT_ACTOR);
    Ok(Json(state.profiles.soft_delete(&id, by).await?))
}

/// Restore a deleted profile.
#[utoipa::path(
    post,
    path = "/api/profiles/{id}/restore",
    tag = "profiles",
    operation_id = "restoreProfile",
    summary = "Restore profile",
    params(("id" = String, Path, description = "Profile id")),
    responses(
        (status = 200, description = "Restored profile", body = Profile),
        (status = 404, description = "Unknown profile", body = crate::api::ErrorResponse)
    )
)]
pub async fn restore_profile(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.profiles.restore(&id).await?))
}

/// Bind an RFID code directly.
#[utoipa::path(
    put,
    path = "/api/profiles/{id}/rfid",
    tag = "profiles",
    operation_id = "setProfileRfid",
    summary = "Set RFID code",
    params(("id" = String, Path, description = "Profile id")),
    request_body = SetRfidRequest,
    responses(
        (status = 200, description = "Updated profile", body = Profile),
        (status = 409, description = "Code bound to another profile", body = crate::api::ErrorResponse),
        (status = 410, description = "Profile deleted", body = crate::api::ErrorResponse)
    )
)]
pub async fn set_rfid(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<SetRfidRequest>,
) -> ApiResult<Json<Profile>> {
    let code = request.code.trim().to_uppercase();
    state.profiles.credential_update(&id, &code).await?;
    Ok(Json(state.profiles.get(&id).await?))
}

/// Remove a profile's RFID code.
#[utoipa::path(
    delete,
    path = "/api/profiles/{id}/rfid",
    tag = "profiles",
    operation_id = "clearProfileRfid",
    summary = "Clear RFID code",
    params(("id" = String, Path, description = "Profile id")),
    responses(
        (status = 200, description = "Updated profile", body = Profile),
        (status = 404, description = "Unknown profile", body = crate::api::ErrorResponse)
    )
)]
pub async fn clear_rfid(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    state.profiles.credential_clear(&id).await?;
    Ok(Json(state.profiles.get(&id).await?))
}
