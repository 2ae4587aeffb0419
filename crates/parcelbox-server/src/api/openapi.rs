//! OpenAPI specification generation for the parcelbox API.
//!
//! The document is served at `/api/openapi.json`, browsable at `/swagger-ui`, and written to
//! the workspace root by the `gen-openapi` binary for the mobile client's code generator.

use axum::Json;
use utoipa::OpenApi;

use parcelbox_core::{
    CapacityLevel, CapacityStatus, NewProfile, PairingOutcome, PairingSession, Profile,
    ProfileUpdate, Role, SessionState,
};

use super::capacity::{CapacityResponse, UpdateHeightRequest, UpdateMaxHeightRequest};
use super::config::ConfigResponse;
use super::device::{SubmitCredentialRequest, SubmitCredentialResponse};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::pairing::{
    CancelPairingRequest, CancelPairingResponse, RetryResponse, StartPairingRequest,
    StartPairingResponse,
};
use super::profiles::{CreateProfileRequest, ProfileListResponse, SetRfidRequest};
use super::system::SystemStatusResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a pretty-printed string.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for parcelbox.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "parcelbox API",
        version = "0.1.0",
        description = r#"
# parcelbox API

parcelbox runs next to a smart parcel box and coordinates it with the mobile app.

## Pairing an RFID card

1. The app calls **startPairing** for a user. The single pairing slot becomes `waiting`.
2. The box sees the waiting session, writes a fresh code to a card and calls
   **submitCredential**. The session becomes `received`.
3. The server binds the code to the user's profile and frees the slot. The app follows
   **pairingEvents** to see the `paired` or `failed` outcome.

A session that the box does not answer in time expires. Only one session exists at a time;
starting a new one supersedes the old.

## Capacity

The box reports parcel height; **getCapacity** returns the fill percentage and status.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local parcelbox server")
    ),
    tags(
        (name = "system", description = "Health checks and system status"),
        (name = "pairing", description = "RFID card pairing sessions"),
        (name = "device", description = "Endpoints called by the parcel box"),
        (name = "capacity", description = "Box fill level"),
        (name = "profiles", description = "User and admin profiles"),
        (name = "config", description = "Loaded configuration")
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Pairing endpoints
        super::pairing::get_session,
        super::pairing::start_session,
        super::pairing::cancel_session,
        super::pairing::retry_finalization,
        super::pairing::session_events,
        // Device endpoints
        super::device::submit_credential,
        // Capacity endpoints
        super::capacity::get_capacity,
        super::capacity::update_height,
        super::capacity::update_max_height,
        // Profile endpoints
        super::profiles::list_profiles,
        super::profiles::create_profile,
        super::profiles::get_profile,
        super::profiles::update_profile,
        super::profiles::delete_profile,
        super::profiles::restore_profile,
        super::profiles::set_rfid,
        super::profiles::clear_rfid,
        // Config endpoints
        super::config::get_config,
        // System endpoints
        super::system::get_status,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            // Pairing types
            PairingSession,
            SessionState,
            PairingOutcome,
            StartPairingRequest,
            StartPairingResponse,
            CancelPairingRequest,
            CancelPairingResponse,
            RetryResponse,
            SubmitCredentialRequest,
            SubmitCredentialResponse,
            // Capacity types
            CapacityLevel,
            CapacityStatus,
            CapacityResponse,
            UpdateHeightRequest,
            UpdateMaxHeightRequest,
            // Profile types
            Role,
            Profile,
            NewProfile,
            ProfileUpdate,
            CreateProfileRequest,
            ProfileListResponse,
            SetRfidRequest,
            // Config and system types
            ConfigResponse,
            SystemStatusResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "parcelbox API");
        assert!(spec.paths.paths.contains_key("/api/pairing/start"));
        assert!(spec.paths.paths.contains_key("/api/device/credential"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"parcelbox API\""));
    }
}
