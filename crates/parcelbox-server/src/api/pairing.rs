//! Pairing API endpoints used by the mobile client.
//!
//! The client starts a session, then follows `/api/pairing/events` until the box has written
//! a card and the finalizer reports the outcome.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use parcelbox_core::{PairingOutcome, PairingSession};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the pairing router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_session))
        .route("/start", post(start_session))
        .route("/cancel", post(cancel_session))
        .route("/retry", post(retry_finalization))
        .route("/events", get(session_events))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to start a pairing session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "user_id": "uid-123" }))]
pub struct StartPairingRequest {
    /// Profile that will own the new card.
    #[schema(example = "uid-123")]
    pub user_id: String,
}

/// Response after starting a session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "generation": 7, "expires_in_secs": 30 }))]
pub struct StartPairingResponse {
    /// Session instance to pass to cancel.
    #[schema(example = 7)]
    pub generation: u64,

    /// Seconds until an unanswered session expires.
    #[schema(example = 30)]
    pub expires_in_secs: u64,
}

/// Request to cancel a session.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({ "generation": 7 }))]
pub struct CancelPairingRequest {
    /// Only cancel this session. Omit to reset the slot unconditionally.
    #[serde(default)]
    #[schema(example = 7)]
    pub generation: Option<u64>,
}

/// Response after a cancel request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelPairingResponse {
    /// Whether the slot was reset. `false` when the session had already ended.
    #[schema(example = true)]
    pub cancelled: bool,
}

/// Response after a manual retry.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RetryResponse {
    /// Outcome of the retry; `null` when no session was waiting for finalization.
    pub outcome: Option<PairingOutcome>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the session occupying the slot.
#[utoipa::path(
    get,
    path = "/api/pairing",
    tag = "pairing",
    operation_id = "getPairingSession",
    summary = "Get current pairing session",
    description = "Returns the active session, or `null` when the slot is idle.",
    responses(
        (status = 200, description = "Current session or null", body = PairingSession),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
) -> ApiResult<Json<Option<PairingSession>>> {
    Ok(Json(state.pairing.status().await?))
}

/// Start a pairing session.
#[utoipa::path(
    post,
    path = "/api/pairing/start",
    tag = "pairing",
    operation_id = "startPairing",
    summary = "Start pairing an RFID card",
    description = "Puts the slot into `waiting` for the given user. Any session already in \
        the slot is superseded. The session expires if the box does not answer in time.",
    request_body = StartPairingRequest,
    responses(
        (status = 200, description = "Session started", body = StartPairingResponse),
        (status = 400, description = "Empty user id", body = crate::api::ErrorResponse),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn start_session(
    State(state): State<SharedState>,
    Json(request): Json<StartPairingRequest>,
) -> ApiResult<Json<StartPairingResponse>> {
    let generation = state.pairing.start_session(&request.user_id).await?;

    Ok(Json(StartPairingResponse {
        generation,
        expires_in_secs: state.pairing.timeout().as_secs(),
    }))
}

/// Cancel a pairing session.
#[utoipa::path(
    post,
    path = "/api/pairing/cancel",
    tag = "pairing",
    operation_id = "cancelPairing",
    summary = "Cancel pairing",
    description = "Resets the slot to idle. With a generation only that session is \
        cancelled; a session that already ended is left alone.",
    request_body = CancelPairingRequest,
    responses(
        (status = 200, description = "Cancel processed", body = CancelPairingResponse),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn cancel_session(
    State(state): State<SharedState>,
    Json(request): Json<CancelPairingRequest>,
) -> ApiResult<Json<CancelPairingResponse>> {
    let cancelled = state.pairing.cancel_session(request.generation).await?;
    Ok(Json(CancelPairingResponse { cancelled }))
}

/// Retry a failed finalization.
#[utoipa::path(
    post,
    path = "/api/pairing/retry",
    tag = "pairing",
    operation_id = "retryPairing",
    summary = "Retry binding a received card",
    description = "Re-attempts writing the received code into the requester's profile. \
        Finalization failures are never retried automatically.",
    responses(
        (status = 200, description = "Retry processed", body = RetryResponse),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn retry_finalization(
    State(state): State<SharedState>,
) -> ApiResult<Json<RetryResponse>> {
    let outcome = state.finalizer.retry().await?;
    Ok(Json(RetryResponse { outcome }))
}

/// Stream session changes and pairing outcomes.
///
/// Events are named `session` (a [`PairingSession`]), `outcome` (a [`PairingOutcome`]) and
/// `error` (plain text, when changes were dropped). The current session, if any, is sent
/// first.
#[utoipa::path(
    get,
    path = "/api/pairing/events",
    tag = "pairing",
    operation_id = "pairingEvents",
    summary = "Follow pairing progress",
    description = "Server-sent events. `session` events carry the session record, \
        `outcome` events report whether the card was bound to the profile.",
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 503, description = "Session store unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn session_events(
    State(state): State<SharedState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Subscribe before reading so nothing between the two is lost.
    let changes = state.pairing.observe().into_stream();
    let outcomes = outcome_stream(state.finalizer.subscribe());
    let current = state.pairing.status().await?;

    let changes = changes.map(|change| match change {
        Ok(session) => session_event(&session),
        Err(e) => Event::default().event("error").data(e.to_string()),
    });
    let outcomes = outcomes.map(|outcome| json_event("outcome", &outcome));

    let stream = stream::iter(current.as_ref().map(session_event))
        .chain(stream::select(changes, outcomes))
        .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn session_event(session: &PairingSession) -> Event {
    json_event("session", session)
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(json) => Event::default().event(name).data(json),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

fn outcome_stream(
    receiver: broadcast::Receiver<PairingOutcome>,
) -> impl Stream<Item = PairingOutcome> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(outcome) => return Some((outcome, receiver)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "outcome stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
