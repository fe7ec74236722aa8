use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::services::booking::{self, CreateError, CreateOutcome};
use crate::state::AppState;

/// Entry point for gateway payment events.
///
/// Takes the raw body because the signature covers the exact bytes on the
/// wire; extracting into a typed form first would break verification.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let event = match state.verifier.verify(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "webhook verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    // Every event kind the core cannot act on is still acknowledged, so the
    // gateway does not keep redelivering it.
    if !event.is_payment_confirmation() {
        tracing::debug!(event_type = %event.event_type, "ignoring event type");
        return accepted();
    }

    let session = match event.checkout_session() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, event_id = %event.id, "malformed checkout session");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    match booking::create_from_event(&state, &session).await {
        // A duplicate delivery is acknowledged exactly like the first one.
        Ok(CreateOutcome::Created(_)) | Ok(CreateOutcome::AlreadyExists) => accepted(),
        Err(CreateError::InvalidMetadata(reason)) => {
            tracing::warn!(%reason, event_id = %event.id, "rejecting event with bad metadata");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": reason })),
            )
                .into_response()
        }
        Err(CreateError::Storage(e)) => {
            // Non-2xx tells the gateway to retry delivery later.
            tracing::error!(error = %e, event_id = %event.id, "storage failure handling event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "storage failure" })),
            )
                .into_response()
        }
    }
}

fn accepted() -> Response {
    Json(serde_json::json!({ "received": true })).into_response()
}
