use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::db::queries;
use crate::errors::AppError;
use crate::services::booking::{self, CancelOutcome};
use crate::services::policy::RefundTier;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LookupParams {
    pub token: Option<String>,
}

// GET /api/booking?token=...
//
// Redacted projection: never echoes the token or the payment reference back
// to the caller.
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LookupParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Validation("token required".to_string()))?;

    let booking = {
        let db = state.db.lock().unwrap();
        queries::get_booking_by_token(&db, &token)?
    };
    let booking = booking.ok_or_else(|| AppError::NotFound("booking".to_string()))?;

    Ok(Json(serde_json::json!({
        "booking": {
            "customer_name": booking.customer_name,
            "appointment_time": booking.appointment_time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "service_type": booking.service.service_type,
            "addons": booking.service.addons,
            "mobile_service": booking.service.mobile_service,
            "status": booking.status.as_str(),
        }
    })))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub token: String,
}

// POST /api/cancel
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelRequest>,
) -> Response {
    let now = Utc::now().naive_utc();

    match booking::cancel(&state, &req.token, now).await {
        Ok(CancelOutcome::Cancelled {
            tier,
            refund_cents,
            fee_cents,
            payment_status,
        }) => {
            // The wording follows the policy tier: a saturated zero refund on
            // an early cancellation is still not a late-notice forfeit.
            let message = match tier {
                RefundTier::FullMinusFee if refund_cents > 0 => format!(
                    "Booking cancelled. {} refunded ({} processing fee).",
                    dollars(refund_cents),
                    dollars(fee_cents)
                ),
                RefundTier::FullMinusFee => format!(
                    "Booking cancelled. No refund (the {} processing fee covers the deposit).",
                    dollars(fee_cents)
                ),
                RefundTier::Forfeit => format!(
                    "Booking cancelled. No refund (less than {}h notice).",
                    state.config.cancellation_cutoff_hours
                ),
            };
            Json(serde_json::json!({
                "message": message,
                "refunded_cents": refund_cents,
                "payment_status": payment_status.as_str(),
            }))
            .into_response()
        }
        Ok(CancelOutcome::NotFound) => {
            AppError::NotFound("booking".to_string()).into_response()
        }
        Ok(CancelOutcome::AlreadyCancelled) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "booking already cancelled" })),
        )
            .into_response(),
        Ok(CancelOutcome::NotCancellable) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "booking already completed" })),
        )
            .into_response(),
        Ok(CancelOutcome::RefundFailed { retryable, reason }) => {
            // Transient failures invite a retry; declines need a human.
            let status = if retryable {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::CONFLICT
            };
            (
                status,
                Json(serde_json::json!({
                    "error": "refund failed",
                    "retryable": retryable,
                    "reason": reason,
                })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "cancellation failed");
            AppError::Storage(e).into_response()
        }
    }
}

fn dollars(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}
