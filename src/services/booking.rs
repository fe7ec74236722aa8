use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::db::queries;
use crate::models::{Booking, BookingStatus, PaymentStatus, ServiceSelection};
use crate::services::notify::Notification;
use crate::services::payments::webhook::CheckoutSession;
use crate::services::payments::RefundOutcome;
use crate::services::policy::{RefundPolicy, RefundTier};
use crate::state::AppState;

#[derive(Debug)]
pub enum CreateOutcome {
    Created(Booking),
    /// A booking for this payment reference already exists. The redelivered
    /// event is acknowledged without a second row or a second notification.
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("invalid booking metadata: {0}")]
    InvalidMetadata(String),

    /// Storage failed for a reason other than the idempotency conflict. The
    /// caller must fail the request so the gateway redelivers later.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled {
        tier: RefundTier,
        refund_cents: i64,
        fee_cents: i64,
        payment_status: PaymentStatus,
    },
    NotFound,
    AlreadyCancelled,
    /// The booking reached `completed`; terminal states never transition.
    NotCancellable,
    /// Gateway refund did not succeed; nothing was committed and the booking
    /// remains confirmed. `retryable` distinguishes transient failures from
    /// permanent declines.
    RefundFailed { retryable: bool, reason: String },
}

/// Turns a verified payment-confirmation event into exactly one booking.
pub async fn create_from_event(
    state: &Arc<AppState>,
    session: &CheckoutSession,
) -> Result<CreateOutcome, CreateError> {
    let booking = booking_from_session(session)?;

    let inserted = {
        let db = state.db.lock().unwrap();
        queries::create_booking(&db, &booking)?
    };

    if !inserted {
        tracing::info!(
            payment_reference = %booking.payment_reference,
            "duplicate payment event, booking already exists"
        );
        return Ok(CreateOutcome::AlreadyExists);
    }

    tracing::info!(
        booking_id = %booking.id,
        payment_reference = %booking.payment_reference,
        "booking created"
    );

    let notification = Notification::BookingConfirmed {
        customer_name: booking.customer_name.clone(),
        customer_email: booking.customer_email.clone(),
        appointment_time: format_appointment(&booking.appointment_time),
        service_type: booking.service.service_type.clone(),
        total_price_cents: booking.service.total_price_cents,
        deposit_cents: booking.service.deposit_cents,
        manage_url: format!("{}/manage/{}", state.config.base_url, booking.management_token),
    };
    if let Err(e) = state.notifier.notify(&notification).await {
        tracing::error!(error = %e, booking_id = %booking.id, "confirmation notification failed");
    }

    Ok(CreateOutcome::Created(booking))
}

/// Cancels the booking behind `management_token`, refunding per policy.
///
/// Evaluated against the wall-clock `now` of this request; the same booking
/// can be refund-eligible today and forfeit tomorrow.
pub async fn cancel(
    state: &Arc<AppState>,
    management_token: &str,
    now: NaiveDateTime,
) -> anyhow::Result<CancelOutcome> {
    let _guard = state.cancel_guard.lock().await;

    let booking = {
        let db = state.db.lock().unwrap();
        queries::get_booking_by_token(&db, management_token)?
    };
    let Some(booking) = booking else {
        return Ok(CancelOutcome::NotFound);
    };

    match booking.status {
        BookingStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
        BookingStatus::Completed => return Ok(CancelOutcome::NotCancellable),
        BookingStatus::Confirmed => {}
    }

    let policy = RefundPolicy {
        cutoff_hours: state.config.cancellation_cutoff_hours,
        processing_fee_cents: state.config.processing_fee_cents,
    };
    let decision = policy.evaluate(booking.appointment_time, now, booking.service.deposit_cents);

    let payment_status = if decision.tier == RefundTier::Forfeit || decision.refund_cents == 0 {
        PaymentStatus::Forfeited
    } else {
        match state
            .gateway
            .refund(&booking.payment_reference, decision.refund_cents)
            .await
        {
            RefundOutcome::Refunded | RefundOutcome::AlreadyRefunded => {
                if decision.refund_cents == booking.service.deposit_cents {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::RefundedPartial
                }
            }
            RefundOutcome::Declined(reason) => {
                tracing::warn!(booking_id = %booking.id, %reason, "gateway declined refund");
                return Ok(CancelOutcome::RefundFailed {
                    retryable: false,
                    reason,
                });
            }
            RefundOutcome::Transient(reason) => {
                tracing::warn!(booking_id = %booking.id, %reason, "transient gateway failure");
                return Ok(CancelOutcome::RefundFailed {
                    retryable: true,
                    reason,
                });
            }
        }
    };

    let committed = {
        let db = state.db.lock().unwrap();
        queries::transition_from_confirmed(&db, &booking.id, BookingStatus::Cancelled, payment_status)?
    };
    if !committed {
        // Another request won the conditional update in between.
        return Ok(CancelOutcome::AlreadyCancelled);
    }

    tracing::info!(
        booking_id = %booking.id,
        refund_cents = decision.refund_cents,
        payment_status = payment_status.as_str(),
        "booking cancelled"
    );

    let notification = Notification::BookingCancelled {
        customer_name: booking.customer_name.clone(),
        customer_email: booking.customer_email.clone(),
        appointment_time: format_appointment(&booking.appointment_time),
        refunded_cents: decision.refund_cents,
        forfeited: payment_status == PaymentStatus::Forfeited,
    };
    if let Err(e) = state.notifier.notify(&notification).await {
        tracing::error!(error = %e, booking_id = %booking.id, "cancellation notification failed");
    }

    Ok(CancelOutcome::Cancelled {
        tier: decision.tier,
        refund_cents: decision.refund_cents,
        fee_cents: decision.fee_cents,
        payment_status,
    })
}

fn booking_from_session(session: &CheckoutSession) -> Result<Booking, CreateError> {
    let meta = &session.metadata;

    let customer_name = required(&meta.customer_name, "customer_name")?;
    let customer_email = required(&meta.customer_email, "customer_email")?;
    let service_type = required(&meta.service_type, "service_type")?;
    let appointment_raw = required(&meta.appointment_time, "appointment_time")?;

    let appointment_time = parse_appointment(&appointment_raw).ok_or_else(|| {
        CreateError::InvalidMetadata(format!("unparseable appointment_time: {appointment_raw}"))
    })?;

    let total_price_cents = parse_cents(&meta.total_price_cents, "total_price_cents")?;
    let deposit_cents = parse_cents(&meta.deposit_cents, "deposit_cents")?;

    let addons: Vec<String> = meta
        .addons
        .as_deref()
        .map(|raw| serde_json::from_str(raw).unwrap_or_default())
        .unwrap_or_default();

    let now = Utc::now().naive_utc();
    Ok(Booking {
        id: Uuid::new_v4().to_string(),
        customer_name,
        customer_email,
        customer_phone: meta.customer_phone.clone().filter(|p| !p.is_empty()),
        appointment_time,
        service: ServiceSelection {
            service_type,
            addons,
            mobile_service: meta.mobile_service.as_deref() == Some("true"),
            total_price_cents,
            deposit_cents,
        },
        payment_reference: session.id.clone(),
        // Bearer credential: v4 uuid, 122 bits of CSPRNG entropy.
        management_token: Uuid::new_v4().to_string(),
        status: BookingStatus::Confirmed,
        payment_status: PaymentStatus::Paid,
        created_at: now,
        updated_at: now,
    })
}

fn required(value: &Option<String>, field: &str) -> Result<String, CreateError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CreateError::InvalidMetadata(format!("missing {field}")))
}

fn parse_cents(value: &Option<String>, field: &str) -> Result<i64, CreateError> {
    let raw = required(value, field)?;
    raw.parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .ok_or_else(|| CreateError::InvalidMetadata(format!("invalid {field}: {raw}")))
}

fn parse_appointment(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

fn format_appointment(dt: &NaiveDateTime) -> String {
    dt.format("%A, %B %e, %Y at %H:%M").to_string()
}
