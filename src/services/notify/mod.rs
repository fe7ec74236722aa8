pub mod resend;

use async_trait::async_trait;

/// Post-transition notifications, one variant per lifecycle event so call
/// sites handle the set exhaustively.
#[derive(Debug, Clone)]
pub enum Notification {
    BookingConfirmed {
        customer_name: String,
        customer_email: String,
        appointment_time: String,
        service_type: String,
        total_price_cents: i64,
        deposit_cents: i64,
        manage_url: String,
    },
    BookingCancelled {
        customer_name: String,
        customer_email: String,
        appointment_time: String,
        refunded_cents: i64,
        forfeited: bool,
    },
}

/// Best-effort side channel. Failures are logged by callers and never roll
/// back a committed booking transition.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Used when no mail provider is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(?notification, "notifier not configured, dropping notification");
        Ok(())
    }
}
