pub mod stripe;
pub mod webhook;

use async_trait::async_trait;

/// Outcome of a refund attempt, mapped from the gateway's error taxonomy.
///
/// `Transient` covers timeouts, network failures and rate limiting — safe to
/// retry. `Declined` is permanent; the caller surfaces it instead of
/// retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    AlreadyRefunded,
    Declined(String),
    Transient(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Issues a refund of `amount_cents` against the payment that funded
    /// `payment_reference` (a checkout session id).
    async fn refund(&self, payment_reference: &str, amount_cents: i64) -> RefundOutcome;
}

/// Gateway stand-in for local development without a Stripe key. Logs the
/// request and reports success.
pub struct LoggingGateway;

#[async_trait]
impl PaymentGateway for LoggingGateway {
    async fn refund(&self, payment_reference: &str, amount_cents: i64) -> RefundOutcome {
        tracing::info!(payment_reference, amount_cents, "dev gateway: pretending to refund");
        RefundOutcome::Refunded
    }
}
