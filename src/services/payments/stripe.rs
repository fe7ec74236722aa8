use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::{PaymentGateway, RefundOutcome};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

pub struct StripeGateway {
    secret_key: String,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CheckoutSessionResponse {
    payment_intent: Option<String>,
}

#[derive(Deserialize)]
struct StripeErrorResponse {
    error: Option<StripeErrorBody>,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(secret_key: String, timeout_secs: u64) -> anyhow::Result<Self> {
        Self::with_api_base(secret_key, timeout_secs, STRIPE_API_BASE.to_string())
    }

    pub fn with_api_base(
        secret_key: String,
        timeout_secs: u64,
        api_base: String,
    ) -> anyhow::Result<Self> {
        // The timeout bounds the whole round-trip; a stalled refund call must
        // resolve to Transient, never hang the cancellation request.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build gateway HTTP client")?;
        Ok(Self {
            secret_key,
            api_base,
            client,
        })
    }

    /// The webhook stores the checkout session id; refunds are created
    /// against the underlying payment intent, so resolve it first.
    async fn resolve_payment_intent(&self, session_id: &str) -> Result<String, RefundOutcome> {
        let url = format!("{}/checkout/sessions/{session_id}", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(transport_outcome)?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_outcome(status, response).await);
        }

        let session: CheckoutSessionResponse = response
            .json()
            .await
            .map_err(|e| RefundOutcome::Transient(format!("bad session response: {e}")))?;

        session.payment_intent.ok_or_else(|| {
            RefundOutcome::Declined("checkout session has no payment intent".to_string())
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn refund(&self, payment_reference: &str, amount_cents: i64) -> RefundOutcome {
        let payment_intent = match self.resolve_payment_intent(payment_reference).await {
            Ok(pi) => pi,
            Err(outcome) => return outcome,
        };

        let url = format!("{}/refunds", self.api_base);
        let amount = amount_cents.to_string();
        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(&[
                ("payment_intent", payment_intent.as_str()),
                ("amount", amount.as_str()),
            ])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };

        let status = response.status();
        if status.is_success() {
            tracing::info!(payment_reference, amount_cents, "gateway refund issued");
            return RefundOutcome::Refunded;
        }

        error_outcome(status, response).await
    }
}

fn transport_outcome(e: reqwest::Error) -> RefundOutcome {
    if e.is_timeout() {
        RefundOutcome::Transient("gateway call timed out".to_string())
    } else {
        RefundOutcome::Transient(format!("gateway unreachable: {e}"))
    }
}

async fn error_outcome(status: reqwest::StatusCode, response: reqwest::Response) -> RefundOutcome {
    let body: StripeErrorResponse = response.json().await.unwrap_or(StripeErrorResponse {
        error: None,
    });
    let code = body.error.as_ref().and_then(|e| e.code.clone());
    let message = body
        .error
        .and_then(|e| e.message)
        .unwrap_or_else(|| format!("gateway returned {status}"));

    if code.as_deref() == Some("charge_already_refunded") {
        return RefundOutcome::AlreadyRefunded;
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return RefundOutcome::Transient(message);
    }
    RefundOutcome::Declined(message)
}
