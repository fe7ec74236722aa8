use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Maximum accepted age (and future skew) of a signed event, in seconds.
/// Bounds the replay window for captured webhook payloads.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    MissingSecret,

    #[error("missing signature header")]
    MissingSignature,

    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("event timestamp outside tolerance")]
    StaleTimestamp,

    #[error("unparseable event payload: {0}")]
    Payload(String),
}

/// A verified gateway event. `data.object` stays untyped until the event
/// type is known; only `checkout.session.completed` carries a shape we use.
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub metadata: BookingMetadata,
}

/// Stripe metadata is a flat string map; every field arrives as text and is
/// validated/parsed by the booking creator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingMetadata {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub appointment_time: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    /// "true"/"false" string, Stripe metadata being text-only.
    #[serde(default)]
    pub mobile_service: Option<String>,
    #[serde(default)]
    pub addons: Option<String>,
    #[serde(default)]
    pub total_price_cents: Option<String>,
    #[serde(default)]
    pub deposit_cents: Option<String>,
}

impl StripeEvent {
    pub fn is_payment_confirmation(&self) -> bool {
        self.event_type == "checkout.session.completed"
    }

    pub fn checkout_session(&self) -> Result<CheckoutSession, WebhookError> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| WebhookError::Payload(e.to_string()))
    }
}

/// Verifies and decodes inbound gateway events.
///
/// Signature scheme: `Stripe-Signature: t=<unix>,v1=<hex hmac>`, where the
/// HMAC-SHA256 of `"{t}.{raw body}"` is keyed with the shared webhook
/// secret. Verification must pass before anything downstream looks at the
/// payload; a failure never reaches the store.
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<StripeEvent, WebhookError> {
        if self.secret.is_empty() {
            return Err(WebhookError::MissingSecret);
        }
        if signature_header.is_empty() {
            return Err(WebhookError::MissingSignature);
        }

        let (timestamp, signature) = parse_signature_header(signature_header)?;

        let age = Utc::now().timestamp() - timestamp;
        if age.abs() > TIMESTAMP_TOLERANCE_SECS {
            return Err(WebhookError::StaleTimestamp);
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = mac.finalize().into_bytes();

        if !constant_time_eq(&expected, &signature) {
            return Err(WebhookError::InvalidSignature);
        }

        serde_json::from_slice(payload).map_err(|e| WebhookError::Payload(e.to_string()))
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, Vec<u8>), WebhookError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(WebhookError::MalformedHeader("expected key=value".to_string()));
        };
        match key.trim() {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    WebhookError::MalformedHeader("invalid timestamp".to_string())
                })?);
            }
            "v1" => {
                signature = Some(hex::decode(value).map_err(|_| {
                    WebhookError::MalformedHeader("invalid signature hex".to_string())
                })?);
            }
            // Unknown scheme versions are ignored for forward compatibility.
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        (None, _) => Err(WebhookError::MalformedHeader("missing timestamp".to_string())),
        (_, None) => Err(WebhookError::MalformedHeader("missing v1 signature".to_string())),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
