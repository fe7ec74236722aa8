use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub base_url: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub resend_api_key: String,
    pub owner_email: String,
    /// Hours before the appointment under which the deposit is forfeited.
    pub cancellation_cutoff_hours: i64,
    /// Fee withheld from refund-eligible cancellations, in cents.
    pub processing_fee_cents: i64,
    /// Timeout for synchronous gateway calls, in seconds.
    pub gateway_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "depositdesk.db".to_string()),
            base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            resend_api_key: env::var("RESEND_API_KEY").unwrap_or_default(),
            owner_email: env::var("OWNER_EMAIL").unwrap_or_default(),
            cancellation_cutoff_hours: env::var("CANCELLATION_CUTOFF_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            processing_fee_cents: env::var("PROCESSING_FEE_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
            gateway_timeout_secs: env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}
