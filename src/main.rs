use std::sync::{Arc, Mutex};

use axum::routing::{get, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use depositdesk::config::AppConfig;
use depositdesk::db;
use depositdesk::handlers;
use depositdesk::services::notify::resend::ResendNotifier;
use depositdesk::services::notify::{NoopNotifier, Notifier};
use depositdesk::services::payments::stripe::StripeGateway;
use depositdesk::services::payments::webhook::WebhookVerifier;
use depositdesk::services::payments::{LoggingGateway, PaymentGateway};
use depositdesk::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let conn = db::init_db(&config.database_url)?;

    if config.stripe_webhook_secret.is_empty() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; all webhook deliveries will be rejected");
    }

    let gateway: Box<dyn PaymentGateway> = if config.stripe_secret_key.is_empty() {
        tracing::warn!("STRIPE_SECRET_KEY not set; refunds will be logged, not issued");
        Box::new(LoggingGateway)
    } else {
        Box::new(StripeGateway::new(
            config.stripe_secret_key.clone(),
            config.gateway_timeout_secs,
        )?)
    };

    let notifier: Box<dyn Notifier> = if config.resend_api_key.is_empty() {
        tracing::warn!("RESEND_API_KEY not set; notifications disabled");
        Box::new(NoopNotifier)
    } else {
        Box::new(ResendNotifier::new(
            config.resend_api_key.clone(),
            config.owner_email.clone(),
        ))
    };

    let state = Arc::new(AppState {
        db: Arc::new(Mutex::new(conn)),
        verifier: WebhookVerifier::new(config.stripe_webhook_secret.clone()),
        config: config.clone(),
        gateway,
        notifier,
        cancel_guard: tokio::sync::Mutex::new(()),
    });

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/webhook/stripe", post(handlers::webhook::stripe_webhook))
        .route("/api/booking", get(handlers::booking::get_booking))
        .route("/api/cancel", post(handlers::booking::cancel_booking))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
