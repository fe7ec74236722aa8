use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::config::AppConfig;
use crate::services::notify::Notifier;
use crate::services::payments::webhook::WebhookVerifier;
use crate::services::payments::PaymentGateway;

pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: AppConfig,
    pub verifier: WebhookVerifier,
    pub gateway: Box<dyn PaymentGateway>,
    pub notifier: Box<dyn Notifier>,
    /// Serializes cancellations within this process so concurrent requests
    /// for one booking issue at most one gateway call. The store's guarded
    /// update stays the authoritative cross-process guard.
    pub cancel_guard: tokio::sync::Mutex<()>,
}
