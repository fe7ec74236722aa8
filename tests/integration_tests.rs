use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use depositdesk::config::AppConfig;
use depositdesk::db::{self, queries};
use depositdesk::handlers;
use depositdesk::models::{Booking, BookingStatus, PaymentStatus, ServiceSelection};
use depositdesk::services::notify::{Notification, Notifier};
use depositdesk::services::payments::webhook::WebhookVerifier;
use depositdesk::services::payments::{PaymentGateway, RefundOutcome};
use depositdesk::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_test_secret";

// ── Mock Providers ──

struct MockGateway {
    outcome: RefundOutcome,
    calls: Arc<Mutex<Vec<(String, i64)>>>,
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn refund(&self, payment_reference: &str, amount_cents: i64) -> RefundOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((payment_reference.to_string(), amount_cents));
        self.outcome.clone()
    }
}

struct MockNotifier {
    sent: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let tag = match notification {
            Notification::BookingConfirmed { .. } => "confirmed",
            Notification::BookingCancelled { .. } => "cancelled",
        };
        self.sent.lock().unwrap().push(tag);
        Ok(())
    }
}

// ── Helpers ──

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        base_url: "http://localhost:3000".to_string(),
        stripe_secret_key: "sk_test_unused".to_string(),
        stripe_webhook_secret: WEBHOOK_SECRET.to_string(),
        resend_api_key: "".to_string(),
        owner_email: "owner@example.com".to_string(),
        cancellation_cutoff_hours: 24,
        processing_fee_cents: 200,
        gateway_timeout_secs: 10,
    }
}

struct TestHarness {
    state: Arc<AppState>,
    refund_calls: Arc<Mutex<Vec<(String, i64)>>>,
    notifications: Arc<Mutex<Vec<&'static str>>>,
}

fn harness_with(outcome: RefundOutcome, config: AppConfig) -> TestHarness {
    let conn = db::init_db(":memory:").unwrap();
    let refund_calls = Arc::new(Mutex::new(vec![]));
    let notifications = Arc::new(Mutex::new(vec![]));

    let state = Arc::new(AppState {
        db: Arc::new(Mutex::new(conn)),
        verifier: WebhookVerifier::new(config.stripe_webhook_secret.clone()),
        config,
        gateway: Box::new(MockGateway {
            outcome,
            calls: Arc::clone(&refund_calls),
        }),
        notifier: Box::new(MockNotifier {
            sent: Arc::clone(&notifications),
        }),
        cancel_guard: tokio::sync::Mutex::new(()),
    });

    TestHarness {
        state,
        refund_calls,
        notifications,
    }
}

fn harness(outcome: RefundOutcome) -> TestHarness {
    harness_with(outcome, test_config())
}

fn test_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/webhook/stripe", post(handlers::webhook::stripe_webhook))
        .route("/api/booking", get(handlers::booking::get_booking))
        .route("/api/cancel", post(handlers::booking::cancel_booking))
        .with_state(state)
}

fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn event_body(payment_reference: &str) -> String {
    serde_json::json!({
        "id": "evt_test_1",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": payment_reference,
            "metadata": {
                "customer_name": "Jordan Vega",
                "customer_email": "jordan@example.com",
                "customer_phone": "+15550001111",
                "appointment_time": "2026-03-10T14:00:00Z",
                "service_type": "full-detail",
                "addons": "[\"wax\",\"interior\"]",
                "mobile_service": "true",
                "total_price_cents": "12000",
                "deposit_cents": "3000"
            }
        }}
    })
    .to_string()
}

fn signed_webhook_request(body: &str, secret: &str) -> Request<Body> {
    let ts = Utc::now().timestamp();
    let header = format!("t={ts},v1={}", sign(secret, ts, body));
    Request::builder()
        .method("POST")
        .uri("/webhook/stripe")
        .header("Stripe-Signature", header)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn cancel_request(token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/cancel")
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::json!({ "token": token }).to_string(),
        ))
        .unwrap()
}

async fn body_json(res: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Inserts a confirmed, paid booking directly into the store.
fn seed_booking(state: &Arc<AppState>, hours_until_appointment: i64, deposit_cents: i64) -> Booking {
    let now = Utc::now().naive_utc();
    let booking = Booking {
        id: Uuid::new_v4().to_string(),
        customer_name: "Jordan Vega".to_string(),
        customer_email: "jordan@example.com".to_string(),
        customer_phone: None,
        appointment_time: now + Duration::hours(hours_until_appointment),
        service: ServiceSelection {
            service_type: "full-detail".to_string(),
            addons: vec![],
            mobile_service: false,
            total_price_cents: 12000,
            deposit_cents,
        },
        payment_reference: format!("cs_{}", Uuid::new_v4().simple()),
        management_token: Uuid::new_v4().to_string(),
        status: BookingStatus::Confirmed,
        payment_status: PaymentStatus::Paid,
        created_at: now,
        updated_at: now,
    };
    let db = state.db.lock().unwrap();
    assert!(queries::create_booking(&db, &booking).unwrap());
    booking
}

fn load_by_reference(state: &Arc<AppState>, payment_reference: &str) -> Option<Booking> {
    let db = state.db.lock().unwrap();
    queries::get_booking_by_payment_reference(&db, payment_reference).unwrap()
}

// ── Health ──

#[tokio::test]
async fn test_health() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state);

    let res = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
}

// ── Webhook / Booking Creation ──

#[tokio::test]
async fn test_webhook_creates_booking() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state.clone());

    let body = event_body("cs_abc");
    let res = app
        .oneshot(signed_webhook_request(&body, WEBHOOK_SECRET))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["received"], true);

    let booking = load_by_reference(&h.state, "cs_abc").expect("booking should exist");
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment_status, PaymentStatus::Paid);
    assert_eq!(booking.service.deposit_cents, 3000);
    assert_eq!(booking.service.addons, vec!["wax", "interior"]);
    assert!(booking.service.mobile_service);
    assert!(!booking.management_token.is_empty());

    assert_eq!(*h.notifications.lock().unwrap(), vec!["confirmed"]);
}

#[tokio::test]
async fn test_webhook_duplicate_event_is_noop() {
    let h = harness(RefundOutcome::Refunded);
    let body = event_body("cs_dup");

    for _ in 0..2 {
        let app = test_app(h.state.clone());
        let res = app
            .oneshot(signed_webhook_request(&body, WEBHOOK_SECRET))
            .await
            .unwrap();
        // The redelivery is acknowledged like the first delivery.
        assert_eq!(res.status(), StatusCode::OK);
    }

    let count: i64 = {
        let db = h.state.db.lock().unwrap();
        db.query_row(
            "SELECT COUNT(*) FROM bookings WHERE payment_reference = 'cs_dup'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert_eq!(count, 1);
    assert_eq!(*h.notifications.lock().unwrap(), vec!["confirmed"]);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state.clone());

    let body = event_body("cs_bad_sig");
    let res = app
        .oneshot(signed_webhook_request(&body, "whsec_wrong"))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(load_by_reference(&h.state, "cs_bad_sig").is_none());
}

#[tokio::test]
async fn test_webhook_rejects_missing_signature() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state.clone());

    let res = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/stripe")
                .header("Content-Type", "application/json")
                .body(Body::from(event_body("cs_no_sig")))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(load_by_reference(&h.state, "cs_no_sig").is_none());
}

#[tokio::test]
async fn test_webhook_acknowledges_other_event_types() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state.clone());

    let body = serde_json::json!({
        "id": "evt_other",
        "type": "payment_intent.created",
        "data": { "object": { "id": "pi_123" } }
    })
    .to_string();

    let res = app
        .oneshot(signed_webhook_request(&body, WEBHOOK_SECRET))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["received"], true);
    assert!(h.notifications.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_rejects_missing_metadata() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state.clone());

    let body = serde_json::json!({
        "id": "evt_partial",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_partial",
            "metadata": { "customer_name": "Jordan Vega" }
        }}
    })
    .to_string();

    let res = app
        .oneshot(signed_webhook_request(&body, WEBHOOK_SECRET))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(load_by_reference(&h.state, "cs_partial").is_none());
}

#[tokio::test]
async fn test_webhook_storage_failure_triggers_redelivery() {
    let h = harness(RefundOutcome::Refunded);
    {
        // Break the store out from under the handler; any write now fails
        // with something other than the idempotency conflict.
        let db = h.state.db.lock().unwrap();
        db.execute_batch("DROP TABLE bookings").unwrap();
    }

    let app = test_app(h.state.clone());
    let body = event_body("cs_store_down");
    let res = app
        .oneshot(signed_webhook_request(&body, WEBHOOK_SECRET))
        .await
        .unwrap();

    // Unlike the duplicate-event no-op, a storage failure must be a non-2xx
    // so the gateway redelivers the event later.
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.notifications.lock().unwrap().is_empty());
}

// ── Cancellation ──

#[tokio::test]
async fn test_cancel_early_refunds_deposit_minus_fee() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["refunded_cents"], 2800);
    assert_eq!(json["payment_status"], "refunded_partial");
    let message = json["message"].as_str().unwrap();
    assert!(message.contains("$28.00"), "message was: {message}");

    assert_eq!(
        *h.refund_calls.lock().unwrap(),
        vec![(booking.payment_reference.clone(), 2800)]
    );

    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(stored.payment_status, PaymentStatus::RefundedPartial);

    assert_eq!(*h.notifications.lock().unwrap(), vec!["cancelled"]);
}

#[tokio::test]
async fn test_cancel_twice_refunds_once() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 48, 3000);

    let res = test_app(h.state.clone())
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = test_app(h.state.clone())
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let json = body_json(res).await;
    assert_eq!(json["error"], "booking already cancelled");

    assert_eq!(h.refund_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_late_forfeits_without_gateway_call() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 2, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["refunded_cents"], 0);
    assert_eq!(json["payment_status"], "forfeited");

    assert!(h.refund_calls.lock().unwrap().is_empty());

    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(stored.payment_status, PaymentStatus::Forfeited);
}

#[tokio::test]
async fn test_cancel_unknown_token() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state);

    let res = app.oneshot(cancel_request("no-such-token")).await.unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_completed_booking_is_rejected() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 48, 3000);
    {
        let db = h.state.db.lock().unwrap();
        assert!(queries::transition_from_confirmed(
            &db,
            &booking.id,
            BookingStatus::Completed,
            PaymentStatus::Paid,
        )
        .unwrap());
    }

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert!(h.refund_calls.lock().unwrap().is_empty());

    // Completed is terminal; nothing moved it back or out.
    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Completed);
}

#[tokio::test]
async fn test_terminal_states_resist_further_transitions() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 48, 3000);

    let db = h.state.db.lock().unwrap();
    assert!(queries::transition_from_confirmed(
        &db,
        &booking.id,
        BookingStatus::Cancelled,
        PaymentStatus::Forfeited,
    )
    .unwrap());

    // The guarded update refuses a second transition of any kind.
    assert!(!queries::transition_from_confirmed(
        &db,
        &booking.id,
        BookingStatus::Completed,
        PaymentStatus::Paid,
    )
    .unwrap());

    let stored = queries::get_booking_by_token(&db, &booking.management_token)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn test_declined_refund_leaves_booking_confirmed() {
    let h = harness(RefundOutcome::Declined("card issuer refused".to_string()));
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::CONFLICT);
    let json = body_json(res).await;
    assert_eq!(json["retryable"], false);

    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert!(h.notifications.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_refund_failure_is_retryable() {
    let h = harness(RefundOutcome::Transient("gateway call timed out".to_string()));
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(res).await;
    assert_eq!(json["retryable"], true);

    // No commit happened; a retry starts from confirmed.
    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_already_refunded_gateway_outcome_commits_cancellation() {
    let h = harness(RefundOutcome::AlreadyRefunded);
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(stored.payment_status, PaymentStatus::RefundedPartial);
}

#[tokio::test]
async fn test_zero_fee_commits_full_refund_status() {
    let mut config = test_config();
    config.processing_fee_cents = 0;
    let h = harness_with(RefundOutcome::Refunded, config);
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["refunded_cents"], 3000);
    assert_eq!(json["payment_status"], "refunded");

    assert_eq!(
        *h.refund_calls.lock().unwrap(),
        vec![(booking.payment_reference.clone(), 3000)]
    );
}

#[tokio::test]
async fn test_early_cancel_with_fee_covering_deposit() {
    let mut config = test_config();
    config.processing_fee_cents = 5000;
    let h = harness_with(RefundOutcome::Refunded, config);
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(cancel_request(&booking.management_token))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["refunded_cents"], 0);
    assert_eq!(json["payment_status"], "forfeited");

    // Early cancellation with a saturated refund must not be described as a
    // late-notice forfeit.
    let message = json["message"].as_str().unwrap();
    assert!(message.contains("processing fee"), "message was: {message}");
    assert!(!message.contains("notice"), "message was: {message}");

    // A zero-amount refund never reaches the gateway.
    assert!(h.refund_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_cancels_issue_one_refund() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 48, 3000);

    let app1 = test_app(h.state.clone());
    let app2 = test_app(h.state.clone());
    let (res1, res2) = tokio::join!(
        app1.oneshot(cancel_request(&booking.management_token)),
        app2.oneshot(cancel_request(&booking.management_token)),
    );
    let statuses = [res1.unwrap().status(), res2.unwrap().status()];

    let wins = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let losses = statuses
        .iter()
        .filter(|s| **s == StatusCode::CONFLICT)
        .count();
    assert_eq!(wins, 1, "exactly one cancel should win: {statuses:?}");
    assert_eq!(losses, 1);

    assert_eq!(h.refund_calls.lock().unwrap().len(), 1);

    let stored = load_by_reference(&h.state, &booking.payment_reference).unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
}

// ── Lookup ──

#[tokio::test]
async fn test_lookup_returns_redacted_projection() {
    let h = harness(RefundOutcome::Refunded);
    let booking = seed_booking(&h.state, 48, 3000);

    let app = test_app(h.state.clone());
    let res = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/booking?token={}", booking.management_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let raw = String::from_utf8(body.to_vec()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(json["booking"]["customer_name"], "Jordan Vega");
    assert_eq!(json["booking"]["service_type"], "full-detail");
    assert_eq!(json["booking"]["status"], "confirmed");

    // Credentials never round-trip through the projection.
    assert!(!raw.contains(&booking.payment_reference));
    assert!(!raw.contains(&booking.management_token));
}

#[tokio::test]
async fn test_lookup_unknown_token() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state);

    let res = app
        .oneshot(
            Request::builder()
                .uri("/api/booking?token=nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lookup_requires_token() {
    let h = harness(RefundOutcome::Refunded);
    let app = test_app(h.state);

    let res = app
        .oneshot(
            Request::builder()
                .uri("/api/booking")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
