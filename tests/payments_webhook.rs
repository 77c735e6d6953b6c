//! End-to-end exercise of the payment webhook route: shared-secret auth
//! and idempotent replay of the same `external_payment_id`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use fleetd::config::FleetConfig;
use fleetd::identity_verify::IdentityVerifier;
use fleetd::provider::{ProviderAdapter, ProviderCredentials};
use fleetd::storage::NodeStore;
use fleetd::FleetContext;

const WEBHOOK_SECRET: &str = "test-webhook-secret";

async fn test_ctx() -> Arc<FleetContext> {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(FleetConfig::new(None, Some(dir.path().to_path_buf()), None));
    let store = Arc::new(NodeStore::new(dir.path()).await.unwrap());
    let provider = Arc::new(ProviderAdapter::new(ProviderCredentials {
        node_provider_base_url: "http://localhost:0".into(),
        node_provider_api_token: "test-token".into(),
        model_router_base_url: "http://localhost:0".into(),
        model_router_admin_key: "test-admin-key".into(),
    }));
    let identity = Arc::new(IdentityVerifier::new(
        "test-google-client".into(),
        "test-apple-bundle".into(),
    ));
    Arc::new(FleetContext::new(
        config,
        store,
        provider,
        identity,
        "test-bearer".into(),
        WEBHOOK_SECRET.into(),
        None,
        None,
    ))
}

fn payment_succeeded_body(external_payment_id: &str) -> Body {
    Body::from(format!(
        r#"{{"type":"payment_succeeded","user_id":"u1","external_payment_id":"{external_payment_id}",
           "amount_cents":2900,"currency":"usd","is_recurring":true,
           "saved_payment_method_token":null,"bot_token":null,"selected_model":null}}"#
    ))
}

#[tokio::test]
async fn webhook_without_shared_secret_is_rejected() {
    let ctx = test_ctx().await;
    let router = fleetd::rest::build_router(ctx);
    let resp = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/webhook")
                .header("content-type", "application/json")
                .body(payment_succeeded_body("pay_1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_accepts_correct_shared_secret_without_bearer_token() {
    let ctx = test_ctx().await;
    let router = fleetd::rest::build_router(ctx);
    let resp = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/webhook")
                .header("content-type", "application/json")
                .header("x-fleetd-webhook-secret", WEBHOOK_SECRET)
                .body(payment_succeeded_body("pay_2"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn replayed_payment_is_recorded_exactly_once() {
    let ctx = test_ctx().await;
    let router = fleetd::rest::build_router(ctx.clone());

    for _ in 0..3 {
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/payments/webhook")
                    .header("content-type", "application/json")
                    .header("x-fleetd-webhook-secret", WEBHOOK_SECRET)
                    .body(payment_succeeded_body("pay_replayed"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // The payments table enforces uniqueness on external_payment_id via
    // ON CONFLICT DO NOTHING — every replay resolves to the same row
    // rather than inserting a duplicate, regardless of how many times the
    // gateway retries delivery.
    let (recorded, is_new) = ctx
        .store
        .record_payment("u1", 2900, "usd", "succeeded", true, "pay_replayed")
        .await
        .unwrap();
    assert_eq!(recorded.external_payment_id, "pay_replayed");
    assert_eq!(recorded.amount, 2900);
    // Already recorded by the three webhook deliveries above — this fourth
    // call observes the existing row, not a fresh insert.
    assert!(!is_new);
}

#[tokio::test]
async fn only_the_first_of_two_duplicate_deliveries_is_a_fresh_insert() {
    let ctx = test_ctx().await;
    let (_, first_is_new) = ctx
        .store
        .record_payment("u2", 2900, "usd", "succeeded", true, "pay_dup")
        .await
        .unwrap();
    let (_, second_is_new) = ctx
        .store
        .record_payment("u2", 2900, "usd", "succeeded", true, "pay_dup")
        .await
        .unwrap();
    assert!(first_is_new);
    assert!(!second_is_new);
}
