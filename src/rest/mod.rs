//! External API Surface — the REST interface fronted by the gateway.
//!
//! Every mutating route runs behind [`auth::require_bearer_token`] except
//! the payment webhook (shared-secret auth) and `/internal/ws-auth`
//! (gateway-token auth). Health and status are read-only and unauthenticated
//! — status only ever returns data scoped to the `user_id` the caller
//! already knows.

pub mod auth;
pub mod routes;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::FleetContext;

pub fn build_router(ctx: Arc<FleetContext>) -> Router {
    let public = Router::new()
        .route("/healthz", get(routes::health::health))
        .route("/server/status", get(routes::status::status))
        .route("/payments/webhook", post(routes::payments::webhook))
        .route("/internal/ws-auth", get(routes::ws_auth::ws_auth));

    let authenticated = Router::new()
        .route("/server/redeploy", post(routes::redeploy::redeploy))
        .route("/server/set-model", post(routes::model::set_model))
        .route("/server/skills/install", post(routes::skills::install))
        .route("/server/skills/uninstall", post(routes::skills::uninstall))
        .route("/server/pairing/approve", post(routes::pairing::approve))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_bearer_token,
        ));

    public
        .merge(authenticated)
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_ctx() -> Arc<FleetContext> {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(crate::config::FleetConfig::new(
            None,
            Some(dir.path().to_path_buf()),
            None,
        ));
        let store = Arc::new(crate::storage::NodeStore::new(dir.path()).await.unwrap());
        let provider = Arc::new(crate::provider::ProviderAdapter::new(
            crate::provider::ProviderCredentials {
                node_provider_base_url: "http://localhost:0".into(),
                node_provider_api_token: "test-token".into(),
                model_router_base_url: "http://localhost:0".into(),
                model_router_admin_key: "test-admin-key".into(),
            },
        ));
        let identity = Arc::new(crate::identity_verify::IdentityVerifier::new(
            "test-google-client".into(),
            "test-apple-bundle".into(),
        ));
        Arc::new(FleetContext::new(
            config,
            store,
            provider,
            identity,
            "test-bearer".into(),
            "test-webhook-secret".into(),
            None,
            None,
        ))
    }

    #[tokio::test]
    async fn health_is_reachable_without_auth() {
        let router = build_router(test_ctx().await);
        let resp = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn redeploy_without_bearer_token_is_rejected() {
        let router = build_router(test_ctx().await);
        let resp = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/server/redeploy")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"user_id":"u1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
