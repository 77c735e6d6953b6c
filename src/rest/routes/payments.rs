//! `POST /payments/webhook/...` — the one route that is NOT behind bearer
//! auth. Validated by a shared secret header instead, since the caller is
//! the payment gateway, not an operator.
//!
//! Payments are recorded idempotently by `external_payment_id` before any
//! assignment work is dispatched — replays of the same event are a no-op
//! past the first `record_payment` call.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::assignment::PaymentSucceeded;
use crate::FleetContext;

const SIGNATURE_HEADER: &str = "x-fleetd-webhook-secret";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookEvent {
    PaymentSucceeded {
        user_id: String,
        external_payment_id: String,
        amount_cents: i64,
        currency: String,
        is_recurring: bool,
        saved_payment_method_token: Option<String>,
        bot_token: Option<String>,
        selected_model: Option<String>,
    },
    PaymentRefunded {
        user_id: String,
        external_payment_id: String,
    },
    SubscriptionCancelled {
        user_id: String,
    },
}

pub async fn webhook(
    State(ctx): State<Arc<FleetContext>>,
    headers: HeaderMap,
    Json(event): Json<WebhookEvent>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let presented = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !crate::rest::auth::constant_time_eq(
        presented.as_bytes(),
        ctx.payment_gateway_webhook_secret.as_bytes(),
    ) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook secret" })),
        ));
    }

    match event {
        WebhookEvent::PaymentSucceeded {
            user_id,
            external_payment_id,
            amount_cents,
            currency,
            is_recurring,
            saved_payment_method_token,
            bot_token,
            selected_model,
        } => {
            let (_, is_new) = ctx
                .store
                .record_payment(
                    &user_id,
                    amount_cents,
                    &currency,
                    "succeeded",
                    is_recurring,
                    &external_payment_id,
                )
                .await
                .map_err(internal_error)?;

            if is_new {
                let assignment = ctx.assignment.clone();
                tokio::spawn(async move {
                    assignment
                        .handle_payment_succeeded(PaymentSucceeded {
                            user_id,
                            saved_payment_method_token,
                            bot_token,
                            selected_model,
                        })
                        .await;
                });
            } else {
                warn!(
                    user_id = %user_id,
                    external_payment_id = %external_payment_id,
                    "duplicate payment_succeeded webhook — assignment already dispatched"
                );
            }
        }
        WebhookEvent::PaymentRefunded {
            user_id,
            external_payment_id,
        } => {
            ctx.store
                .record_payment(&user_id, 0, "usd", "refunded", false, &external_payment_id)
                .await
                .map_err(internal_error)?;
            warn!(user_id = %user_id, "payment refunded — subscription left active until expiry sweep");
        }
        WebhookEvent::SubscriptionCancelled { user_id } => {
            ctx.store
                .mark_subscription_expired(&user_id)
                .await
                .map_err(internal_error)?;
        }
    }

    Ok(StatusCode::OK)
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!(err = %e, "webhook processing failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}
