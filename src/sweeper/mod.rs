//! Renewal / expiry sweeper. Daily loop grounded on the same
//! `tasks::jobs` periodic-loop shape used by the Pool Maintainer, offset
//! so it runs at approximately 03:00 local time on first tick (matching
//! the teacher's `main.rs` staggered 24h prune/vacuum loop), then every
//! 24h thereafter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tracing::{info, warn};
use uuid::Uuid;

use crate::lifecycle::{LifecycleController, Transition};
use crate::provider::{KeyPatch, ProviderAdapter};
use crate::storage::NodeStore;

const TICK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_HOUR_LOCAL: u32 = 3;

/// Opaque handle to the payment-gateway collaborator — only
/// `submit_charge` is needed here; the rest of the gateway's surface is
/// consumed via the webhook route, not by the sweeper.
#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn submit_charge(
        &self,
        token: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> anyhow::Result<()>;
}

/// Concrete `PaymentGateway`, same request-timeout shape as
/// `ProviderAdapter`'s client. The gateway's wire format is out of scope
/// (§12 lists it as an interface only) — this posts a minimal charge
/// request and treats any non-2xx as failure.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client builder should not fail with these options");
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn submit_charge(
        &self,
        token: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "payment_method_token": token,
                "amount_cents": amount_cents,
                "currency": "usd",
            }))
            .send()
            .await?;
        anyhow::ensure!(resp.status().is_success(), "charge submission returned {}", resp.status());
        Ok(())
    }
}

pub struct Sweeper {
    store: Arc<NodeStore>,
    provider: Arc<ProviderAdapter>,
    gateway: Arc<dyn PaymentGateway>,
    lifecycle: Arc<LifecycleController>,
}

impl Sweeper {
    pub fn new(
        store: Arc<NodeStore>,
        provider: Arc<ProviderAdapter>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleController::new(store.clone()));
        Self {
            store,
            provider,
            gateway,
            lifecycle,
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            tokio::time::sleep(time_until_next_sweep_hour()).await;
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(err = %e, "renewal/expiry sweep failed");
                }
            }
        });
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        let expiring = self.store.list_expiring_subscriptions().await?;
        info!(count = expiring.len(), "running renewal/expiry sweep");

        for sub in expiring {
            if sub.auto_renew {
                if let Some(token) = &sub.saved_payment_method_token {
                    let idempotency_key = Uuid::new_v4().to_string();
                    // The period is extended by the payment webhook handler
                    // when the charge succeeds, not here — a sweeper-side
                    // extension would race a concurrently arriving webhook.
                    if let Err(e) = self
                        .gateway
                        .submit_charge(token, default_charge_amount_cents(), &idempotency_key)
                        .await
                    {
                        warn!(user_id = %sub.user_id, err = %e, "recurring charge submission failed");
                    }
                } else {
                    warn!(user_id = %sub.user_id, "auto-renew set but no saved payment token");
                }
            } else {
                self.expire_subscription(&sub.user_id).await?;
            }
        }
        Ok(())
    }

    async fn expire_subscription(&self, user_id: &str) -> anyhow::Result<()> {
        info!(user_id = %user_id, "expiring subscription");
        self.store.mark_subscription_expired(user_id).await?;

        if let Some(profile) = self.store.get_user_profile(user_id).await? {
            if let Some(handle) = profile.model_router_key_id {
                self.provider
                    .patch_key(
                        &handle,
                        KeyPatch {
                            disabled: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        // The node row itself is not deleted here — only the pool
        // maintainer or an operator deletes rows, and only once
        // `deactivated`.
        for state in ["active"] {
            let nodes = self.store.list_nodes_by_state(state).await?;
            if let Some(node) = nodes.into_iter().find(|n| n.binding_user.as_deref() == Some(user_id)) {
                if let (Some(ip), Some(password)) = (node.ip.clone(), node.ssh_password.clone()) {
                    let creds = crate::ssh_driver::SshCredentials {
                        host: ip,
                        port: node.ssh_port as u16,
                        user: node.ssh_user.clone(),
                        password,
                    };
                    match crate::ssh_driver::connect(&creds, node.host_key_fingerprint.as_deref()).await {
                        Ok(session) => {
                            if let Err(e) = crate::convergence::stop_runtime_container(&session).await {
                                warn!(node_id = %node.id, err = %e, "failed to stop runtime container on expiry");
                            }
                        }
                        Err(e) => {
                            warn!(node_id = %node.id, err = %e, "failed to connect to node to stop runtime container on expiry");
                        }
                    }
                }
                self.lifecycle.apply(&node.id, Transition::Deactivate).await?;
            }
        }
        Ok(())
    }
}

fn default_charge_amount_cents() -> i64 {
    2_900
}

fn time_until_next_sweep_hour() -> Duration {
    let now = Local::now();
    let today_target = now
        .date_naive()
        .and_hms_opt(SWEEP_HOUR_LOCAL, 0, 0)
        .expect("valid time");
    let target = if now.hour() < SWEEP_HOUR_LOCAL {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    let target = target.and_local_timezone(Local).single().unwrap_or(now);
    (target - now).to_std().unwrap_or(Duration::from_secs(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_delay_is_never_negative_and_bounded_by_a_day() {
        let delay = time_until_next_sweep_hour();
        assert!(delay <= Duration::from_secs(24 * 60 * 60));
    }
}
