//! Binds a node to a paying subscriber on `PaymentSucceeded`. Grounded on
//! the Node Store's atomic claim primitive plus
//! `providers_onboarding::handlers`'s "validate then persist" webhook
//! discipline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::convergence::{self, DesiredSpec, DmPolicy};
use crate::lifecycle::{ConvergenceOutcome, LifecycleController, Transition};
use crate::provider::{KeyPatch, ProviderAdapter};
use crate::ssh_driver::{self, SshCredentials};
use crate::storage::NodeStore;

const CLAIM_CANDIDATES: usize = 5;

#[derive(Debug, Clone)]
pub struct PaymentSucceeded {
    pub user_id: String,
    pub saved_payment_method_token: Option<String>,
    pub bot_token: Option<String>,
    pub selected_model: Option<String>,
}

pub struct AssignmentCoordinator {
    store: Arc<NodeStore>,
    provider: Arc<ProviderAdapter>,
    lifecycle: Arc<LifecycleController>,
    default_monthly_limit_usd: f64,
    admin_webhook_url: Option<String>,
    sales_chatbot_webhook_url: Option<String>,
}

impl AssignmentCoordinator {
    pub fn new(
        store: Arc<NodeStore>,
        provider: Arc<ProviderAdapter>,
        lifecycle: Arc<LifecycleController>,
        default_monthly_limit_usd: f64,
        admin_webhook_url: Option<String>,
        sales_chatbot_webhook_url: Option<String>,
    ) -> Self {
        Self {
            store,
            provider,
            lifecycle,
            default_monthly_limit_usd,
            admin_webhook_url,
            sales_chatbot_webhook_url,
        }
    }

    /// Handle `PaymentSucceeded` detached from the webhook handler that
    /// received it — the caller enqueues this via `tokio::spawn` and
    /// returns `200` to the payment gateway immediately.
    pub async fn handle_payment_succeeded(&self, event: PaymentSucceeded) {
        if let Err(e) = self.handle_inner(&event).await {
            warn!(user_id = %event.user_id, err = %e, "assignment failed");
            if let Some(url) = &self.admin_webhook_url {
                crate::provider::notify_admin(
                    url,
                    &format!("assignment failed for user {}: {e}", event.user_id),
                )
                .await;
            }
        }
    }

    async fn handle_inner(&self, event: &PaymentSucceeded) -> anyhow::Result<()> {
        self.store
            .activate_or_extend_subscription(
                &event.user_id,
                event.saved_payment_method_token.as_deref(),
            )
            .await?;
        if let Some(bot_token) = &event.bot_token {
            self.store
                .set_profile_bot_credentials(&event.user_id, bot_token, None)
                .await?;
        }
        if let Some(model) = &event.selected_model {
            self.store
                .set_profile_selected_model(&event.user_id, model)
                .await?;
        }

        // Already owns a node? Re-enable the key (idempotent) and stop.
        if let Some(existing) = self.find_existing_node(&event.user_id).await? {
            if let Some(profile) = self.store.get_user_profile(&event.user_id).await? {
                if let Some(handle) = profile.model_router_key_id {
                    self.provider
                        .patch_key(
                            &handle,
                            KeyPatch {
                                disabled: Some(false),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
            info!(node_id = %existing.id, user_id = %event.user_id, "reused existing binding");
            return Ok(());
        }

        let claimed_node_id = self.claim_any_node(&event.user_id).await?;

        let warm = claimed_node_id.is_some();
        let node_id = match claimed_node_id {
            Some(id) => id,
            None => {
                if let Some(url) = &self.admin_webhook_url {
                    crate::provider::notify_admin(
                        url,
                        &format!(
                            "no available node for user {} — provisioning slow path",
                            event.user_id
                        ),
                    )
                    .await;
                }
                self.slow_path_create_and_claim(&event.user_id).await?
            }
        };

        self.mint_and_deploy(&node_id, &event.user_id, warm).await
    }

    async fn find_existing_node(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<crate::storage::NodeRow>> {
        for state in ["active", "creating", "provisioning"] {
            let nodes = self.store.list_nodes_by_state(state).await?;
            if let Some(node) = nodes
                .into_iter()
                .find(|n| n.binding_user.as_deref() == Some(user_id) && n.state != "deactivated")
            {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Bounded loop over a handful of candidates: never assume the first
    /// candidate is still free — re-read and try the next on a failed
    /// claim.
    async fn claim_any_node(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        let candidates = self.store.list_unbound_nodes_by_state("active").await?;
        for node in candidates.into_iter().take(CLAIM_CANDIDATES) {
            if self.store.claim_node_for_user(&node.id, user_id).await? {
                return Ok(Some(node.id));
            }
        }
        Ok(None)
    }

    async fn slow_path_create_and_claim(&self, user_id: &str) -> anyhow::Result<String> {
        let node = self.store.create_node().await?;
        self.lifecycle
            .apply(&node.id, Transition::BeginProvisioning)
            .await?;

        let provider_id = self
            .provider
            .create_node(&format!("fleet-{}", node.id), "ubuntu-22.04")
            .await?;
        let ready = self
            .provider
            .wait_ready(&provider_id, Duration::from_secs(300))
            .await?;
        self.store
            .set_node_provisioning_info(
                &node.id,
                &provider_id,
                &ready.ipv4.to_string(),
                &ready.root_password,
            )
            .await?;
        self.lifecycle.apply(&node.id, Transition::MarkActive).await?;

        let claimed = self.store.claim_node_for_user(&node.id, user_id).await?;
        anyhow::ensure!(claimed, "freshly created node was claimed by another caller");
        Ok(node.id)
    }

    async fn mint_and_deploy(&self, node_id: &str, user_id: &str, warm: bool) -> anyhow::Result<()> {
        self.lifecycle.apply(node_id, Transition::Bind).await?;

        let profile = self.store.ensure_user_profile(user_id).await?;
        let (secret, handle) = self
            .provider
            .create_key(user_id, self.default_monthly_limit_usd)
            .await?;
        // Persist before declaring success anywhere else — `create_key` is
        // not idempotent, so the handle must be durable before any retry
        // could mint a second, orphaned key.
        self.store
            .set_profile_model_router_key(
                user_id,
                &secret,
                &handle,
                self.default_monthly_limit_usd,
            )
            .await?;

        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("node disappeared mid-assignment"))?;
        let ip = node.ip.clone().ok_or_else(|| anyhow::anyhow!("node has no ip"))?;
        let password = node
            .ssh_password
            .clone()
            .ok_or_else(|| anyhow::anyhow!("node has no ssh password"))?;

        let creds = SshCredentials {
            host: ip,
            port: node.ssh_port as u16,
            user: node.ssh_user.clone(),
            password,
        };
        let session = ssh_driver::connect(&creds, node.host_key_fingerprint.as_deref()).await?;
        self.store
            .set_host_key_fingerprint(node_id, &session.host_key_fingerprint)
            .await?;

        let gateway_token = Uuid::new_v4().to_string();
        let spec = DesiredSpec {
            provider_credential: secret,
            channel_token: profile.bot_token.clone().unwrap_or_default(),
            active_model: profile.selected_model.clone().unwrap_or_else(|| "default".into()),
            fallback_models: vec![],
            auth_profile_name: "default".to_string(),
            dm_policy: DmPolicy::Pairing,
            allow_from: vec![],
            volume_permissions: "0700".to_string(),
            extension_enabled: profile.extension_enabled,
            search_adapter_enabled: true,
            watchdog_enabled: true,
            extra: serde_json::Value::Null,
        };

        for _ in 0..3 {
            self.lifecycle.apply(node_id, Transition::AdvanceStage).await?;
        }

        let outcome = if warm {
            convergence::quick_deploy(&session, &spec, &gateway_token).await
        } else {
            convergence::full_deploy(&session, &spec, &gateway_token).await
        };

        self.lifecycle.apply(node_id, Transition::AdvanceStage).await?;

        match outcome {
            Ok(()) => {
                self.store.set_gateway_token(node_id, &gateway_token).await?;
                self.lifecycle
                    .apply(node_id, Transition::MarkReady(ConvergenceOutcome::Verified))
                    .await?;
                if let Some(url) = &self.sales_chatbot_webhook_url {
                    let bot_username = profile.bot_username.clone().unwrap_or_default();
                    crate::provider::notify_user_ready(url, user_id, &bot_username).await;
                }
                Ok(())
            }
            Err(e) => {
                self.store.set_node_error(node_id, &e.to_string()).await?;
                self.lifecycle
                    .apply(node_id, Transition::MarkReady(ConvergenceOutcome::Failed))
                    .await?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_candidates_bound_is_small() {
        assert!(CLAIM_CANDIDATES <= 10);
    }
}
