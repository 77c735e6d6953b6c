//! Wraps the two external HTTP collaborators the orchestrator depends on:
//! the node provider (VM lifecycle) and the model-router (per-user API
//! keys). Each call carries a hard per-request deadline via a
//! `reqwest::Client` built with a fixed timeout, the same shape as
//! `license::call_verify`.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::retry::{retry_with_backoff, RetryConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const IPV4_ATTACH_RETRIES: u32 = 5;
const IPV4_ATTACH_DELAY: Duration = Duration::from_secs(20);
const WAIT_READY_POLL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request not yet ready")]
    NotReady,
    #[error("deadline exceeded waiting for node to become ready")]
    Timeout,
    #[error("node never reported an ipv4 address")]
    NoIpv4,
    #[error("unauthorized")]
    Unauthorized,
    #[error("http error: {0}")]
    Http(String),
    #[error("response decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(401) || e.status().map(|s| s.as_u16()) == Some(403) {
            ProviderError::Unauthorized
        } else {
            ProviderError::Http(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub root_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadyNode {
    pub ipv4: Ipv4Addr,
    pub root_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUsage {
    pub usage_usd: f64,
    pub limit_usd: f64,
    pub remaining_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub limit: Option<f64>,
    pub disabled: Option<bool>,
    pub monthly_reset: Option<bool>,
}

/// Credential bundle needed to reach both collaborators.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub node_provider_base_url: String,
    pub node_provider_api_token: String,
    pub model_router_base_url: String,
    pub model_router_admin_key: String,
}

pub struct ProviderAdapter {
    client: reqwest::Client,
    creds: ProviderCredentials,
}

impl ProviderAdapter {
    pub fn new(creds: ProviderCredentials) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builder should not fail with these options");
        Self { client, creds }
    }

    // ─── Node provider ────────────────────────────────────────────────

    pub async fn create_node(&self, name: &str, os_tag: &str) -> Result<String, ProviderError> {
        #[derive(Serialize)]
        struct Req<'a> {
            name: &'a str,
            os: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            id: String,
        }
        let url = format!("{}/v1/nodes", self.creds.node_provider_base_url);
        let resp: Resp = self
            .client
            .post(&url)
            .bearer_auth(&self.creds.node_provider_api_token)
            .json(&Req { name, os: os_tag })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(resp.id)
    }

    pub async fn get_node(&self, provider_id: &str) -> Result<NodeStatus, ProviderError> {
        #[derive(Deserialize)]
        struct Resp {
            state: String,
            ipv4: Option<String>,
            ipv6: Option<String>,
            root_password: Option<String>,
        }
        let url = format!(
            "{}/v1/nodes/{}",
            self.creds.node_provider_base_url, provider_id
        );
        let resp: Resp = self
            .client
            .get(&url)
            .bearer_auth(&self.creds.node_provider_api_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(NodeStatus {
            state: resp.state,
            ipv4: resp.ipv4.and_then(|s| s.parse().ok()),
            ipv6: resp.ipv6.and_then(|s| s.parse().ok()),
            root_password: resp.root_password,
        })
    }

    /// Provider IPv4 attach is asynchronous; retries up to 5x with a 20s
    /// gap rather than failing on the first "not yet" response.
    pub async fn attach_ipv4(&self, provider_id: &str) -> Result<Ipv4Addr, ProviderError> {
        let cfg = RetryConfig {
            max_attempts: IPV4_ATTACH_RETRIES,
            initial_delay: IPV4_ATTACH_DELAY,
            max_delay: IPV4_ATTACH_DELAY,
            multiplier: 1.0,
        };
        retry_with_backoff(&cfg, || async {
            let status = self.get_node(provider_id).await?;
            status.ipv4.ok_or(ProviderError::NotReady)
        })
        .await
    }

    pub async fn delete_node(&self, provider_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/v1/nodes/{}",
            self.creds.node_provider_base_url, provider_id
        );
        self.client
            .delete(&url)
            .bearer_auth(&self.creds.node_provider_api_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Polls `get_node` every 15s until an ipv4 + root password are
    /// present or `deadline` elapses.
    pub async fn wait_ready(
        &self,
        provider_id: &str,
        deadline: Duration,
    ) -> Result<ReadyNode, ProviderError> {
        let fut = async {
            loop {
                let status = self.get_node(provider_id).await?;
                if let (Some(ipv4), Some(pw)) = (status.ipv4, status.root_password.clone()) {
                    return Ok(ReadyNode {
                        ipv4,
                        root_password: pw,
                    });
                }
                if status.ipv4.is_none() {
                    match self.attach_ipv4(provider_id).await {
                        Ok(ipv4) => {
                            if let Some(pw) = status.root_password {
                                return Ok(ReadyNode {
                                    ipv4,
                                    root_password: pw,
                                });
                            }
                        }
                        Err(ProviderError::NotReady) => {}
                        Err(e) => return Err(e),
                    }
                }
                tokio::time::sleep(WAIT_READY_POLL).await;
            }
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result.map_err(|e| match e {
                ProviderError::NotReady => ProviderError::NoIpv4,
                other => other,
            }),
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    // ─── Model router ────────────────────────────────────────────────

    /// **Not idempotent.** The caller must durably persist the returned
    /// handle before reporting success to anyone else — a retry of this
    /// call mints a second, orphaned key.
    pub async fn create_key(
        &self,
        label: &str,
        monthly_limit_usd: f64,
    ) -> Result<(String, String), ProviderError> {
        #[derive(Serialize)]
        struct Req<'a> {
            label: &'a str,
            monthly_limit_usd: f64,
        }
        #[derive(Deserialize)]
        struct Resp {
            secret: String,
            handle: String,
        }
        let url = format!("{}/v1/keys", self.creds.model_router_base_url);
        let resp: Resp = self
            .client
            .post(&url)
            .bearer_auth(&self.creds.model_router_admin_key)
            .json(&Req {
                label,
                monthly_limit_usd,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok((resp.secret, resp.handle))
    }

    pub async fn get_key(&self, handle: &str) -> Result<KeyUsage, ProviderError> {
        let url = format!("{}/v1/keys/{}", self.creds.model_router_base_url, handle);
        let usage: KeyUsage = self
            .client
            .get(&url)
            .bearer_auth(&self.creds.model_router_admin_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(usage)
    }

    pub async fn patch_key(&self, handle: &str, patch: KeyPatch) -> Result<(), ProviderError> {
        #[derive(Serialize)]
        struct Req {
            #[serde(skip_serializing_if = "Option::is_none")]
            limit: Option<f64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            disabled: Option<bool>,
            #[serde(skip_serializing_if = "Option::is_none")]
            monthly_reset: Option<bool>,
        }
        let url = format!("{}/v1/keys/{}", self.creds.model_router_base_url, handle);
        self.client
            .patch(&url)
            .bearer_auth(&self.creds.model_router_admin_key)
            .json(&Req {
                limit: patch.limit,
                disabled: patch.disabled,
                monthly_reset: patch.monthly_reset,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn delete_key(&self, handle: &str) -> Result<(), ProviderError> {
        let url = format!("{}/v1/keys/{}", self.creds.model_router_base_url, handle);
        self.client
            .delete(&url)
            .bearer_auth(&self.creds.model_router_admin_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn check_key_usage(&self, secret: &str) -> Result<KeyUsage, ProviderError> {
        let url = format!("{}/v1/keys/usage", self.creds.model_router_base_url);
        let usage: KeyUsage = self
            .client
            .get(&url)
            .bearer_auth(secret)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(usage)
    }
}

/// Fire-and-forget admin notification. Failures are logged, never
/// propagated — mirrors `license::verify_and_cache`'s "degrade, don't
/// fail the caller" discipline.
pub async fn notify_admin(webhook_url: &str, message: &str) {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default();
    if let Err(e) = client
        .post(webhook_url)
        .json(&serde_json::json!({ "text": message }))
        .send()
        .await
    {
        warn!(err = %e, "admin notification failed");
    }
}

/// Fire-and-forget "your bot is ready" message to the user's sales-chatbot
/// chat, once their node has finished converging. Same shape as
/// `notify_admin` — a different recipient, the same degrade-don't-fail
/// discipline.
pub async fn notify_user_ready(sales_chatbot_webhook_url: &str, user_id: &str, bot_username: &str) {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default();
    let text = format!("Your bot is ready! Say hello to @{bot_username}.");
    if let Err(e) = client
        .post(sales_chatbot_webhook_url)
        .json(&serde_json::json!({ "user_id": user_id, "text": text }))
        .send()
        .await
    {
        warn!(err = %e, "sales-chatbot ready notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_patch_default_is_all_none() {
        let patch = KeyPatch::default();
        assert!(patch.limit.is_none());
        assert!(patch.disabled.is_none());
        assert!(patch.monthly_reset.is_none());
    }
}
