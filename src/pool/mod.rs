//! Warm-pool maintenance: keeps `available + in_progress >= MIN_AVAILABLE`,
//! enforces the hard total cap, reaps errored/stuck nodes. Grounded on
//! `tasks::jobs`'s periodic `tokio::time::interval` background-loop shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::HotConfig;
use crate::lifecycle::{LifecycleController, Transition};
use crate::provider::ProviderAdapter;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::ssh_driver::{self, SshCredentials};
use crate::storage::NodeStore;

const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STALE_PROVISIONING_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_available: i64,
    pub max_total: i64,
    pub node_os_tag: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_available: 5,
            max_total: 10,
            node_os_tag: "ubuntu-22.04".to_string(),
        }
    }
}

pub struct PoolMaintainer {
    store: Arc<NodeStore>,
    provider: Arc<ProviderAdapter>,
    lifecycle: Arc<LifecycleController>,
    config: PoolConfig,
    /// When set, `min_available`/`max_total` are read fresh from this
    /// hot-reloadable handle on every tick instead of the static snapshot
    /// in `config` — wired to `config::ConfigWatcher` so an operator can
    /// tune pool sizing without a restart.
    hot: Option<Arc<RwLock<HotConfig>>>,
}

impl PoolMaintainer {
    pub fn new(
        store: Arc<NodeStore>,
        provider: Arc<ProviderAdapter>,
        lifecycle: Arc<LifecycleController>,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            provider,
            lifecycle,
            config,
            hot: None,
        }
    }

    /// Attach a hot-reloadable config handle. Subsequent ticks read
    /// `min_available`/`max_total` from it instead of the static snapshot
    /// passed to `new`.
    pub fn with_hot_config(mut self, hot: Arc<RwLock<HotConfig>>) -> Self {
        self.hot = Some(hot);
        self
    }

    async fn current_limits(&self) -> (i64, i64) {
        match &self.hot {
            Some(hot) => {
                let guard = hot.read().await;
                (guard.min_available, guard.max_total)
            }
            None => (self.config.min_available, self.config.max_total),
        }
    }

    /// Spawn the detached 5-minute maintenance loop.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(err = %e, "pool maintenance pass failed");
                }
            }
        });
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        self.reap_errored().await?;
        self.reap_stuck().await?;
        self.top_up().await?;
        Ok(())
    }

    async fn reap_errored(&self) -> anyhow::Result<()> {
        let nodes = self.store.list_unbound_nodes_by_state("error").await?;
        for node in nodes {
            info!(node_id = %node.id, "reaping errored unbound node");
            if let Some(provider_id) = &node.provider_node_id {
                let _ = self.provider.delete_node(provider_id).await;
            }
            self.store.delete_node(&node.id).await?;
        }
        Ok(())
    }

    async fn reap_stuck(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for state in ["creating", "provisioning"] {
            let nodes = self.store.list_unbound_nodes_by_state(state).await?;
            for node in nodes {
                let updated_at = chrono::DateTime::parse_from_rfc3339(&node.updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(now);
                let stalled_minutes = (now - updated_at).num_minutes();
                if stalled_minutes > STALE_PROVISIONING_MINUTES {
                    warn!(node_id = %node.id, stalled_minutes, "reaping stuck node");
                    if let Some(provider_id) = &node.provider_node_id {
                        let _ = self.provider.delete_node(provider_id).await;
                    }
                    self.store.delete_node(&node.id).await?;
                }
            }
        }
        Ok(())
    }

    async fn top_up(&self) -> anyhow::Result<()> {
        let available = self
            .store
            .count_nodes_where("state = 'active' AND binding_user IS NULL")
            .await?;
        let in_progress = self
            .store
            .count_nodes_where(
                "state IN ('creating', 'provisioning') AND binding_user IS NULL",
            )
            .await?;
        let total = self.store.count_nodes_where("state != 'error'").await?;

        let (min_available, max_total) = self.current_limits().await;
        let have = available + in_progress;
        let need = (min_available - have).max(0);
        let room = (max_total - total).max(0);
        let to_create = need.min(room);

        if to_create == 0 {
            return Ok(());
        }
        info!(to_create, available, in_progress, total, "topping up pool");

        for _ in 0..to_create {
            let store = self.store.clone();
            let provider = self.provider.clone();
            let lifecycle = self.lifecycle.clone();
            let os_tag = self.config.node_os_tag.clone();
            // Every provisioning attempt runs detached.
            tokio::spawn(async move {
                if let Err(e) = provision_one(store, provider, lifecycle, os_tag).await {
                    warn!(err = %e, "node provisioning failed");
                }
            });
        }
        Ok(())
    }
}

async fn provision_one(
    store: Arc<NodeStore>,
    provider: Arc<ProviderAdapter>,
    lifecycle: Arc<LifecycleController>,
    os_tag: String,
) -> anyhow::Result<()> {
    let node = store.create_node().await?;
    lifecycle.apply(&node.id, Transition::BeginProvisioning).await?;

    let cfg = RetryConfig {
        max_attempts: 3,
        ..RetryConfig::default()
    };
    // Creation is not idempotent — every retry is a fresh create_node call.
    let node_id = node.id.clone();
    let provider_id = retry_with_backoff(&cfg, || {
        let provider = provider.clone();
        let name = format!("fleet-{node_id}");
        let os_tag = os_tag.clone();
        async move { provider.create_node(&name, &os_tag).await }
    })
    .await?;

    let ready = provider.wait_ready(&provider_id, Duration::from_secs(300)).await?;
    store
        .set_node_provisioning_info(
            &node.id,
            &provider_id,
            &ready.ipv4.to_string(),
            &ready.root_password,
        )
        .await?;

    let creds = SshCredentials {
        host: ready.ipv4.to_string(),
        port: 22,
        user: "root".to_string(),
        password: ready.root_password,
    };
    let session = ssh_driver::connect(&creds, None).await?;
    store
        .set_host_key_fingerprint(&node.id, &session.host_key_fingerprint)
        .await?;

    crate::convergence::warm_deploy(&session).await?;
    store.mark_runtime_running(&node.id, true).await?;

    lifecycle.apply(&node.id, Transition::MarkActive).await?;
    info!(node_id = %node.id, "node warmed and added to pool");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_limits_falls_back_to_static_config_without_hot_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::new(dir.path()).await.unwrap());
        let provider = Arc::new(ProviderAdapter::new(crate::provider::ProviderCredentials {
            node_provider_base_url: "http://localhost:0".into(),
            node_provider_api_token: "t".into(),
            model_router_base_url: "http://localhost:0".into(),
            model_router_admin_key: "t".into(),
        }));
        let lifecycle = Arc::new(LifecycleController::new(store.clone()));
        let maintainer = PoolMaintainer::new(
            store,
            provider,
            lifecycle,
            PoolConfig {
                min_available: 7,
                max_total: 13,
                node_os_tag: "ubuntu-22.04".into(),
            },
        );
        assert_eq!(maintainer.current_limits().await, (7, 13));
    }

    #[tokio::test]
    async fn current_limits_prefers_hot_handle_when_attached() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::new(dir.path()).await.unwrap());
        let provider = Arc::new(ProviderAdapter::new(crate::provider::ProviderCredentials {
            node_provider_base_url: "http://localhost:0".into(),
            node_provider_api_token: "t".into(),
            model_router_base_url: "http://localhost:0".into(),
            model_router_admin_key: "t".into(),
        }));
        let lifecycle = Arc::new(LifecycleController::new(store.clone()));
        let hot = Arc::new(RwLock::new(HotConfig {
            log_level: "info".into(),
            min_available: 2,
            max_total: 4,
        }));
        let maintainer = PoolMaintainer::new(store, provider, lifecycle, PoolConfig::default())
            .with_hot_config(hot.clone());
        assert_eq!(maintainer.current_limits().await, (2, 4));

        hot.write().await.min_available = 9;
        assert_eq!(maintainer.current_limits().await, (9, 4));
    }

    #[test]
    fn default_pool_config_matches_spec_defaults() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.min_available, 5);
        assert_eq!(cfg.max_total, 10);
    }
}
