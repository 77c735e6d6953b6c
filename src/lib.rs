pub mod assignment;
pub mod config;
pub mod convergence;
pub mod errors;
pub mod identity_verify;
pub mod lifecycle;
pub mod node_locks;
pub mod pairing;
pub mod pool;
pub mod provider;
pub mod rest;
pub mod retry;
pub mod scheduler;
pub mod ssh_driver;
pub mod storage;
pub mod strings;
pub mod sweeper;

use std::sync::Arc;

use assignment::AssignmentCoordinator;
use config::FleetConfig;
use identity_verify::IdentityVerifier;
use lifecycle::LifecycleController;
use node_locks::NodeLocks;
use provider::ProviderAdapter;
use storage::NodeStore;

/// Shared application state passed to every REST handler and background
/// worker. One instance lives for the process lifetime behind `Arc`.
#[derive(Clone)]
pub struct FleetContext {
    pub config: Arc<FleetConfig>,
    pub store: Arc<NodeStore>,
    pub provider: Arc<ProviderAdapter>,
    pub lifecycle: Arc<LifecycleController>,
    pub identity: Arc<IdentityVerifier>,
    pub assignment: Arc<AssignmentCoordinator>,
    /// Per-node redeploy/converge mutual exclusion, shared across REST
    /// handlers and the Pool Maintainer.
    pub node_locks: Arc<NodeLocks>,
    pub started_at: std::time::Instant,
    /// Bearer token REST clients must present on every mutating route
    /// except the payment webhook and the internal ws-auth subhandler.
    pub rest_bearer_token: String,
    /// Shared secret the payment-gateway webhook must present instead of
    /// a bearer token (`POST /payments/webhook/...` is otherwise
    /// unauthenticated).
    pub payment_gateway_webhook_secret: String,
    /// Admin chat webhook, reused by the Pool Maintainer, Assignment
    /// Coordinator, and Sweeper for failure notifications.
    pub admin_webhook_url: Option<String>,
}

impl FleetContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<FleetConfig>,
        store: Arc<NodeStore>,
        provider: Arc<ProviderAdapter>,
        identity: Arc<IdentityVerifier>,
        rest_bearer_token: String,
        payment_gateway_webhook_secret: String,
        admin_webhook_url: Option<String>,
        sales_chatbot_webhook_url: Option<String>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleController::new(store.clone()));
        let node_locks = Arc::new(NodeLocks::new(config.max_parallel_node_ops));
        let assignment = Arc::new(AssignmentCoordinator::new(
            store.clone(),
            provider.clone(),
            lifecycle.clone(),
            config.default_monthly_limit_usd,
            admin_webhook_url.clone(),
            sales_chatbot_webhook_url,
        ));
        Self {
            config,
            store,
            provider,
            lifecycle,
            identity,
            assignment,
            node_locks,
            started_at: std::time::Instant::now(),
            rest_bearer_token,
            payment_gateway_webhook_secret,
            admin_webhook_url,
        }
    }
}
