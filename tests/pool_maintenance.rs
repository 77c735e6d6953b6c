//! Exercises the reaping half of pool maintenance end to end against a
//! real `NodeStore`. Top-up is not covered here — it requires a live node
//! provider — but reaping errored/stuck nodes never calls the provider
//! when a node has no `provider_node_id` yet, so it runs against a plain
//! SQLite store.

use std::sync::Arc;

use chrono::Utc;
use fleetd::lifecycle::LifecycleController;
use fleetd::pool::{PoolConfig, PoolMaintainer};
use fleetd::provider::{ProviderAdapter, ProviderCredentials};
use fleetd::storage::NodeStore;

async fn maintainer() -> (Arc<PoolMaintainer>, Arc<NodeStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(NodeStore::new(dir.path()).await.unwrap());
    let provider = Arc::new(ProviderAdapter::new(ProviderCredentials {
        node_provider_base_url: "http://localhost:0".into(),
        node_provider_api_token: "test-token".into(),
        model_router_base_url: "http://localhost:0".into(),
        model_router_admin_key: "test-admin-key".into(),
    }));
    let lifecycle = Arc::new(LifecycleController::new(store.clone()));
    // min_available = 0 so run_once never tries to provision over the wire.
    let config = PoolConfig {
        min_available: 0,
        max_total: 10,
        node_os_tag: "ubuntu-22.04".into(),
    };
    let maintainer = Arc::new(PoolMaintainer::new(store.clone(), provider, lifecycle, config));
    (maintainer, store)
}

#[tokio::test]
async fn errored_unbound_node_is_reaped() {
    let (maintainer, store) = maintainer().await;
    let node = store.create_node().await.unwrap();
    store.set_node_error(&node.id, "boom").await.unwrap();

    maintainer.run_once().await.unwrap();

    assert!(store.get_node(&node.id).await.unwrap().is_none());
}

#[tokio::test]
async fn errored_node_bound_to_a_user_is_left_for_the_sweeper() {
    // Only unbound errored nodes are reaped by the pool maintainer — a
    // bound node's teardown is the sweeper's job, not pool maintenance's.
    let (maintainer, store) = maintainer().await;
    let node = store.create_node().await.unwrap();
    store.set_node_state(&node.id, "active").await.unwrap();
    let user = store
        .upsert_user("reaped@example.com", "google", "g-reaped")
        .await
        .unwrap();
    assert!(store.claim_node_for_user(&node.id, &user.id).await.unwrap());
    store.set_node_error(&node.id, "boom").await.unwrap();

    maintainer.run_once().await.unwrap();

    assert!(store.get_node(&node.id).await.unwrap().is_some());
}

#[tokio::test]
async fn fresh_provisioning_node_is_not_reaped_as_stuck() {
    let (maintainer, store) = maintainer().await;
    let node = store.create_node().await.unwrap();
    store.set_node_state(&node.id, "provisioning").await.unwrap();

    maintainer.run_once().await.unwrap();

    assert!(store.get_node(&node.id).await.unwrap().is_some());
}

#[tokio::test]
async fn long_stalled_provisioning_node_is_reaped_as_stuck() {
    let (maintainer, store) = maintainer().await;
    let node = store.create_node().await.unwrap();
    store.set_node_state(&node.id, "provisioning").await.unwrap();

    let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    sqlx::query("UPDATE nodes SET updated_at = ? WHERE id = ?")
        .bind(&stale)
        .bind(&node.id)
        .execute(&store.pool())
        .await
        .unwrap();

    maintainer.run_once().await.unwrap();

    assert!(store.get_node(&node.id).await.unwrap().is_none());
}
