//! `POST /server/redeploy` — schedule a detached `full_deploy` for the
//! caller's node. `409` if a deploy is already in flight for that node,
//! tracked via the shared per-node `NodeLocks`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::convergence::{DesiredSpec, DmPolicy};
use crate::ssh_driver::{self, SshCredentials};
use crate::strings;
use crate::FleetContext;

use super::status::{find_node_for_user, internal_error};

#[derive(Debug, Deserialize)]
pub struct RedeployRequest {
    pub user_id: String,
}

pub async fn redeploy(
    State(ctx): State<Arc<FleetContext>>,
    Json(req): Json<RedeployRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let node = find_node_for_user(&ctx, &req.user_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "no node bound to this user" })),
            )
        })?;

    let Some(guard) = ctx.node_locks.try_begin(&node.id) else {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": strings::REDEPLOY_ALREADY_IN_FLIGHT })),
        ));
    };

    let ctx = ctx.clone();
    let node_id = node.id.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = run_redeploy(&ctx, &node_id, &req.user_id).await {
            error!(node_id = %node_id, err = %e, "redeploy failed");
            let _ = ctx.store.set_node_error(&node_id, &e.to_string()).await;
        }
    });

    Ok(StatusCode::ACCEPTED)
}

/// Rebuilds the node's `DesiredSpec` from its stored profile and re-runs a
/// full convergence pass over SSH. Shared by the manual redeploy route and
/// by startup recovery of nodes stranded mid-deploy.
pub async fn run_redeploy(ctx: &FleetContext, node_id: &str, user_id: &str) -> anyhow::Result<()> {
    let node = ctx
        .store
        .get_node(node_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("node disappeared mid-redeploy"))?;
    let profile = ctx
        .store
        .get_user_profile(user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no profile for user"))?;

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
    ctx.store
        .set_host_key_fingerprint(node_id, &session.host_key_fingerprint)
        .await?;

    let gateway_token = node
        .gateway_token
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let spec = DesiredSpec {
        provider_credential: profile.model_router_key.clone().unwrap_or_default(),
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

    crate::convergence::full_deploy(&session, &spec, &gateway_token).await?;
    ctx.store.set_gateway_token(node_id, &gateway_token).await?;
    warn!(node_id, "redeploy completed");
    Ok(())
}
