//! `GET /server/status` — resolve the caller's node and report its
//! user-visible state.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{lifecycle::DeploymentStage, strings, FleetContext};

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub assigned: bool,
    pub ip: Option<String>,
    pub gateway_token: Option<String>,
    pub deployment_stage: String,
    pub ws_url: Option<String>,
}

pub async fn status(
    State(ctx): State<Arc<FleetContext>>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<serde_json::Value>)> {
    let node = find_node_for_user(&ctx, &q.user_id)
        .await
        .map_err(internal_error)?;

    let Some(node) = node else {
        return Ok(Json(StatusResponse {
            assigned: false,
            ip: None,
            gateway_token: None,
            deployment_stage: DeploymentStage::None.as_str().to_string(),
            ws_url: None,
        }));
    };

    let ws_url = node
        .gateway_token
        .as_ref()
        .map(|token| format!("wss://gateway.fleetd.io/ws?token={token}"));

    Ok(Json(StatusResponse {
        assigned: true,
        ip: node.ip,
        gateway_token: node.gateway_token,
        deployment_stage: node.deployment_stage,
        ws_url,
    }))
}

pub(crate) async fn find_node_for_user(
    ctx: &FleetContext,
    user_id: &str,
) -> anyhow::Result<Option<crate::storage::NodeRow>> {
    for state in ["active", "creating", "provisioning", "error", "deactivated"] {
        let nodes = ctx.store.list_nodes_by_state(state).await?;
        if let Some(node) = nodes
            .into_iter()
            .find(|n| n.binding_user.as_deref() == Some(user_id))
        {
            return Ok(Some(node));
        }
    }
    Ok(None)
}

pub(crate) fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!(err = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": strings::NODE_STATUS_RETRYABLE_ERROR })),
    )
}
