//! `POST /server/set-model` — push a new active model to the caller's node
//! and persist the selection on their profile.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::json;

use crate::ssh_driver::{self, SshCredentials};
use crate::FleetContext;

use super::status::{find_node_for_user, internal_error};

#[derive(Debug, Deserialize)]
pub struct SetModelRequest {
    pub user_id: String,
    pub model: String,
}

pub async fn set_model(
    State(ctx): State<Arc<FleetContext>>,
    Json(req): Json<SetModelRequest>,
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

    let ip = node.ip.clone().ok_or_else(|| not_ready())?;
    let password = node.ssh_password.clone().ok_or_else(not_ready)?;
    let creds = SshCredentials {
        host: ip,
        port: node.ssh_port as u16,
        user: node.ssh_user.clone(),
        password,
    };
    let session = ssh_driver::connect(&creds, node.host_key_fingerprint.as_deref())
        .await
        .map_err(|e| internal_error(e.into()))?;

    crate::convergence::set_model(&session, &req.model)
        .await
        .map_err(|e| internal_error(e.into()))?;

    ctx.store
        .set_profile_selected_model(&req.user_id, &req.model)
        .await
        .map_err(internal_error)?;

    Ok(StatusCode::OK)
}

fn not_ready() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "node is not yet reachable" })),
    )
}
