//! `POST /server/skills/install` and `/uninstall` — manage skill packs on
//! the caller's node over the Remote Shell Driver.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::json;

use crate::ssh_driver::{self, SshCredentials};
use crate::FleetContext;

use super::status::{find_node_for_user, internal_error};

#[derive(Debug, Deserialize)]
pub struct InstallSkillRequest {
    pub user_id: String,
    pub skill_name: String,
    pub github_url: String,
}

#[derive(Debug, Deserialize)]
pub struct UninstallSkillRequest {
    pub user_id: String,
    pub skill_name: String,
}

pub async fn install(
    State(ctx): State<Arc<FleetContext>>,
    Json(req): Json<InstallSkillRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let session = connect_for_user(&ctx, &req.user_id).await?;
    crate::convergence::install_skill(&session, &req.skill_name, &req.github_url)
        .await
        .map_err(|e| internal_error(e.into()))?;
    Ok(StatusCode::OK)
}

pub async fn uninstall(
    State(ctx): State<Arc<FleetContext>>,
    Json(req): Json<UninstallSkillRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let session = connect_for_user(&ctx, &req.user_id).await?;
    crate::convergence::uninstall_skill(&session, &req.skill_name)
        .await
        .map_err(|e| internal_error(e.into()))?;
    Ok(StatusCode::OK)
}

async fn connect_for_user(
    ctx: &FleetContext,
    user_id: &str,
) -> Result<ssh_driver::RemoteSession, (StatusCode, Json<serde_json::Value>)> {
    let node = find_node_for_user(ctx, user_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "no node bound to this user" })),
            )
        })?;
    let ip = node.ip.clone().ok_or_else(not_ready)?;
    let password = node.ssh_password.clone().ok_or_else(not_ready)?;
    let creds = SshCredentials {
        host: ip,
        port: node.ssh_port as u16,
        user: node.ssh_user.clone(),
        password,
    };
    ssh_driver::connect(&creds, node.host_key_fingerprint.as_deref())
        .await
        .map_err(|e| internal_error(e.into()))
}

fn not_ready() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "node is not yet reachable" })),
    )
}
