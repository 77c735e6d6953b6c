//! `POST /server/pairing/approve` — approve a pairing code for the
//! caller's node. Invalid codes are rejected before any shell interaction.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::json;

use crate::pairing::{self, PairingError};
use crate::ssh_driver::SshCredentials;
use crate::{ssh_driver, strings, FleetContext};

use super::status::{find_node_for_user, internal_error};

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub user_id: String,
    pub code: String,
}

pub async fn approve(
    State(ctx): State<Arc<FleetContext>>,
    Json(req): Json<ApproveRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    if !pairing::is_valid_code(&req.code) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": strings::PAIRING_INVALID_CODE })),
        ));
    }

    let node = find_node_for_user(&ctx, &req.user_id)
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
    let session = ssh_driver::connect(&creds, node.host_key_fingerprint.as_deref())
        .await
        .map_err(|e| internal_error(e.into()))?;

    match pairing::approve(&session, &req.code).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(PairingError::InvalidCode) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": strings::PAIRING_INVALID_CODE })),
        )),
        Err(PairingError::Rejected) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": strings::PAIRING_REJECTED })),
        )),
        Err(e @ PairingError::Transport(_)) => Err(internal_error(e.into())),
    }
}

fn not_ready() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "node is not yet reachable" })),
    )
}
