//! `GET /internal/ws-auth` — the gateway's auth subrequest. Authenticated
//! by possession of a valid per-node gateway token, not the operator
//! bearer token: the gateway forwards whatever bearer the end user's
//! websocket client presented, and this resolves it to an upstream.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::FleetContext;

const TOKEN_HEADER: &str = "x-gateway-token";
const UPSTREAM_HEADER: &str = "x-ws-upstream";

pub async fn ws_auth(
    State(ctx): State<Arc<FleetContext>>,
    headers: HeaderMap,
) -> Response {
    let token = match headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        Some(t) if !t.is_empty() => t,
        _ => return StatusCode::FORBIDDEN.into_response(),
    };

    for state in ["active"] {
        let nodes = match ctx.store.list_nodes_by_state(state).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(err = %e, "ws-auth: node lookup failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        if let Some(node) = nodes
            .into_iter()
            .find(|n| n.gateway_token.as_deref() == Some(token))
        {
            let Some(ip) = node.ip else {
                return StatusCode::FORBIDDEN.into_response();
            };
            let mut resp = StatusCode::OK.into_response();
            if let Ok(value) = format!("{ip}:8443").parse() {
                resp.headers_mut().insert(UPSTREAM_HEADER, value);
                return resp;
            }
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    StatusCode::FORBIDDEN.into_response()
}
