use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::FleetContext;

pub async fn health(State(ctx): State<Arc<FleetContext>>) -> Json<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
