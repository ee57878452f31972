//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::Result;
use crate::registry::RegistryStatus;
use crate::state::AppState;

/// GET /health - The process is up. Says nothing about the engine.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /ready - 200 while an engine is serving, 503 otherwise.
///
/// A failed reconfigure leaves the previous engine serving, reported as
/// `degraded` together with the error.
pub async fn ready(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let snapshot = state.registry.active()?;

    let mut body = json!({
        "status": "ready",
        "engine": snapshot.engine.engine_type(),
        "epoch": snapshot.epoch,
        "loaded_at": snapshot.loaded_at.to_rfc3339(),
        "models": snapshot.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
    });
    if let RegistryStatus::Degraded { error } = state.registry.status() {
        body["status"] = json!("degraded");
        body["error"] = json!(error);
    }

    Ok(Json(body))
}
