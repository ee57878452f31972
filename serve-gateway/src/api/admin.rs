//! Operator endpoints used by the autoscaler.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serve_common::ModelList;

use crate::api::models::model_cards;
use crate::config::EngineConfig;
use crate::deployment::DeploymentDescriptor;
use crate::error::{Error, Result};
use crate::state::AppState;

/// Build the `/admin` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reconfigure", post(reconfigure))
        .route("/deployment", get(deployment))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconfigureRequest {
    pub engine_args: EngineConfig,
    /// Overrides `engine_args.response_role` when set.
    #[serde(default)]
    pub response_role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReconfigureResponse {
    pub status: &'static str,
    pub epoch: u64,
    pub models: ModelList,
}

/// POST /admin/reconfigure - Replace the serving engine.
///
/// On failure the previous engine keeps serving and the call answers 500.
async fn reconfigure(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ReconfigureRequest>, JsonRejection>,
) -> Result<Json<ReconfigureResponse>> {
    let Json(request) = payload.map_err(|e| Error::Validation(e.body_text()))?;

    let mut engine_args = request.engine_args;
    if let Some(role) = request.response_role {
        engine_args.response_role = role;
    }

    let snapshot = state.registry.reconfigure(engine_args).await?;
    Ok(Json(ReconfigureResponse {
        status: "ok",
        epoch: snapshot.epoch,
        models: ModelList::new(model_cards(&snapshot)),
    }))
}

/// GET /admin/deployment - Scaling bounds and resource needs.
async fn deployment(State(state): State<Arc<AppState>>) -> Json<DeploymentDescriptor> {
    Json(state.config.deployment.clone())
}
