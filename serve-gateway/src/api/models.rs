//! Models endpoint (OpenAI-compatible).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serve_common::{ModelCard, ModelList};

use crate::engine::ModelDescriptor;
use crate::error::Result;
use crate::registry::ServingSnapshot;
use crate::state::AppState;

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        // Model ids may contain '/'.
        .route("/models/*model", get(get_model))
}

/// A lone card for single-model deployments, otherwise a list.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ModelsResponse {
    Single(ModelCard),
    List(ModelList),
}

pub(crate) fn model_card(descriptor: &ModelDescriptor, snapshot: &ServingSnapshot) -> ModelCard {
    ModelCard::new(
        descriptor.name.clone(),
        descriptor.root.clone(),
        descriptor.max_context_length,
        descriptor.owner.clone(),
        descriptor.parent.clone(),
        snapshot.loaded_at.timestamp(),
    )
}

pub(crate) fn model_cards(snapshot: &ServingSnapshot) -> Vec<ModelCard> {
    snapshot
        .models
        .iter()
        .map(|d| model_card(d, snapshot))
        .collect()
}

/// GET /v1/models - List served models.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let mut cards = match state.registry.active() {
        Ok(snapshot) => model_cards(&snapshot),
        Err(_) => Vec::new(),
    };

    if cards.len() == 1 {
        if let Some(card) = cards.pop() {
            return Json(ModelsResponse::Single(card));
        }
    }
    Json(ModelsResponse::List(ModelList::new(cards)))
}

/// GET /v1/models/{model} - One served model.
async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<ModelCard>> {
    let (snapshot, descriptor) = state.registry.resolve(&model)?;
    Ok(Json(model_card(&descriptor, &snapshot)))
}
