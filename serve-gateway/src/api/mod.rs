//! HTTP surface: OpenAI-compatible API, probes and admin endpoints.

pub mod admin;
pub mod chat;
pub mod health;
pub mod models;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Build the `/v1` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(models::router())
}
