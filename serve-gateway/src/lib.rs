//! llm-serve gateway: an OpenAI-compatible HTTP front for one inference
//! engine, reconfigurable at runtime.

pub mod api;
pub mod config;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod logging;
pub mod multiplex;
pub mod registry;
pub mod state;
pub mod test_util;
pub mod translate;

pub use config::{Config, EngineConfig};
pub use deployment::DeploymentDescriptor;
pub use engine::{EngineClient, EngineFactory, ModelDescriptor, OllamaFactory};
pub use error::{Error, Result};
pub use registry::{RegistryStatus, ServingRegistry, ServingSnapshot};
pub use state::AppState;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Full HTTP surface wired to `state`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/v1", api::router())
        .nest("/admin", api::admin::router())
        .route("/health", get(api::health::health))
        .route("/ready", get(api::health::ready))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
