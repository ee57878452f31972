//! Chat completions endpoint (OpenAI-compatible).

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serve_common::ChatCompletionRequest;

use crate::error::{Error, Result};
use crate::multiplex::{self, Generation};
use crate::state::AppState;
use crate::translate::{self, ResponseMeta};

/// Build the chat router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// POST /v1/chat/completions - OpenAI-compatible chat completion.
///
/// Streams SSE when `stream` is set, otherwise answers with one aggregated
/// body once the generation is complete.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(|e| Error::Validation(e.body_text()))?;

    // Descriptor and engine come from the same snapshot, so a concurrent
    // reconfigure cannot pair one model's limits with another's engine.
    let (snapshot, descriptor) = state.registry.resolve(&request.model)?;
    let params = translate::to_engine_params(&request, &descriptor)?;

    tracing::debug!(
        model = %descriptor.name,
        engine_model = %params.model,
        stream = request.stream,
        max_tokens = params.max_tokens,
        "Chat completion request"
    );

    let meta = ResponseMeta::new(
        descriptor.name.clone(),
        snapshot.response_role.clone(),
        params.prompt_tokens,
    );
    let engine = Arc::clone(&snapshot.engine);
    let handle = engine.submit(params).await?;

    let generation = match Generation::start(Arc::clone(&engine), handle.clone(), state.request_timeout()) {
        Ok(generation) => generation,
        Err(e) => {
            engine.cancel(&handle);
            return Err(e);
        }
    };

    if request.stream {
        Ok(multiplex::sse_response(generation, meta, request.include_usage()).into_response())
    } else {
        let response = multiplex::aggregate(generation, &meta).await?;
        Ok(Json(response).into_response())
    }
}
