//! Translation between OpenAI wire types and engine calls.
//!
//! Everything here is pure: the same inputs always produce the same output,
//! which keeps the wire format testable against fixed expectations.

use serve_common::{
    new_completion_id, unix_now, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatDelta, ChatMessage, ChunkChoice, Usage,
};

use crate::engine::{GenerationParams, ModelDescriptor, TokenDelta, TokenUsage};
use crate::error::{Error, Result};

/// Roles accepted in an incoming conversation.
pub const ALLOWED_ROLES: [&str; 5] = ["system", "user", "assistant", "tool", "developer"];

/// Per-request values stamped on every response object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub request_id: String,
    pub model: String,
    pub created: i64,
    /// Role given to generated messages.
    pub role: String,
    pub prompt_tokens: u32,
}

impl ResponseMeta {
    pub fn new(model: impl Into<String>, role: impl Into<String>, prompt_tokens: u32) -> Self {
        Self {
            request_id: new_completion_id(),
            model: model.into(),
            created: unix_now(),
            role: role.into(),
            prompt_tokens,
        }
    }
}

/// Rough prompt length: whitespace-separated words plus one marker per message.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let words: usize = messages
        .iter()
        .map(|m| 1 + m.content.as_deref().map_or(0, |c| c.split_whitespace().count()))
        .sum();
    u32::try_from(words).unwrap_or(u32::MAX)
}

/// Validate `request` against `descriptor` and build engine parameters.
pub fn to_engine_params(
    request: &ChatCompletionRequest,
    descriptor: &ModelDescriptor,
) -> Result<GenerationParams> {
    if request.model != descriptor.name {
        return Err(Error::Validation(format!(
            "model '{}' does not match served model '{}'",
            request.model, descriptor.name
        )));
    }
    if request.messages.is_empty() {
        return Err(Error::Validation("messages must not be empty".to_string()));
    }
    if let Some((i, m)) = request
        .messages
        .iter()
        .enumerate()
        .find(|(_, m)| !ALLOWED_ROLES.contains(&m.role.as_str()))
    {
        return Err(Error::Validation(format!(
            "messages[{}].role '{}' is not one of {}",
            i,
            m.role,
            ALLOWED_ROLES.join(", ")
        )));
    }
    if let Some(n) = request.n {
        if n != 1 {
            return Err(Error::Validation(format!("n={} is not supported, only n=1", n)));
        }
    }
    if let Some(t) = request.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(Error::Validation(format!("temperature {} is outside [0, 2]", t)));
        }
    }
    if let Some(p) = request.top_p {
        if !(p > 0.0 && p <= 1.0) {
            return Err(Error::Validation(format!("top_p {} is outside (0, 1]", p)));
        }
    }

    let prompt_tokens = estimate_prompt_tokens(&request.messages);
    let context = descriptor.max_context_length;
    if prompt_tokens >= context {
        return Err(Error::Validation(format!(
            "prompt is {} tokens, which leaves no room in the {} token context",
            prompt_tokens, context
        )));
    }
    let remaining = context - prompt_tokens;

    let max_tokens = match request.requested_max_tokens() {
        Some(0) => return Err(Error::Validation("max_tokens must be at least 1".to_string())),
        Some(n) if n > remaining => {
            return Err(Error::Validation(format!(
                "max_tokens {} exceeds the {} tokens left after a {} token prompt (context {})",
                n, remaining, prompt_tokens, context
            )))
        }
        Some(n) => n,
        None => remaining,
    };

    Ok(GenerationParams {
        model: descriptor
            .parent
            .clone()
            .unwrap_or_else(|| descriptor.name.clone()),
        messages: request.messages.clone(),
        max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop.clone().map(|s| s.into_vec()).unwrap_or_default(),
        seed: request.seed,
        presence_penalty: request.presence_penalty,
        frequency_penalty: request.frequency_penalty,
        prompt_tokens,
    })
}

/// One SSE chunk for `delta`.
///
/// The engine marks which delta opens the message; the role name itself comes
/// from the deployment's configured response role.
pub fn to_wire_chunk(delta: &TokenDelta, meta: &ResponseMeta, index: u32) -> ChatCompletionChunk {
    let content = if delta.text.is_empty() && delta.is_terminal() {
        None
    } else {
        Some(delta.text.clone())
    };

    ChatCompletionChunk::new(
        meta.request_id.clone(),
        meta.created,
        meta.model.clone(),
        ChunkChoice {
            index,
            delta: ChatDelta {
                role: delta.role.as_ref().map(|_| meta.role.clone()),
                content,
            },
            finish_reason: delta.finish_reason.map(|r| r.as_str().to_string()),
        },
    )
}

/// Token accounting for a finished generation. Engine-reported counts win;
/// otherwise the prompt estimate and the number of non-empty deltas are used.
pub fn usage_for(meta: &ResponseMeta, deltas: &[TokenDelta]) -> Usage {
    let reported = deltas.iter().rev().find_map(|d| d.usage);
    let non_empty = deltas.iter().filter(|d| !d.text.is_empty()).count();
    usage_from(meta, reported, u32::try_from(non_empty).unwrap_or(u32::MAX))
}

/// Same as `usage_for`, from counts tallied while streaming.
pub fn usage_from(meta: &ResponseMeta, reported: Option<TokenUsage>, non_empty: u32) -> Usage {
    match reported {
        Some(u) => Usage::new(u.prompt_tokens, u.completion_tokens),
        None => Usage::new(meta.prompt_tokens, non_empty),
    }
}

/// Aggregate an ordered delta sequence into a single response.
pub fn to_wire_response(meta: &ResponseMeta, deltas: &[TokenDelta]) -> ChatCompletionResponse {
    let text: String = deltas.iter().map(|d| d.text.as_str()).collect();
    let finish_reason = deltas
        .iter()
        .rev()
        .find_map(|d| d.finish_reason)
        .map(|r| r.as_str().to_string());
    let usage = usage_for(meta, deltas);

    ChatCompletionResponse::new(
        meta.request_id.clone(),
        meta.created,
        meta.model.clone(),
        ChatMessage::new(meta.role.clone(), text),
        finish_reason,
    )
    .with_usage(usage.prompt_tokens, usage.completion_tokens)
}
