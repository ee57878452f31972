//! Inference engine abstraction layer.
//!
//! This module defines the `EngineClient` trait the gateway talks to. The
//! engine itself (batching, KV cache, decoding) is opaque: the gateway only
//! submits work, reads back an ordered stream of deltas and cancels.

mod inflight;
mod ollama;

pub use inflight::InflightTable;
pub use ollama::{OllamaEngine, OllamaFactory};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serve_common::ChatMessage;

use crate::config::EngineConfig;
use crate::error::Result;

/// Registry entry describing one servable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub root: String,
    pub max_context_length: u32,
    pub owner: String,
    /// Engine model id when `name` is a served alias.
    #[serde(default)]
    pub parent: Option<String>,
}

impl ModelDescriptor {
    /// Copy of this descriptor published under another name.
    pub fn aliased(&self, name: &str) -> Self {
        if name == self.name {
            return self.clone();
        }
        Self {
            name: name.to_string(),
            root: self.root.clone(),
            max_context_length: self.max_context_length,
            owner: self.owner.clone(),
            parent: Some(self.name.clone()),
        }
    }
}

/// Correlation id for one in-flight generation. Never reused.
///
/// Handles issued by an `InflightTable` also carry the table's id and their
/// position in its issue order, so the table can tell a handle it already
/// retired from one it never saw.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationHandle {
    id: uuid::Uuid,
    origin: u64,
    seq: u64,
}

impl GenerationHandle {
    /// A handle not tied to any table.
    pub fn new() -> Self {
        Self::issued(0, 0)
    }

    pub(crate) fn issued(origin: u64, seq: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            origin,
            seq,
        }
    }

    pub(crate) fn origin(&self) -> u64 {
        self.origin
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

impl Default for GenerationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.id)
    }
}

/// Everything the engine needs to run one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Engine-side model id (served aliases already resolved).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    pub seed: Option<i64>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    /// Estimated prompt length, used for usage reporting.
    pub prompt_tokens: u32,
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
        }
    }
}

/// Token counts reported by the engine on the terminal delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One incremental unit of generated output.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDelta {
    pub text: String,
    /// Set on the first delta of a generation only.
    pub role: Option<String>,
    pub finish_reason: Option<FinishReason>,
    /// Engine-side failure description, present on error deltas.
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl TokenDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role: None,
            finish_reason: None,
            error: None,
            usage: None,
        }
    }

    pub fn finished(text: impl Into<String>, reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::text(text)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(FinishReason::Error),
            error: Some(message.into()),
            ..Self::text("")
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Whether this delta ends the sequence.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.finish_reason == Some(FinishReason::Error)
    }
}

/// Lazy, ordered, non-restartable sequence of deltas for one handle.
pub type DeltaStream = BoxStream<'static, TokenDelta>;

/// Contract to the inference engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Unique identifier for this engine type (e.g., "ollama").
    fn engine_type(&self) -> &'static str;

    /// Start a generation. Fails with `EngineUnavailable` once shut down.
    async fn submit(&self, params: GenerationParams) -> Result<GenerationHandle>;

    /// Take the delta stream for `handle`. A second call for the same handle
    /// fails with `StreamAlreadyConsumed`.
    fn stream(&self, handle: &GenerationHandle) -> Result<DeltaStream>;

    /// Ask the engine to stop producing deltas. Idempotent and best-effort:
    /// deltas already in flight may still arrive.
    fn cancel(&self, handle: &GenerationHandle);

    /// The model this engine instance serves.
    fn describe_model(&self) -> ModelDescriptor;

    /// Stop accepting submissions. Running generations are left to finish.
    fn shutdown(&self) {}
}

/// Builds engine instances from configuration, at startup and on reconfigure.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn build(&self, config: &EngineConfig) -> Result<Arc<dyn EngineClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = GenerationHandle::new();
        let b = GenerationHandle::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("gen-"));
    }

    #[test]
    fn test_terminal_deltas() {
        assert!(!TokenDelta::text("hi").is_terminal());
        assert!(TokenDelta::finished("", FinishReason::Length).is_terminal());

        let failed = TokenDelta::failed("boom");
        assert!(failed.is_terminal());
        assert!(failed.is_error());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_alias_descriptor_points_at_parent() {
        let base = ModelDescriptor {
            name: "llama3.2:3b".to_string(),
            root: "/models".to_string(),
            max_context_length: 4096,
            owner: "llm-serve".to_string(),
            parent: None,
        };
        let alias = base.aliased("demo");
        assert_eq!(alias.name, "demo");
        assert_eq!(alias.parent.as_deref(), Some("llama3.2:3b"));
        assert_eq!(alias.max_context_length, 4096);
        assert_eq!(base.aliased("llama3.2:3b"), base);
    }

    #[test]
    fn test_finish_reason_wire_names() {
        assert_eq!(FinishReason::Stop.as_str(), "stop");
        assert_eq!(FinishReason::Length.as_str(), "length");
        assert_eq!(serde_json::to_string(&FinishReason::Error).unwrap(), r#""error""#);
    }
}
