//! Ollama inference engine implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::inflight::{InflightTable, Producer};
use super::{
    DeltaStream, EngineClient, EngineFactory, FinishReason, GenerationHandle, GenerationParams,
    ModelDescriptor, TokenDelta, TokenUsage,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Context window assumed when neither config nor the engine report one.
const DEFAULT_CONTEXT_LENGTH: u32 = 2048;

/// Ollama inference engine.
///
/// Communicates with an Ollama server; every generation is one streamed
/// `/api/chat` call owned by a background task.
pub struct OllamaEngine {
    http_client: Client,
    base_url: String,
    descriptor: ModelDescriptor,
    /// Only sent when the context window was configured explicitly.
    num_ctx: Option<u32>,
    inflight: Arc<InflightTable>,
    closed: AtomicBool,
}

impl OllamaEngine {
    /// Connect to the engine and resolve the model's metadata.
    ///
    /// Fails if the server is unreachable or does not know the model, so a
    /// broken configuration never produces a half-working engine.
    pub async fn connect(config: &EngineConfig, stream_buffer: usize) -> Result<Self> {
        let http_client = Client::new();
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let show = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            show_model(&http_client, &base_url, &config.model),
        )
        .await
        .map_err(|_| {
            Error::EngineUnavailable(format!(
                "Ollama at {} did not answer within {}s",
                base_url, config.connect_timeout_secs
            ))
        })??;

        let max_context_length = config
            .max_model_len
            .or_else(|| show.context_length())
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);

        let descriptor = ModelDescriptor {
            name: config.model.clone(),
            root: config
                .download_dir
                .clone()
                .unwrap_or_else(|| config.model.clone()),
            max_context_length,
            owner: config.owned_by.clone(),
            parent: None,
        };

        tracing::info!(
            model = %descriptor.name,
            max_context_length,
            "Connected to Ollama at {}",
            base_url
        );

        Ok(Self {
            http_client,
            base_url,
            descriptor,
            num_ctx: config.max_model_len,
            inflight: InflightTable::new(stream_buffer),
            closed: AtomicBool::new(false),
        })
    }

    fn chat_request(&self, params: GenerationParams) -> OllamaChatRequest {
        OllamaChatRequest {
            model: params.model,
            messages: params
                .messages
                .into_iter()
                .map(|m| OllamaMessage {
                    role: m.role,
                    content: m.content.unwrap_or_default(),
                })
                .collect(),
            stream: true,
            options: OllamaOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                num_predict: Some(params.max_tokens),
                stop: params.stop,
                seed: params.seed,
                presence_penalty: params.presence_penalty,
                frequency_penalty: params.frequency_penalty,
                num_ctx: self.num_ctx,
            },
        }
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaShowRequest<'a> {
    model: &'a str,
}

/// Response from /api/show.
#[derive(Debug, Deserialize)]
struct OllamaShowResponse {
    #[serde(default)]
    model_info: HashMap<String, serde_json::Value>,
}

impl OllamaShowResponse {
    /// `model_info` keys are prefixed by architecture, e.g. `llama.context_length`.
    fn context_length(&self) -> Option<u32> {
        self.model_info
            .iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, value)| value.as_u64())
            .and_then(|n| u32::try_from(n).ok())
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

/// One NDJSON line of a streamed /api/chat response.
#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    role: String,
    #[serde(default)]
    content: String,
}

async fn show_model(client: &Client, base_url: &str, model: &str) -> Result<OllamaShowResponse> {
    let url = format!("{}/api/show", base_url);

    let response = client
        .post(&url)
        .json(&OllamaShowRequest { model })
        .send()
        .await
        .map_err(|e| Error::EngineUnavailable(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::EngineUnavailable(format!(
            "Ollama cannot serve {}: {} {}",
            model, status, body
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::EngineUnavailable(format!("Bad /api/show response: {}", e)))
}

// ============================================================================
// Streaming
// ============================================================================

/// Splits the NDJSON body into lines and turns each into a delta.
#[derive(Debug, Default)]
struct NdjsonDecoder {
    buffer: Vec<u8>,
    seen_first: bool,
}

impl NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<TokenDelta> {
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(&line) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Decode whatever is left once the body ends without a trailing newline.
    fn finish(&mut self) -> Option<TokenDelta> {
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest)
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<TokenDelta> {
        let line = std::str::from_utf8(line).ok().map(str::trim);
        let line = match line {
            Some("") => return None,
            Some(line) => line,
            None => return Some(TokenDelta::failed("engine sent invalid UTF-8")),
        };

        let chunk: OllamaChatChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => return Some(TokenDelta::failed(format!("unparseable engine output: {}", e))),
        };

        if let Some(error) = chunk.error {
            return Some(TokenDelta::failed(error));
        }

        let (role, text) = match chunk.message {
            Some(m) => (m.role, m.content),
            None => ("assistant".to_string(), String::new()),
        };

        let mut delta = if chunk.done {
            let reason = match chunk.done_reason.as_deref() {
                Some("length") => FinishReason::Length,
                _ => FinishReason::Stop,
            };
            let delta = TokenDelta::finished(text, reason);
            match (chunk.prompt_eval_count, chunk.eval_count) {
                (Some(prompt_tokens), Some(completion_tokens)) => delta.with_usage(TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                }),
                _ => delta,
            }
        } else {
            TokenDelta::text(text)
        };

        if !self.seen_first {
            self.seen_first = true;
            delta = delta.with_role(role);
        }
        Some(delta)
    }
}

/// Drive one streamed /api/chat call, forwarding deltas until a terminal one,
/// an error, or cancellation.
async fn run_generation(client: Client, url: String, request: OllamaChatRequest, producer: Producer) {
    let cancel = producer.cancellation_token();

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = client.post(&url).json(&request).send() => response,
    };

    let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            let status = r.status();
            let body = r.text().await.unwrap_or_default();
            producer
                .send(TokenDelta::failed(format!("{}: {}", status, body)))
                .await;
            return;
        }
        Err(e) => {
            producer
                .send(TokenDelta::failed(format!("request to engine failed: {}", e)))
                .await;
            return;
        }
    };

    let mut body = response.bytes_stream();
    let mut decoder = NdjsonDecoder::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(handle = %producer.handle(), "Generation cancelled");
                return;
            }
            next = body.next() => next,
        };

        let deltas = match next {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(e)) => vec![TokenDelta::failed(format!("engine stream broke: {}", e))],
            None => match decoder.finish() {
                Some(delta) => vec![delta],
                None => vec![TokenDelta::failed("engine closed the stream before finishing")],
            },
        };

        for delta in deltas {
            let terminal = delta.is_terminal();
            if !producer.send(delta).await || terminal {
                return;
            }
        }
    }
}

// ============================================================================
// EngineClient implementation
// ============================================================================

#[async_trait]
impl EngineClient for OllamaEngine {
    fn engine_type(&self) -> &'static str {
        "ollama"
    }

    async fn submit(&self, params: GenerationParams) -> Result<GenerationHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::EngineUnavailable(format!(
                "engine for {} is shut down",
                self.descriptor.name
            )));
        }

        let producer = self.inflight.open();
        let handle = producer.handle().clone();
        let url = format!("{}/api/chat", self.base_url);
        let request = self.chat_request(params);

        tracing::debug!(%handle, model = %request.model, "Submitting generation to Ollama");
        tokio::spawn(run_generation(self.http_client.clone(), url, request, producer));

        Ok(handle)
    }

    fn stream(&self, handle: &GenerationHandle) -> Result<DeltaStream> {
        self.inflight.take_stream(handle)
    }

    fn cancel(&self, handle: &GenerationHandle) {
        self.inflight.cancel(handle);
    }

    fn describe_model(&self) -> ModelDescriptor {
        self.descriptor.clone()
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Builds `OllamaEngine`s for the serving registry.
pub struct OllamaFactory {
    stream_buffer: usize,
}

impl OllamaFactory {
    pub fn new(stream_buffer: usize) -> Self {
        Self { stream_buffer }
    }
}

#[async_trait]
impl EngineFactory for OllamaFactory {
    async fn build(&self, config: &EngineConfig) -> Result<Arc<dyn EngineClient>> {
        let engine = OllamaEngine::connect(config, self.stream_buffer).await?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serve_common::ChatMessage;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine_config(base_url: &str) -> EngineConfig {
        EngineConfig {
            base_url: base_url.to_string(),
            model: "llama3.2:3b".to_string(),
            ..EngineConfig::default()
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            model: "llama3.2:3b".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            max_tokens: 16,
            temperature: Some(0.2),
            top_p: None,
            stop: vec![],
            seed: None,
            presence_penalty: None,
            frequency_penalty: None,
            prompt_tokens: 2,
        }
    }

    async fn mount_show(server: &MockServer, context_length: u64) {
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model_info": {
                    "general.architecture": "llama",
                    "llama.context_length": context_length
                }
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_decoder_splits_lines_across_chunks() {
        let mut decoder = NdjsonDecoder::default();
        let first = decoder.push(br#"{"message":{"role":"assistant","content":"Hel"#);
        assert!(first.is_empty());

        let deltas = decoder.push(
            b"lo\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
        );
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].text, "Hello");
        assert_eq!(deltas[0].role.as_deref(), Some("assistant"));
        assert_eq!(deltas[1].text, " there");
        assert!(deltas[1].role.is_none());
    }

    #[test]
    fn test_decoder_terminal_line() {
        let mut decoder = NdjsonDecoder::default();
        decoder.push(b"{\"message\":{\"role\":\"assistant\",\"content\":\"a\"},\"done\":false}\n");
        let deltas = decoder.push(
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"length\",\"prompt_eval_count\":7,\"eval_count\":3}\n",
        );
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(
            deltas[0].usage,
            Some(TokenUsage {
                prompt_tokens: 7,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn test_decoder_error_and_garbage() {
        let mut decoder = NdjsonDecoder::default();
        let deltas = decoder.push(b"{\"error\":\"model crashed\"}\nnot json\n\n");
        assert_eq!(deltas.len(), 2);
        assert!(deltas[0].is_error());
        assert_eq!(deltas[0].error.as_deref(), Some("model crashed"));
        assert!(deltas[1].is_error());
    }

    #[test]
    fn test_decoder_finish_without_newline() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder
            .push(b"{\"message\":{\"role\":\"assistant\",\"content\":\"x\"},\"done\":true}")
            .is_empty());
        let last = decoder.finish().unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn test_connect_reads_context_length() {
        let server = MockServer::start().await;
        mount_show(&server, 131072).await;

        let engine = OllamaEngine::connect(&engine_config(&server.uri()), 8)
            .await
            .unwrap();
        let descriptor = engine.describe_model();
        assert_eq!(descriptor.name, "llama3.2:3b");
        assert_eq!(descriptor.max_context_length, 131072);
        assert_eq!(descriptor.owner, "llm-serve");
    }

    #[tokio::test]
    async fn test_configured_context_length_wins() {
        let server = MockServer::start().await;
        mount_show(&server, 131072).await;

        let config = EngineConfig {
            max_model_len: Some(4096),
            download_dir: Some("/models/llama".to_string()),
            ..engine_config(&server.uri())
        };
        let engine = OllamaEngine::connect(&config, 8).await.unwrap();
        assert_eq!(engine.describe_model().max_context_length, 4096);
        assert_eq!(engine.describe_model().root, "/models/llama");
        assert_eq!(engine.num_ctx, Some(4096));
    }

    #[tokio::test]
    async fn test_connect_fails_for_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})))
            .mount(&server)
            .await;

        let result = OllamaEngine::connect(&engine_config(&server.uri()), 8).await;
        assert!(matches!(result, Err(Error::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn test_streamed_generation() {
        let server = MockServer::start().await;
        mount_show(&server, 4096).await;

        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\" world\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":5,\"eval_count\":2}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.2:3b",
                "stream": true,
                "options": {"num_predict": 16}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let engine = OllamaEngine::connect(&engine_config(&server.uri()), 8)
            .await
            .unwrap();
        let handle = engine.submit(params()).await.unwrap();
        let deltas: Vec<TokenDelta> = engine.stream(&handle).unwrap().collect().await;

        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].role.as_deref(), Some("assistant"));
        let text: String = deltas.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(text, "Hello world");
        assert_eq!(deltas[2].finish_reason, Some(FinishReason::Stop));
        assert_eq!(deltas[2].usage.map(|u| u.completion_tokens), Some(2));

        assert!(matches!(
            engine.stream(&handle),
            Err(Error::StreamAlreadyConsumed(_))
        ));
    }

    #[tokio::test]
    async fn test_engine_http_error_becomes_error_delta() {
        let server = MockServer::start().await;
        mount_show(&server, 4096).await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
            .mount(&server)
            .await;

        let engine = OllamaEngine::connect(&engine_config(&server.uri()), 8)
            .await
            .unwrap();
        let handle = engine.submit(params()).await.unwrap();
        let deltas: Vec<TokenDelta> = engine.stream(&handle).unwrap().collect().await;

        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].is_error());
        assert!(deltas[0].error.as_deref().unwrap().contains("out of memory"));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_unavailable() {
        let server = MockServer::start().await;
        mount_show(&server, 4096).await;

        let engine = OllamaEngine::connect(&engine_config(&server.uri()), 8)
            .await
            .unwrap();
        engine.shutdown();
        assert!(matches!(
            engine.submit(params()).await,
            Err(Error::EngineUnavailable(_))
        ));
    }
}
