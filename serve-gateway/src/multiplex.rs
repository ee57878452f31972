//! Turns an engine delta stream into an HTTP response body.
//!
//! Implements the OpenAI-compatible streaming protocol:
//! - Each delta is sent as `data: {json}\n\n`
//! - Final message is `data: [DONE]\n\n`
//! - An engine failure mid-stream becomes one `data: {"error": ...}` event
//! - Stream stops immediately when the client disconnects (the dropped
//!   `Generation` cancels the engine request)
//!
//! Non-streaming requests are buffered until the terminal delta and fail as a
//! whole if the engine reports an error, so no partial body is ever sent.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use serve_common::{ChatCompletionChunk, ChatCompletionResponse, StreamError};
use tokio::time::Instant;

use crate::engine::{DeltaStream, EngineClient, GenerationHandle, TokenDelta, TokenUsage};
use crate::error::{Error, Result};
use crate::translate::{self, ResponseMeta};

/// Lifecycle of one request, from submission to a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    /// State after receiving `delta`. Terminal states absorb.
    pub fn on_delta(self, delta: &TokenDelta) -> Self {
        if self.is_terminal() {
            return self;
        }
        if delta.is_error() {
            RequestState::Failed
        } else if delta.is_terminal() {
            RequestState::Completed
        } else {
            RequestState::Streaming
        }
    }

    pub fn fail(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            RequestState::Failed
        }
    }

    pub fn cancel(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            RequestState::Cancelled
        }
    }
}

/// One in-flight generation bound to the response that consumes it.
///
/// Dropping a `Generation` before it reached a terminal state cancels the
/// engine request. That is how client disconnects propagate: axum drops the
/// response body, which drops the stream owning this value.
pub struct Generation {
    engine: Arc<dyn EngineClient>,
    handle: GenerationHandle,
    deltas: DeltaStream,
    state: RequestState,
    cancel_sent: bool,
    deadline: Instant,
    timeout: Duration,
}

impl Generation {
    /// Take the delta stream for `handle` and start the timeout clock.
    pub fn start(
        engine: Arc<dyn EngineClient>,
        handle: GenerationHandle,
        timeout: Duration,
    ) -> Result<Self> {
        let deltas = engine.stream(&handle)?;
        Ok(Self {
            engine,
            handle,
            deltas,
            state: RequestState::Pending,
            cancel_sent: false,
            deadline: Instant::now() + timeout,
            timeout,
        })
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn handle(&self) -> &GenerationHandle {
        &self.handle
    }

    /// Wait for the next delta. `Ok(None)` means the engine closed the stream,
    /// which before a terminal delta is a failure.
    pub async fn next_delta(&mut self) -> Result<Option<TokenDelta>> {
        if self.state.is_terminal() {
            return Ok(None);
        }

        match tokio::time::timeout_at(self.deadline, self.deltas.next()).await {
            Err(_) => {
                tracing::warn!(handle = %self.handle, timeout_secs = self.timeout.as_secs(), "Generation timed out");
                self.cancel();
                Err(Error::Timeout(self.timeout.as_secs()))
            }
            Ok(None) => {
                self.state = self.state.fail();
                Ok(None)
            }
            Ok(Some(delta)) => {
                let next = self.state.on_delta(&delta);
                if next != self.state {
                    tracing::debug!(handle = %self.handle, from = ?self.state, to = ?next, "Request state changed");
                }
                self.state = next;
                Ok(Some(delta))
            }
        }
    }

    /// Cancel the engine request, at most once.
    fn cancel(&mut self) {
        if !self.cancel_sent {
            self.cancel_sent = true;
            self.engine.cancel(&self.handle);
        }
        self.state = self.state.cancel();
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::info!(handle = %self.handle, state = ?self.state, "Response dropped, cancelling generation");
            self.cancel();
        }
    }
}

/// Buffer every delta and return one aggregated response.
pub async fn aggregate(mut generation: Generation, meta: &ResponseMeta) -> Result<ChatCompletionResponse> {
    let mut deltas = Vec::new();
    loop {
        match generation.next_delta().await? {
            Some(delta) if delta.is_error() => {
                return Err(Error::UpstreamEngine(
                    delta.error.unwrap_or_else(|| "unspecified engine error".to_string()),
                ));
            }
            Some(delta) => {
                let terminal = delta.is_terminal();
                deltas.push(delta);
                if terminal {
                    break;
                }
            }
            None => {
                return Err(Error::UpstreamEngine(
                    "engine stream ended without a finish reason".to_string(),
                ));
            }
        }
    }

    Ok(translate::to_wire_response(meta, &deltas))
}

fn json_event<T: Serialize>(value: &T) -> Event {
    Event::default().json_data(value).unwrap_or_else(|e| {
        tracing::error!("Failed to encode SSE event: {}", e);
        Event::default().data(r#"{"error":{"object":"error","message":"Internal server error","type":"InternalError","param":null,"code":500}}"#)
    })
}

fn error_event(error: &Error) -> Event {
    tracing::error!(error_type = error.error_type(), "Streamed generation failed: {}", error);
    json_event(&StreamError {
        error: error.to_body(),
    })
}

/// SSE events for one generation: a chunk per delta, then `[DONE]`.
///
/// The stream is pulled by the HTTP body, so a slow client suspends the
/// reader here and, through the bounded engine channel, the engine itself.
pub fn sse_events(
    mut generation: Generation,
    meta: ResponseMeta,
    include_usage: bool,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        let mut non_empty: u32 = 0;
        let mut reported: Option<TokenUsage> = None;

        loop {
            match generation.next_delta().await {
                Ok(Some(delta)) if delta.is_error() => {
                    let message = delta.error.unwrap_or_else(|| "unspecified engine error".to_string());
                    yield Ok(error_event(&Error::UpstreamEngine(message)));
                    break;
                }
                Ok(Some(delta)) => {
                    if !delta.text.is_empty() {
                        non_empty += 1;
                    }
                    if delta.usage.is_some() {
                        reported = delta.usage;
                    }
                    yield Ok(json_event(&translate::to_wire_chunk(&delta, &meta, 0)));

                    if delta.is_terminal() {
                        if include_usage {
                            let usage = translate::usage_from(&meta, reported, non_empty);
                            yield Ok(json_event(&ChatCompletionChunk::usage_only(
                                meta.request_id.clone(),
                                meta.created,
                                meta.model.clone(),
                                usage,
                            )));
                        }
                        break;
                    }
                }
                Ok(None) => {
                    yield Ok(error_event(&Error::UpstreamEngine(
                        "engine stream ended without a finish reason".to_string(),
                    )));
                    break;
                }
                Err(e) => {
                    yield Ok(error_event(&e));
                    break;
                }
            }
        }

        tracing::debug!(handle = %generation.handle(), state = ?generation.state(), "Stream finished");
        yield Ok(Event::default().data("[DONE]"));
    }
}

/// Wrap `sse_events` as an axum SSE response.
pub fn sse_response(
    generation: Generation,
    meta: ResponseMeta,
    include_usage: bool,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(sse_events(generation, meta, include_usage)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FinishReason, GenerationParams, ModelDescriptor};
    use crate::test_util::{ScriptedEngine, SCRIPTED_STREAM_BUFFER};
    use serve_common::ChatMessage;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            name: "demo".to_string(),
            root: "demo".to_string(),
            max_context_length: 4096,
            owner: "llm-serve".to_string(),
            parent: None,
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            model: "demo".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            max_tokens: 32,
            temperature: None,
            top_p: None,
            stop: vec![],
            seed: None,
            presence_penalty: None,
            frequency_penalty: None,
            prompt_tokens: 2,
        }
    }

    fn meta() -> ResponseMeta {
        ResponseMeta::new("demo", "assistant", 2)
    }

    async fn start(engine: &Arc<ScriptedEngine>, timeout: Duration) -> Generation {
        let dyn_engine: Arc<dyn EngineClient> = engine.clone();
        let handle = dyn_engine.submit(params()).await.unwrap();
        Generation::start(dyn_engine, handle, timeout).unwrap()
    }

    #[test]
    fn test_state_machine() {
        let s = RequestState::Pending;
        let s = s.on_delta(&TokenDelta::text("a"));
        assert_eq!(s, RequestState::Streaming);
        let s = s.on_delta(&TokenDelta::finished("", FinishReason::Stop));
        assert_eq!(s, RequestState::Completed);
        assert_eq!(s.cancel(), RequestState::Completed);
        assert_eq!(s.fail(), RequestState::Completed);

        assert_eq!(
            RequestState::Streaming.on_delta(&TokenDelta::failed("x")),
            RequestState::Failed
        );
        assert_eq!(RequestState::Pending.cancel(), RequestState::Cancelled);
        assert_eq!(
            RequestState::Cancelled.on_delta(&TokenDelta::text("late")),
            RequestState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_aggregate_concatenates_deltas() {
        let engine = Arc::new(ScriptedEngine::replying(descriptor(), &["The", " quick", " fox"]));
        let generation = start(&engine, Duration::from_secs(5)).await;

        let response = aggregate(generation, &meta()).await.unwrap();
        assert_eq!(response.text(), "The quick fox");
        assert_eq!(response.choices[0].message.role, "assistant");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(engine.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_fails_on_error_delta() {
        let engine = Arc::new(ScriptedEngine::new(descriptor()).with_script(vec![
            TokenDelta::text("partial").with_role("assistant"),
            TokenDelta::failed("device lost"),
        ]));
        let generation = start(&engine, Duration::from_secs(5)).await;

        let err = aggregate(generation, &meta()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamEngine(ref m) if m == "device lost"));
        assert_eq!(engine.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_fails_when_stream_ends_early() {
        let engine = Arc::new(
            ScriptedEngine::new(descriptor())
                .with_script(vec![TokenDelta::text("no end").with_role("assistant")]),
        );
        let generation = start(&engine, Duration::from_secs(5)).await;

        assert!(matches!(
            aggregate(generation, &meta()).await,
            Err(Error::UpstreamEngine(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_cancels_once() {
        let engine = Arc::new(
            ScriptedEngine::new(descriptor())
                .with_script(vec![TokenDelta::text("slow").with_role("assistant")])
                .hold_open(),
        );
        let generation = start(&engine, Duration::from_millis(50)).await;

        let err = aggregate(generation, &meta()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(engine.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_sse_timeout_emits_error_then_done() {
        let engine = Arc::new(
            ScriptedEngine::replying(descriptor(), &["late"]).with_delay(Duration::from_millis(500)),
        );
        let generation = start(&engine, Duration::from_millis(50)).await;

        let events: Vec<_> = sse_events(generation, meta(), false).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(engine.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_unpolled_stream_holds_engine_at_buffer_size() {
        let words = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
        let engine = Arc::new(ScriptedEngine::replying(descriptor(), &words));
        let generation = start(&engine, Duration::from_secs(5)).await;

        let events = sse_events(generation, meta(), false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.produced_count(), SCRIPTED_STREAM_BUFFER);

        let events: Vec<_> = events.collect().await;
        assert_eq!(events.len(), words.len() + 2);
        assert_eq!(engine.produced_count(), words.len() + 1);
    }

    #[tokio::test]
    async fn test_sse_emits_one_event_per_delta_plus_done() {
        let engine = Arc::new(ScriptedEngine::replying(descriptor(), &["a", "b", "c"]));
        let generation = start(&engine, Duration::from_secs(5)).await;

        let events: Vec<_> = sse_events(generation, meta(), false).collect().await;
        // role+"a", "b", "c", terminal, [DONE]
        assert_eq!(events.len(), 5);
        assert_eq!(engine.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_sse_include_usage_adds_one_event() {
        let engine = Arc::new(ScriptedEngine::replying(descriptor(), &["a"]));
        let generation = start(&engine, Duration::from_secs(5)).await;

        let events: Vec<_> = sse_events(generation, meta(), true).collect().await;
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_sse_error_delta_ends_stream() {
        let engine = Arc::new(ScriptedEngine::new(descriptor()).with_script(vec![
            TokenDelta::text("a").with_role("assistant"),
            TokenDelta::failed("boom"),
            TokenDelta::text("never sent"),
        ]));
        let generation = start(&engine, Duration::from_secs(5)).await;

        let events: Vec<_> = sse_events(generation, meta(), false).collect().await;
        // "a", error event, [DONE]
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_exactly_once() {
        let engine = Arc::new(
            ScriptedEngine::new(descriptor())
                .with_script(vec![TokenDelta::text("first").with_role("assistant")])
                .hold_open(),
        );
        let generation = start(&engine, Duration::from_secs(30)).await;

        let mut events = Box::pin(sse_events(generation, meta(), false));
        assert!(events.next().await.is_some());
        drop(events);

        assert_eq!(engine.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_pending_generation_cancels() {
        let engine = Arc::new(ScriptedEngine::new(descriptor()).hold_open().with_script(vec![]));
        let generation = start(&engine, Duration::from_secs(30)).await;
        assert_eq!(generation.state(), RequestState::Pending);
        drop(generation);
        assert_eq!(engine.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_completed_generation_does_not_cancel() {
        let engine = Arc::new(ScriptedEngine::replying(descriptor(), &["done"]));
        let mut generation = start(&engine, Duration::from_secs(5)).await;
        while generation.next_delta().await.unwrap().is_some() {}
        assert_eq!(generation.state(), RequestState::Completed);
        drop(generation);
        assert_eq!(engine.cancel_count(), 0);
    }
}
