//! In-memory engine and helpers shared by unit and integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, EngineConfig, GenerationConfig, LoggingConfig};
use crate::engine::{
    DeltaStream, EngineClient, EngineFactory, FinishReason, GenerationHandle, GenerationParams,
    InflightTable, ModelDescriptor, TokenDelta,
};
use crate::error::{Error, Result};
use crate::registry::ServingRegistry;
use crate::state::AppState;

/// Channel capacity of every `ScriptedEngine`.
pub const SCRIPTED_STREAM_BUFFER: usize = 4;

/// Engine that replays a fixed delta script for every submission.
pub struct ScriptedEngine {
    descriptor: ModelDescriptor,
    script: Vec<TokenDelta>,
    hold_open: bool,
    delay: Option<Duration>,
    inflight: Arc<InflightTable>,
    /// Deltas accepted by the channel so far, across all submissions.
    produced: Arc<AtomicUsize>,
    cancels: AtomicUsize,
    submissions: Mutex<Vec<GenerationParams>>,
    closed: AtomicBool,
}

impl ScriptedEngine {
    /// Replies "Hello world" and stops.
    pub fn new(descriptor: ModelDescriptor) -> Self {
        Self::replying(descriptor, &["Hello", " world"])
    }

    /// One delta per word, then an empty terminal delta.
    pub fn replying(descriptor: ModelDescriptor, words: &[&str]) -> Self {
        Self {
            descriptor,
            script: word_script(words),
            hold_open: false,
            delay: None,
            inflight: InflightTable::new(SCRIPTED_STREAM_BUFFER),
            produced: Arc::new(AtomicUsize::new(0)),
            cancels: AtomicUsize::new(0),
            submissions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_script(mut self, script: Vec<TokenDelta>) -> Self {
        self.script = script;
        self
    }

    /// Keep the stream open after the script until cancelled.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Sleep before each delta.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `cancel` calls received.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Parameters of every accepted submission, in order.
    pub fn submissions(&self) -> Vec<GenerationParams> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deltas handed to the channel so far.
    pub fn produced_count(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    /// Generations still tracked by the engine.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn word_script(words: &[&str]) -> Vec<TokenDelta> {
    let mut script: Vec<TokenDelta> = words.iter().map(|w| TokenDelta::text(*w)).collect();
    script.push(TokenDelta::finished("", FinishReason::Stop));
    if let Some(first) = script.first_mut() {
        first.role = Some("assistant".to_string());
    }
    script
}

#[async_trait]
impl EngineClient for ScriptedEngine {
    fn engine_type(&self) -> &'static str {
        "scripted"
    }

    async fn submit(&self, params: GenerationParams) -> Result<GenerationHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::EngineUnavailable(format!(
                "engine for {} is shut down",
                self.descriptor.name
            )));
        }
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params);

        let producer = self.inflight.open();
        let handle = producer.handle().clone();
        let script = self.script.clone();
        let delay = self.delay;
        let hold_open = self.hold_open;
        let produced = Arc::clone(&self.produced);

        tokio::spawn(async move {
            for delta in script {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if !producer.send(delta).await {
                    return;
                }
                produced.fetch_add(1, Ordering::SeqCst);
            }
            if hold_open {
                producer.cancellation_token().cancelled().await;
            }
        });

        Ok(handle)
    }

    fn stream(&self, handle: &GenerationHandle) -> Result<DeltaStream> {
        self.inflight.take_stream(handle)
    }

    fn cancel(&self, handle: &GenerationHandle) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.inflight.cancel(handle);
    }

    fn describe_model(&self) -> ModelDescriptor {
        self.descriptor.clone()
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory producing `ScriptedEngine`s; can be told to reject models.
pub struct ScriptedFactory {
    words: Vec<String>,
    hold_open: bool,
    build_delay: Option<Duration>,
    failing: Mutex<HashSet<String>>,
    built: Mutex<Vec<Arc<ScriptedEngine>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            words: vec!["Hello".to_string(), " world".to_string()],
            hold_open: false,
            build_delay: None,
            failing: Mutex::new(HashSet::new()),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(mut self, words: &[&str]) -> Self {
        self.words = words.iter().map(|w| w.to_string()).collect();
        self
    }

    /// Built engines stream the words, then stay open without finishing
    /// until cancelled.
    pub fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Make every build take at least `delay`.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Builds for `model` fail with `EngineUnavailable` from now on.
    pub fn fail_on(&self, model: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.to_string());
    }

    /// Engines built so far, oldest first.
    pub fn built(&self) -> Vec<Arc<ScriptedEngine>> {
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_built(&self) -> Option<Arc<ScriptedEngine>> {
        self.built().pop()
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn build(&self, config: &EngineConfig) -> Result<Arc<dyn EngineClient>> {
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }

        let rejected = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&config.model);
        if rejected {
            return Err(Error::EngineUnavailable(format!(
                "model {} could not be loaded",
                config.model
            )));
        }

        let descriptor = ModelDescriptor {
            name: config.model.clone(),
            root: config
                .download_dir
                .clone()
                .unwrap_or_else(|| config.model.clone()),
            max_context_length: config.max_model_len.unwrap_or(4096),
            owner: config.owned_by.clone(),
            parent: None,
        };
        let words: Vec<&str> = self.words.iter().map(String::as_str).collect();
        let mut engine = ScriptedEngine::replying(descriptor, &words);
        if self.hold_open {
            let mut script = word_script(&words);
            script.pop();
            engine = engine.with_script(script).hold_open();
        }

        let engine = Arc::new(engine);
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&engine));
        Ok(engine)
    }
}

/// Engine config serving `model` under its own name.
pub fn engine_config(model: &str) -> EngineConfig {
    EngineConfig {
        model: model.to_string(),
        ..EngineConfig::default()
    }
}

/// Engine config serving `model` under the public name `served`.
pub fn served_as(model: &str, served: &str) -> EngineConfig {
    EngineConfig {
        served_model_name: vec![served.to_string()],
        ..engine_config(model)
    }
}

pub fn test_config() -> Config {
    Config {
        engine: served_as("test-model", "demo"),
        generation: GenerationConfig {
            request_timeout_secs: 5,
            ..GenerationConfig::default()
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
        ..Config::default()
    }
}

/// State backed by `factory` with nothing loaded yet.
pub fn create_empty_state(factory: Arc<ScriptedFactory>) -> Arc<AppState> {
    let config = test_config();
    let registry = Arc::new(ServingRegistry::new(factory));
    Arc::new(AppState::new(config, registry))
}

/// State backed by `factory` serving `test-model` as `demo`.
pub async fn create_test_state(factory: Arc<ScriptedFactory>) -> Arc<AppState> {
    let state = create_empty_state(factory);
    if let Err(e) = state.registry.reconfigure(state.config.engine.clone()).await {
        panic!("test engine failed to load: {}", e);
    }
    state
}
