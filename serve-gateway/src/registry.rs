//! Serving registry: the live engine and the models it publishes.
//!
//! Readers take the current snapshot without locking; a reconfigure builds
//! the replacement engine off to the side and swaps it in as one unit, so a
//! reader sees either the old model set or the new one, never a mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::engine::{EngineClient, EngineFactory, ModelDescriptor};
use crate::error::{Error, Result};

/// Immutable view of what is being served.
pub struct ServingSnapshot {
    pub engine: Arc<dyn EngineClient>,
    /// One descriptor per served name.
    pub models: Vec<ModelDescriptor>,
    pub response_role: String,
    pub config: EngineConfig,
    /// Increases by one with every successful reconfigure.
    pub epoch: u64,
    pub loaded_at: DateTime<Utc>,
}

impl ServingSnapshot {
    pub fn find(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistryStatus {
    NotLoaded,
    Ready,
    /// Serving, but the last reconfigure failed.
    Degraded { error: String },
}

pub struct ServingRegistry {
    factory: Arc<dyn EngineFactory>,
    active: ArcSwapOption<ServingSnapshot>,
    last_error: ArcSwapOption<String>,
    reconfigure_lock: Mutex<()>,
    epoch: AtomicU64,
}

impl ServingRegistry {
    /// Empty registry. Nothing is served until the first `reconfigure`.
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            active: ArcSwapOption::empty(),
            last_error: ArcSwapOption::empty(),
            reconfigure_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current snapshot, or `EngineUnavailable` if nothing is loaded.
    pub fn active(&self) -> Result<Arc<ServingSnapshot>> {
        self.active
            .load_full()
            .ok_or_else(|| Error::EngineUnavailable("no engine is loaded".to_string()))
    }

    /// Snapshot and descriptor for `name`, taken from the same snapshot.
    pub fn resolve(&self, name: &str) -> Result<(Arc<ServingSnapshot>, ModelDescriptor)> {
        let snapshot = self.active()?;
        let descriptor = snapshot
            .find(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok((snapshot, descriptor))
    }

    pub fn get(&self, name: &str) -> Result<ModelDescriptor> {
        self.resolve(name).map(|(_, descriptor)| descriptor)
    }

    /// Descriptors currently served. Empty when nothing is loaded.
    pub fn list(&self) -> Vec<ModelDescriptor> {
        self.active
            .load_full()
            .map(|s| s.models.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> RegistryStatus {
        if self.active.load().is_none() {
            return RegistryStatus::NotLoaded;
        }
        match self.last_error.load_full() {
            Some(error) => RegistryStatus::Degraded {
                error: error.as_ref().clone(),
            },
            None => RegistryStatus::Ready,
        }
    }

    /// Error message of the last failed reconfigure, cleared on success.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.load_full().map(|e| e.as_ref().clone())
    }

    /// Bring up an engine for `config` and make it the active one.
    ///
    /// Reconfigures run one at a time. On failure the previous snapshot stays
    /// active and the error is kept for `status`. Requests holding the old
    /// snapshot finish on the old engine.
    pub async fn reconfigure(&self, config: EngineConfig) -> Result<Arc<ServingSnapshot>> {
        let _guard = self.reconfigure_lock.lock().await;
        tracing::info!(model = %config.model, served = ?config.served_names(), "Reconfiguring engine");

        let engine = match self.factory.build(&config).await {
            Ok(engine) => engine,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    model = %config.model,
                    "Reconfigure failed, previous engine stays active: {}",
                    message
                );
                self.last_error.store(Some(Arc::new(message.clone())));
                return Err(Error::Reconfigure(message));
            }
        };

        let base = engine.describe_model();
        let models: Vec<ModelDescriptor> = config
            .served_names()
            .iter()
            .map(|name| base.aliased(name))
            .collect();

        let snapshot = Arc::new(ServingSnapshot {
            engine,
            models,
            response_role: config.response_role.clone(),
            config,
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
            loaded_at: Utc::now(),
        });

        let previous = self.active.swap(Some(Arc::clone(&snapshot)));
        self.last_error.store(None);

        tracing::info!(
            epoch = snapshot.epoch,
            engine = snapshot.engine.engine_type(),
            models = ?snapshot.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            max_context_length = base.max_context_length,
            "Engine active"
        );
        if let Some(previous) = previous {
            tracing::info!(epoch = previous.epoch, "Previous engine released to in-flight requests");
        }

        Ok(snapshot)
    }

    /// Stop serving. The engine stops accepting work; running generations
    /// are left to finish.
    pub async fn teardown(&self) {
        let _guard = self.reconfigure_lock.lock().await;
        if let Some(snapshot) = self.active.swap(None) {
            tracing::info!(epoch = snapshot.epoch, "Tearing down engine");
            snapshot.engine.shutdown();
        }
    }
}
