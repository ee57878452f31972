//! Configuration for the gateway.

use config::{Config as ConfigLoader, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};

use crate::deployment::DeploymentDescriptor;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Scaling bounds and resource needs handed to the orchestrator.
    #[serde(default)]
    pub deployment: DeploymentDescriptor,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Engine construction arguments.
///
/// This is also the `engine_args` body of a reconfigure call, so every field
/// has a default and a partial document is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ollama server URL.
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    /// Model id as known to the engine.
    #[serde(default = "default_model")]
    pub model: String,
    /// Public names the model is served under. Empty means `model` itself.
    #[serde(default)]
    pub served_model_name: Vec<String>,
    /// Context window override. When unset the engine is asked.
    #[serde(default)]
    pub max_model_len: Option<u32>,
    /// Where the weights live, reported as the model card's `root`.
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default = "default_owned_by")]
    pub owned_by: String,
    /// Role stamped on generated messages.
    #[serde(default = "default_response_role")]
    pub response_role: String,
    /// Engine initialization timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            model: default_model(),
            served_model_name: vec![],
            max_model_len: None,
            download_dir: None,
            owned_by: default_owned_by(),
            response_role: default_response_role(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl EngineConfig {
    /// Names this engine answers to, in registration order.
    pub fn served_names(&self) -> Vec<String> {
        if self.served_model_name.is_empty() {
            vec![self.model.clone()]
        } else {
            self.served_model_name.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on a single generation, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Deltas buffered between the engine and the HTTP writer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_engine_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "qwen2.5:1.5b-instruct".to_string()
}
fn default_owned_by() -> String {
    "llm-serve".to_string()
}
fn default_response_role() -> String {
    "assistant".to_string()
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    600
}
fn default_stream_buffer() -> usize {
    32
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (LLM_SERVE__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("LLM_SERVE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("engine.served_model_name")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Load configuration from an in-memory TOML document (no environment).
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("generation.request_timeout_secs", default_request_timeout() as i64)?
            .set_default("generation.stream_buffer", default_stream_buffer() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8000);
    }

    #[test]
    fn test_default_engine_config() {
        let engine = EngineConfig::default();
        assert_eq!(engine.base_url, "http://localhost:11434");
        assert_eq!(engine.response_role, "assistant");
        assert!(engine.max_model_len.is_none());
        assert_eq!(engine.served_names(), vec![engine.model.clone()]);
    }

    #[test]
    fn test_served_names_override_model() {
        let engine = EngineConfig {
            served_model_name: vec!["demo".to_string(), "demo-alias".to_string()],
            ..EngineConfig::default()
        };
        assert_eq!(engine.served_names(), vec!["demo", "demo-alias"]);
    }

    #[test]
    fn test_engine_config_accepts_partial_document() {
        let engine: EngineConfig =
            serde_json::from_str(r#"{"model": "llama3.2:3b", "max_model_len": 4096}"#).unwrap();
        assert_eq!(engine.model, "llama3.2:3b");
        assert_eq!(engine.max_model_len, Some(4096));
        assert_eq!(engine.owned_by, "llm-serve");
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9000

            [engine]
            model = "llama3.2:3b"
            served_model_name = ["demo"]

            [generation]
            request_timeout_secs = 30

            [deployment.autoscaling]
            max_replicas = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.engine.served_names(), vec!["demo"]);
        assert_eq!(config.generation.request_timeout_secs, 30);
        assert_eq!(config.generation.stream_buffer, 32);
        assert_eq!(config.deployment.autoscaling.max_replicas, 8);
        assert_eq!(config.deployment.autoscaling.min_replicas, 2);
        assert_eq!(config.logging.level, "info");
    }
}
