use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers user queries directly and concisely. \
Do not explain instructions or provide examples of your functionality unless asked. \
Your answers should respond to the final element of the existing chat only. \
Only respond with a SINGULAR assistant response for your answer. \
Simple responses should be in plaintext, more complex answers should be formatted with markdown. \
If your answer contains code, be sure to wrap it in triple backticks. \
Only respond to the final element in the provided chat, with a clear response that does not continue for more than one segment.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub prompt: PromptConfig,
    pub generation: GenerationConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_permissive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    Http,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub backend: EngineBackend,
    pub base_url: String,
    pub model: String,
    /// Bounds connecting only; streamed responses may run for as long as they need
    pub connect_timeout_secs: u64,
    pub queue_capacity: usize,
    pub queue_timeout_secs: u64,
    pub fragment_timeout_secs: u64,
    /// Reply used by the mock backend
    pub mock_reply: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub system_prompt: String,
    /// Character budget for the assembled prompt; 0 disables truncation
    pub max_prompt_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub default_max_tokens: u32,
    pub default_temperature: f32,
    pub max_tokens_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Evict sessions idle this long; 0 keeps them for the process lifetime
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Settings {
    /// Load `config/{CONFIG_ENV}` (optional) and `APP__*` overrides on top of
    /// the built-in defaults.
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());

        let config = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(&format!("config/{}", config_env)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Load a specific file on top of the defaults, ignoring the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::with_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?;

        config.try_deserialize()
    }

    pub fn api_key() -> Option<String> {
        env::var("ENGINE_API_KEY").ok().filter(|key| !key.is_empty())
    }

    pub fn max_prompt_chars(&self) -> Option<usize> {
        match self.prompt.max_prompt_chars {
            0 => None,
            chars => Some(chars),
        }
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(builder.add_source(Config::try_from(&Settings::default())?))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                cors_permissive: true,
            },
            engine: EngineConfig {
                backend: EngineBackend::Http,
                base_url: "http://127.0.0.1:8080".to_string(),
                model: "phi-3-mini-4k-instruct".to_string(),
                connect_timeout_secs: 10,
                queue_capacity: 64,
                queue_timeout_secs: 300,
                fragment_timeout_secs: 60,
                mock_reply: "Hello! This reply comes from the mock engine.".to_string(),
            },
            prompt: PromptConfig {
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                max_prompt_chars: 48000,
            },
            generation: GenerationConfig {
                default_max_tokens: 200,
                default_temperature: 0.7,
                max_tokens_limit: 4096,
            },
            session: SessionConfig {
                idle_ttl_secs: 0,
                sweep_interval_secs: 60,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
