//! Configuration types for the MPLLM pipeline

use crate::cost::{ModelRate, PricingTable};
use crate::error::{Error, Result};
use crate::profile::ResearchMode;
use dotenvy::dotenv;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Model configuration for one completion port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier (e.g., "openai/gpt-4o-mini")
    pub model: String,
    /// Temperature for sampling (0.0-2.0)
    pub temperature: f32,
    /// Maximum tokens for completion
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    /// Create a new model configuration
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    /// Set the temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the maximum tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// OpenRouter client configuration
#[derive(Clone)]
pub struct OpenRouterConfig {
    /// API key (loaded from environment variable)
    pub api_key: SecretString,
    /// Base URL for OpenRouter API
    pub base_url: Url,
    /// Request timeout
    pub timeout: Duration,
    /// App name for OpenRouter tracking
    pub app_name: String,
}

impl OpenRouterConfig {
    /// Create a new OpenRouter configuration from environment
    pub fn from_env() -> Result<Self> {
        // Load .env if present so local development picks up OPENROUTER_API_KEY
        let _ = dotenv();

        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| Error::config("OPENROUTER_API_KEY environment variable not set"))?;

        let mut config = Self::new(api_key)?;
        if let Ok(base_url) = std::env::var("OPENROUTER_BASE_URL") {
            let base_url = Url::parse(&base_url)
                .map_err(|e| Error::config(format!("Invalid OPENROUTER_BASE_URL: {}", e)))?;
            config = config.with_base_url(base_url);
        }
        Ok(config)
    }

    /// Create a new OpenRouter configuration with a specific API key
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(OPENROUTER_BASE_URL)
            .map_err(|e| Error::config(format!("Invalid base URL: {}", e)))?;

        Ok(Self {
            api_key: SecretString::from(api_key.into()),
            base_url,
            timeout: Duration::from_secs(120),
            app_name: "MPLLM Pipeline".to_string(),
        })
    }

    /// Set the base URL
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the app name
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Get the API key as a string
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

impl std::fmt::Debug for OpenRouterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterConfig")
            .field("api_key", &"***REDACTED***")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("app_name", &self.app_name)
            .finish()
    }
}

/// Pipeline configuration, usually loaded from YAML
///
/// ```yaml
/// arbiter_model: openai/gpt-4o-mini
/// worker_model: openai/gpt-4o-mini
/// max_parallel: 4
/// research_mode: per_group
/// pricing:
///   openai/gpt-4o-mini: { input: 0.15, output: 0.60 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model for the Switch and Minimux stages
    #[serde(default = "default_arbiter_model")]
    pub arbiter_model: String,
    /// Model for Researcher, Thinker and Guesser calls
    #[serde(default = "default_worker_model")]
    pub worker_model: String,
    /// Worker ceiling for each fan-out
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Sampling temperature for every call
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion cap for arbiter calls
    #[serde(default)]
    pub arbiter_max_tokens: Option<u32>,
    /// Completion cap for worker calls
    #[serde(default = "default_worker_max_tokens")]
    pub worker_max_tokens: Option<u32>,
    /// Override of the profile's research strategy
    #[serde(default)]
    pub research_mode: Option<ResearchMode>,
    /// Per-model price overrides, USD per million tokens
    #[serde(default)]
    pub pricing: HashMap<String, ModelRate>,
}

fn default_arbiter_model() -> String {
    presets::MINI.to_string()
}
fn default_worker_model() -> String {
    presets::NANO.to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_temperature() -> f32 {
    0.7
}
fn default_worker_max_tokens() -> Option<u32> {
    Some(1500)
}

/// Upper bound on fan-out width; the pipeline only ever runs a handful of branches
pub const MAX_PARALLEL_CEILING: usize = 8;

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            arbiter_model: default_arbiter_model(),
            worker_model: default_worker_model(),
            max_parallel: default_max_parallel(),
            temperature: default_temperature(),
            arbiter_max_tokens: None,
            worker_max_tokens: default_worker_max_tokens(),
            research_mode: None,
            pricing: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.arbiter_model.trim().is_empty() || self.worker_model.trim().is_empty() {
            return Err(Error::config("model identifiers must not be empty"));
        }
        if self.max_parallel == 0 {
            return Err(Error::config("max_parallel must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::config(format!(
                "temperature {} outside 0.0-2.0",
                self.temperature
            )));
        }
        Ok(())
    }

    /// Fan-out width actually used, clamped to the supported ceiling
    pub fn effective_parallelism(&self) -> usize {
        self.max_parallel.clamp(1, MAX_PARALLEL_CEILING)
    }

    /// Model settings for the arbiter port
    pub fn arbiter_model_config(&self) -> ModelConfig {
        let mut model = ModelConfig::new(&self.arbiter_model).with_temperature(self.temperature);
        model.max_tokens = self.arbiter_max_tokens;
        model
    }

    /// Model settings for the worker port
    pub fn worker_model_config(&self) -> ModelConfig {
        let mut model = ModelConfig::new(&self.worker_model).with_temperature(self.temperature);
        model.max_tokens = self.worker_max_tokens;
        model
    }

    /// Default pricing with this configuration's overrides applied
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::default();
        for (model, rate) in &self.pricing {
            table.insert(model.clone(), *rate);
        }
        table
    }
}

/// Recommended model identifiers
pub mod presets {
    /// Stronger model for persona generation and arbitration
    pub const MINI: &str = "openai/gpt-4o-mini";

    /// Cheap model for the fan-out workers
    pub const NANO: &str = "openai/gpt-4o-mini";

    /// Full-size model
    pub const GPT4O: &str = "openai/gpt-4o";
}
