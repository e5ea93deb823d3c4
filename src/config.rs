//! Runtime configuration
//!
//! Loaded from a JSON file (every section optional) and then overridden by
//! `CODEVISOR_*` environment variables.
//!
//! ```json
//! {
//!   "model": { "api_key": "sk-...", "endpoint": "https://api.openai.com/v1", "model": "gpt-4" },
//!   "user_model": { "model": "gpt-4o-mini" },
//!   "vision_model": { "api_key": "sk-...", "model": "gpt-4o" },
//!   "kernel": { "interpreter": "python3", "pool_mode": "isolated" },
//!   "execution": { "max_execution_secs": 300 },
//!   "workspace": "/data/project"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kernel::KernelPoolMode;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model used by the single agent and the executor role
    pub model: ModelConfig,
    /// Optional separate model for the planner role
    pub user_model: Option<ModelConfig>,
    /// Model that describes captured figures
    pub vision_model: Option<ModelConfig>,
    pub kernel: KernelConfig,
    #[serde(alias = "security")]
    pub execution: ExecutionConfig,
    pub agent: AgentSettings,
    /// Directory the tools operate in
    pub workspace: Option<PathBuf>,
    /// OTLP collector endpoint; console logging only when unset
    pub otlp_endpoint: Option<String>,
}

/// OpenAI-compatible model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.7,
        }
    }
}

impl ModelConfig {
    /// Usable only with a key, an endpoint and a model name
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.endpoint.is_empty() && !self.model.is_empty()
    }
}

/// Interpreter process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Interpreter tried first
    pub interpreter: String,
    /// Tried once when the primary interpreter fails to start
    pub fallback_interpreter: Option<String>,
    /// One kernel per conversation, or one for everybody
    pub pool_mode: KernelPoolMode,
    /// How long to wait for the kernel's ready handshake
    pub ready_timeout_secs: u64,
    /// Setup code injected once after start (uses the built-in default when unset)
    pub setup_code: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            fallback_interpreter: Some("python".to_string()),
            pool_mode: KernelPoolMode::Isolated,
            ready_timeout_secs: 10,
            setup_code: None,
        }
    }
}

impl KernelConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Limits applied to individual executions and installs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Hard deadline for one code execution
    #[serde(alias = "max_execution_time")]
    pub max_execution_secs: u64,
    /// Upper bound on a single wait for the next kernel message
    pub poll_interval_ms: u64,
    /// Hard deadline for one package install
    pub install_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_execution_secs: 300,
            poll_interval_ms: 1000,
            install_timeout_secs: 600,
        }
    }
}

impl ExecutionConfig {
    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Tool-call rounds allowed within one agent step
    pub max_tool_rounds: usize,
    /// Replaces the built-in analysis assistant prompt
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 20,
            system_prompt: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if given, defaults otherwise, then apply the environment
    pub fn from_sources(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CODEVISOR_*` overrides from an arbitrary lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CODEVISOR_API_KEY") {
            self.model.api_key = v;
        }
        if let Some(v) = lookup("CODEVISOR_ENDPOINT") {
            self.model.endpoint = v;
        }
        if let Some(v) = lookup("CODEVISOR_MODEL") {
            self.model.model = v;
        }
        if let Some(v) = lookup("CODEVISOR_WORKSPACE") {
            self.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CODEVISOR_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(v);
        }
        if let Some(v) = lookup("CODEVISOR_INTERPRETER") {
            self.kernel.interpreter = v;
        }
        if let Some(v) = lookup("CODEVISOR_VISION_MODEL") {
            self.vision_model.get_or_insert_with(ModelConfig::default).model = v;
        }
        if let Some(v) = lookup("CODEVISOR_VISION_API_KEY") {
            self.vision_model.get_or_insert_with(ModelConfig::default).api_key = v;
        }
    }

    /// Model used by the planner role
    pub fn planner_model(&self) -> ModelConfig {
        match &self.user_model {
            Some(m) => {
                let mut planner = m.clone();
                if planner.api_key.is_empty() {
                    planner.api_key = self.model.api_key.clone();
                }
                planner
            }
            None => self.model.clone(),
        }
    }

    /// Vision model, if one is fully configured
    pub fn vision_model(&self) -> Option<&ModelConfig> {
        self.vision_model.as_ref().filter(|m| m.is_complete())
    }
}
