use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ModelId, ProviderId};

pub const SUPPORTED_CONFIG_MAJOR_VERSION: u64 = 1;
pub const LOCAL_PROVIDER_ID: &str = "local";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_MODEL: &str = "qwen3-0.6B";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            runtime: RuntimeConfig::default(),
            provider: ProviderConfig::default(),
            reliability: ReliabilityConfig::default(),
            interpreter: InterpreterConfig::default(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config_version(&self.config_version)?;
        self.runtime.validate()?;
        self.provider.validate()?;

        if self.reliability.max_attempts == 0 {
            return Err(ConfigError::InvalidReliabilityAttempts { attempts: 0 });
        }

        if self.reliability.backoff_base_ms == 0
            || self.reliability.backoff_max_ms == 0
            || self.reliability.backoff_base_ms > self.reliability.backoff_max_ms
        {
            return Err(ConfigError::InvalidReliabilityBackoff {
                base_ms: self.reliability.backoff_base_ms,
                max_ms: self.reliability.backoff_max_ms,
            });
        }

        self.interpreter.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    #[serde(default)]
    pub show_reasoning: bool,
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            turn_timeout_secs: default_turn_timeout_secs(),
            show_reasoning: false,
            stream_buffer_size: default_stream_buffer_size(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_iterations", self.max_iterations as u64),
            ("turn_timeout_secs", self.turn_timeout_secs),
            ("stream_buffer_size", self.stream_buffer_size as u64),
            ("dispatch_queue_capacity", self.dispatch_queue_capacity as u64),
            ("tool_timeout_secs", self.tool_timeout_secs),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidRuntimeLimit { field, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_id")]
    pub id: ProviderId,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_id")]
    pub model: ModelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: default_provider_id(),
            base_url: default_base_url(),
            model: default_model_id(),
            api_key: None,
            api_key_env: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        if self.model.0.trim().is_empty() {
            return Err(ConfigError::EmptyModelForProvider {
                provider: self.id.0.clone(),
            });
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidRuntimeLimit {
                field: "connect_timeout_secs",
                value: 0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    #[serde(default = "default_interpreter_program")]
    pub program: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: default_interpreter_program(),
            workspace_root: default_workspace_root(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl InterpreterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::EmptyInterpreterProgram);
        }
        if self.workspace_root.trim().is_empty() {
            return Err(ConfigError::EmptyWorkspaceRoot);
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::InvalidRuntimeLimit {
                field: "max_output_bytes",
                value: 0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unsupported config_version `{version}`; supported major is {supported_major}")]
    UnsupportedConfigVersion {
        version: String,
        supported_major: u64,
    },
    #[error("invalid config_version format `{version}`")]
    InvalidConfigVersionFormat { version: String },
    #[error("selected model is empty for provider `{provider}`")]
    EmptyModelForProvider { provider: String },
    #[error("provider base_url must not be empty")]
    EmptyBaseUrl,
    #[error("runtime limit `{field}` must be greater than zero; got {value}")]
    InvalidRuntimeLimit { field: &'static str, value: u64 },
    #[error("reliability max_attempts must be greater than zero; got {attempts}")]
    InvalidReliabilityAttempts { attempts: u32 },
    #[error(
        "invalid reliability backoff bounds base={base_ms}ms max={max_ms}ms (both must be >0 and base<=max)"
    )]
    InvalidReliabilityBackoff { base_ms: u64, max_ms: u64 },
    #[error("interpreter program must not be empty")]
    EmptyInterpreterProgram,
    #[error("interpreter workspace_root must not be empty")]
    EmptyWorkspaceRoot,
}

pub fn validate_config_version(config_version: &str) -> Result<(), ConfigError> {
    let major = parse_major_version(config_version)?;
    if major != SUPPORTED_CONFIG_MAJOR_VERSION {
        return Err(ConfigError::UnsupportedConfigVersion {
            version: config_version.trim().to_owned(),
            supported_major: SUPPORTED_CONFIG_MAJOR_VERSION,
        });
    }
    Ok(())
}

fn parse_major_version(config_version: &str) -> Result<u64, ConfigError> {
    let trimmed = config_version.trim();
    let invalid = || ConfigError::InvalidConfigVersionFormat {
        version: trimmed.to_owned(),
    };
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut parts = trimmed.split('.');
    let first = parts.next().ok_or_else(invalid)?;
    let is_numeric = |part: &str| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit());
    if !is_numeric(first) || !parts.all(is_numeric) {
        return Err(invalid());
    }

    first.parse::<u64>().map_err(|_| invalid())
}

fn default_config_version() -> String {
    "1.0.0".to_owned()
}

fn default_provider_id() -> ProviderId {
    ProviderId::from(LOCAL_PROVIDER_ID)
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_model_id() -> ModelId {
    ModelId::from(DEFAULT_MODEL)
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_iterations() -> usize {
    5
}

fn default_turn_timeout_secs() -> u64 {
    120
}

fn default_stream_buffer_size() -> usize {
    64
}

fn default_dispatch_queue_capacity() -> usize {
    32
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_interpreter_program() -> String {
    "python3".to_owned()
}

fn default_workspace_root() -> String {
    ".codechat/workspaces".to_owned()
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}
