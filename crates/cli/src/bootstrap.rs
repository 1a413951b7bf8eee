use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use provider::build_reliable_provider;
use runtime::{AgentRuntime, RuntimeLimits};
use serde::Serialize;
use thiserror::Error;
use tools::default_registry;
use types::{AgentConfig, ConfigError, ProviderError, RuntimeError, SideInput};

const SYSTEM_CONFIG_DIR: &str = "/etc/codechat";
const USER_CONFIG_DIR: &str = ".config/codechat";
const WORKSPACE_CONFIG_DIR: &str = ".codechat";
pub const AGENT_CONFIG_FILE: &str = "agent.toml";
pub const CONFIG_ENV_PREFIX: &str = "CODECHAT__";
const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone)]
pub struct ConfigSearchPaths {
    pub system_dir: PathBuf,
    pub user_dir: Option<PathBuf>,
    pub workspace_dir: PathBuf,
}

impl ConfigSearchPaths {
    pub fn discover() -> Result<Self, CliError> {
        let workspace_dir = env::current_dir()?.join(WORKSPACE_CONFIG_DIR);
        let user_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(USER_CONFIG_DIR));
        Ok(Self {
            system_dir: PathBuf::from(SYSTEM_CONFIG_DIR),
            user_dir,
            workspace_dir,
        })
    }

    /// Use `dir` in place of `./.codechat` as the highest-precedence
    /// config directory.
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_reasoning: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl CliOverrides {
    /// Wrap flag values, leaving a section out entirely when none of its
    /// flags were given.
    pub fn from_flags(
        max_iterations: Option<usize>,
        show_reasoning: bool,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        let runtime = RuntimeOverrides {
            max_iterations,
            show_reasoning: show_reasoning.then_some(true),
        };
        let provider = ProviderOverrides { model, base_url };
        Self {
            runtime: (runtime != RuntimeOverrides::default()).then_some(runtime),
            provider: (provider != ProviderOverrides::default()).then_some(provider),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to resolve configuration path: {0}")]
    Io(#[from] io::Error),
    #[error("failed to load configuration: {0}")]
    ConfigExtract(#[source] Box<figment::Error>),
    #[error(transparent)]
    ConfigValidation(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("failed to read attachment `{}`: {source}", path.display())]
    Attachment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<figment::Error> for CliError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigExtract(Box::new(value))
    }
}

pub fn load_agent_config(
    profile: Option<&str>,
    profile_dir: Option<&Path>,
    cli_overrides: CliOverrides,
) -> Result<AgentConfig, CliError> {
    let mut paths = ConfigSearchPaths::discover()?;
    if let Some(dir) = profile_dir {
        paths = paths.with_workspace_dir(dir);
    }
    load_agent_config_with_paths(&paths, profile, cli_overrides)
}

/// Layer defaults, the system, user and workspace `agent.toml` files,
/// `CODECHAT__*` env vars and CLI flags, later layers winning.
pub fn load_agent_config_with_paths(
    paths: &ConfigSearchPaths,
    profile: Option<&str>,
    cli_overrides: CliOverrides,
) -> Result<AgentConfig, CliError> {
    let selected_profile = profile
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_PROFILE);

    let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));
    figment = merge_directory(figment, &paths.system_dir, selected_profile);
    if let Some(user_dir) = &paths.user_dir {
        figment = merge_directory(figment, user_dir, selected_profile);
    }
    figment = merge_directory(figment, &paths.workspace_dir, selected_profile);
    figment = figment.merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"));
    figment = figment.merge(Serialized::defaults(cli_overrides));

    let config: AgentConfig = figment.select(selected_profile).extract()?;
    config.validate()?;
    tracing::debug!(
        profile = selected_profile,
        base_url = %config.provider.base_url,
        model = %config.provider.model,
        "configuration loaded"
    );
    Ok(config)
}

/// Assemble the agent from a validated config: the retrying streaming
/// client, the code interpreter registry and the loop limits.
pub fn build_runtime(config: &AgentConfig) -> Result<Arc<AgentRuntime>, CliError> {
    config.validate()?;
    let provider = build_reliable_provider(config)?;
    let registry = default_registry(
        &config.interpreter,
        Duration::from_secs(config.runtime.tool_timeout_secs),
    );
    let mut runtime = AgentRuntime::new(
        Box::new(provider),
        Arc::new(registry),
        config.provider.model.clone(),
        RuntimeLimits::from(&config.runtime),
    );
    if let Some(system_prompt) = &config.system_prompt {
        runtime = runtime.with_system_prompt(system_prompt.clone());
    }
    Ok(Arc::new(runtime))
}

/// Read `--file` attachments. The path is kept as given; the interpreter
/// only uses its basename.
pub fn read_attachments(paths: &[PathBuf]) -> Result<Vec<SideInput>, CliError> {
    paths
        .iter()
        .map(|path| {
            let data = fs::read(path).map_err(|source| CliError::Attachment {
                path: path.clone(),
                source,
            })?;
            Ok(SideInput::new(path.to_string_lossy(), data))
        })
        .collect()
}

fn merge_directory(figment: Figment, directory: &Path, selected_profile: &str) -> Figment {
    let path = directory.join(AGENT_CONFIG_FILE);
    if !path.is_file() {
        return figment;
    }
    if file_uses_profiles(&path, selected_profile) {
        figment.merge(Toml::file(path).nested())
    } else {
        figment.merge(Toml::file(path))
    }
}

fn file_uses_profiles(path: &Path, selected_profile: &str) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(value) = toml::from_str::<toml::Value>(&contents) else {
        return false;
    };
    let Some(table) = value.as_table() else {
        return false;
    };

    table.contains_key("default")
        || table.contains_key("global")
        || table.contains_key(selected_profile)
}
