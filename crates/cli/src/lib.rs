pub mod bootstrap;
mod render;

pub use bootstrap::{
    CliError, CliOverrides, ConfigSearchPaths, ProviderOverrides, RuntimeOverrides,
    build_runtime, load_agent_config, load_agent_config_with_paths, read_attachments,
};
pub use render::TerminalRenderer;
