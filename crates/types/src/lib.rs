mod config;
mod error;
mod model;
mod provider;
mod render;
mod tool;
mod tracing;

pub use config::{
    AgentConfig, ConfigError, DEFAULT_BASE_URL, DEFAULT_MODEL, InterpreterConfig,
    LOCAL_PROVIDER_ID, ProviderConfig, ReliabilityConfig, RuntimeConfig,
    SUPPORTED_CONFIG_MAJOR_VERSION, validate_config_version,
};
pub use error::{ProviderError, RuntimeError, ToolError};
pub use model::{
    Context, FinishReason, Message, MessageRole, ModelId, ProviderId, SideInput, StreamEvent,
    ToolCall, ToolCallDelta, UserPrompt,
};
pub use provider::{Provider, ProviderStream};
pub use render::{FragmentKind, RenderFragment, RenderSender, ResponseRegions};
pub use tool::{
    ExecutionError, ExecutionOutput, FunctionDecl, ResultKind, ResultPayload, ToolExecutor,
    ToolInvocation, ToolParameterSchema,
};
pub use tracing::init_tracing;
