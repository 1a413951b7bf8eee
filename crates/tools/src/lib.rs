use std::{collections::BTreeMap, time::Duration};

use serde_json::Value;
use types::{
    ExecutionOutput, FunctionDecl, InterpreterConfig, ToolError, ToolExecutor, ToolInvocation,
};

mod decode;
mod format;
mod interpreter;
mod workspace;

pub use decode::{BARE_ARGUMENT_KEY, decode_arguments};
pub use format::{format_execution_output, render_tool_content};
pub use interpreter::CodeInterpreterTool;
pub use workspace::SessionWorkspaces;

pub const CODE_INTERPRETER_TOOL_NAME: &str = "run_code_interpreter";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// A single callable tool. Execution is synchronous and may block; the
/// dispatch worker runs it on the blocking pool.
pub trait Tool: Send + Sync {
    fn schema(&self) -> FunctionDecl;

    fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError>;

    fn release_session(&self, _session_id: &str) {}
}

pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
    max_output_bytes: usize,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

impl ToolRegistry {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            tools: BTreeMap::new(),
            max_output_bytes,
        }
    }

    pub fn register<T>(&mut self, name: impl Into<String>, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(name.into(), Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(Box::as_ref)
    }

    pub fn schemas(&self) -> Vec<FunctionDecl> {
        self.tools.values().map(|tool| tool.schema()).collect()
    }

    fn validate_arguments(
        &self,
        tool: &dyn Tool,
        name: &str,
        arguments: &Value,
    ) -> Result<(), ToolError> {
        let schema = tool.schema();
        let validator = jsonschema::options()
            .build(&schema.parameters)
            .map_err(|error| {
                execution_failed(
                    name,
                    format!("failed to compile validation schema: {error}"),
                )
            })?;

        if !validator.is_valid(arguments) {
            let error_msgs: Vec<String> = validator
                .iter_errors(arguments)
                .map(|e| format!("- {e}"))
                .collect();
            return Err(invalid_args(
                name,
                format!("schema validation failed:\n{}", error_msgs.join("\n")),
            ));
        }
        Ok(())
    }
}

impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<FunctionDecl> {
        self.schemas()
    }

    fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError> {
        let name = invocation.name.as_str();
        let tool = self
            .get(name)
            .ok_or_else(|| execution_failed(name, format!("unknown tool `{name}`")))?;

        let arguments = Value::Object(invocation.arguments.clone());
        self.validate_arguments(tool, name, &arguments)?;

        let mut output = tool.execute(invocation)?;
        output.stdout = output
            .stdout
            .map(|text| truncate_output(text, self.max_output_bytes));
        output.stderr = output
            .stderr
            .map(|text| truncate_output(text, self.max_output_bytes));
        Ok(output)
    }

    fn release_session(&self, session_id: &str) {
        for tool in self.tools.values() {
            tool.release_session(session_id);
        }
    }
}

/// Registry holding the code interpreter configured from `config`.
pub fn default_registry(config: &InterpreterConfig, timeout: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new(config.max_output_bytes);
    registry.register(
        CODE_INTERPRETER_TOOL_NAME,
        CodeInterpreterTool::new(config, timeout),
    );
    registry
}

fn invalid_args(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn execution_failed(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn truncate_output(mut output: String, max_output_bytes: usize) -> String {
    if output.len() <= max_output_bytes {
        return output;
    }

    let original_bytes = output.len();
    let mut cutoff = max_output_bytes.min(original_bytes);
    while cutoff > 0 && !output.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    output.truncate(cutoff);
    output.push_str(&format!(
        "\n...[output truncated: {} bytes total]",
        original_bytes
    ));
    output
}
