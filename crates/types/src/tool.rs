use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{SideInput, ToolError};

/// A tool parameter schema expressed as a raw JSON Schema value.
///
/// Construct schemas with `serde_json::json!({...})`:
///
/// ```rust,ignore
/// use serde_json::json;
/// let params = json!({
///     "type": "object",
///     "required": ["code"],
///     "properties": {
///         "code": { "type": "string", "minLength": 1 }
///     }
/// });
/// ```
pub type ToolParameterSchema = Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: ToolParameterSchema,
}

impl FunctionDecl {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        parameters: ToolParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            parameters,
        }
    }
}

/// One call handed to a [`ToolExecutor`]. The arguments are already decoded
/// into a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub side_inputs: Vec<SideInput>,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    ExecuteResult,
    DisplayData,
}

/// A rich result produced by executed code, keyed by MIME type
/// (`text/plain`, `text/html`, `image/png`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub kind: ResultKind,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ResultPayload {
    pub fn text(kind: ResultKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            data: BTreeMap::from([("text/plain".to_owned(), text.into())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
}

/// The code-execution backend.
///
/// `execute` is synchronous and may block for a long time; callers are
/// expected to run it off the async scheduler.
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<FunctionDecl>;

    fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError>;

    /// Release per-session resources (workspaces, kernels). Defaults to a no-op.
    fn release_session(&self, _session_id: &str) {}
}
