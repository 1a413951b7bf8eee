use std::{
    collections::HashMap,
    fs::{self, File},
    path::Path,
    process::{Command, ExitStatus, Stdio},
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use serde_json::json;
use types::{
    ExecutionError, ExecutionOutput, FunctionDecl, InterpreterConfig, ToolError, ToolInvocation,
};

use crate::{
    CODE_INTERPRETER_TOOL_NAME, Tool, execution_failed, invalid_args,
    workspace::SessionWorkspaces,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDOUT_FILE: &str = ".cell.stdout";
const STDERR_FILE: &str = ".cell.stderr";

/// Runs model-written code as a script in the session workspace.
///
/// Each call is a fresh process; files written to the workspace persist
/// between calls of the same session, interpreter state does not. Output
/// comes back as streams only: a script has no last-expression value, so
/// `results` stays empty.
#[derive(Debug)]
pub struct CodeInterpreterTool {
    program: String,
    timeout: Duration,
    workspaces: SessionWorkspaces,
    execution_counts: Mutex<HashMap<String, u32>>,
}

impl CodeInterpreterTool {
    pub fn new(config: &InterpreterConfig, timeout: Duration) -> Self {
        Self {
            program: config.program.clone(),
            timeout,
            workspaces: SessionWorkspaces::new(&config.workspace_root),
            execution_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspaces(&self) -> &SessionWorkspaces {
        &self.workspaces
    }

    fn next_execution_count(&self, session_id: &str) -> u32 {
        let mut counts = self
            .execution_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(session_id.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// `script` is resolved relative to `workspace`, which becomes the
    /// child's working directory.
    fn run_script(&self, workspace: &Path, script: &str) -> Result<RunOutcome, ToolError> {
        let stdout_path = workspace.join(STDOUT_FILE);
        let stderr_path = workspace.join(STDERR_FILE);
        let stdout = File::create(&stdout_path).map_err(io_failed)?;
        let stderr = File::create(&stderr_path).map_err(io_failed)?;

        let mut child = Command::new(&self.program)
            .arg(script)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|error| {
                execution_failed(
                    CODE_INTERPRETER_TOOL_NAME,
                    format!("failed to start `{}`: {error}", self.program),
                )
            })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(io_failed)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(
                        timeout = ?self.timeout,
                        "killed interpreter process after timeout"
                    );
                    return Err(ToolError::TimedOut {
                        tool: CODE_INTERPRETER_TOOL_NAME.to_owned(),
                        timeout: self.timeout,
                    });
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        Ok(RunOutcome {
            status,
            stdout: read_captured(&stdout_path),
            stderr: read_captured(&stderr_path),
        })
    }
}

struct RunOutcome {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl Tool for CodeInterpreterTool {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new(
            CODE_INTERPRETER_TOOL_NAME,
            Some(
                "A powerful Python code execution environment for complex math, data analysis, \
                 and general programming tasks. Input only raw Python code, no explanation needed."
                    .to_owned(),
            ),
            json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "The python code to execute."
                    }
                },
                "required": ["code"]
            }),
        )
    }

    fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError> {
        let code = invocation
            .arguments
            .get("code")
            .and_then(|value| value.as_str())
            .ok_or_else(|| invalid_args(CODE_INTERPRETER_TOOL_NAME, "`code` must be a string"))?;

        let workspace = self
            .workspaces
            .ensure(&invocation.session_id)
            .map_err(io_failed)?;
        self.workspaces
            .materialize(&workspace, &invocation.side_inputs)
            .map_err(io_failed)?;

        let execution_count = self.next_execution_count(&invocation.session_id);
        let script = format!(".cell_{execution_count}.py");
        fs::write(workspace.join(&script), code).map_err(io_failed)?;

        tracing::debug!(
            session_id = %invocation.session_id,
            execution_count,
            program = %self.program,
            "running interpreter cell"
        );
        let outcome = self.run_script(&workspace, &script)?;

        let mut output = ExecutionOutput {
            stdout: Some(outcome.stdout).filter(|text| !text.is_empty()),
            stderr: None,
            error: None,
            results: Vec::new(),
            execution_count: Some(execution_count),
        };
        if outcome.status.success() {
            output.stderr = Some(outcome.stderr).filter(|text| !text.is_empty());
        } else {
            output.error = Some(error_from_stderr(&outcome.stderr, outcome.status));
        }
        Ok(output)
    }

    fn release_session(&self, session_id: &str) {
        self.workspaces.release(session_id);
        self.execution_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}

fn io_failed(error: std::io::Error) -> ToolError {
    execution_failed(CODE_INTERPRETER_TOOL_NAME, error.to_string())
}

fn read_captured(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "captured output unavailable");
            String::new()
        }
    }
}

/// Build an error record from a failed run. The last stderr line names the
/// exception when it has the `Name: message` shape Python prints.
pub(crate) fn error_from_stderr(stderr: &str, status: ExitStatus) -> ExecutionError {
    let traceback = stderr.lines().map(str::to_owned).collect::<Vec<_>>();
    let last_line = traceback
        .iter()
        .rev()
        .map(|line| line.trim())
        .find(|line| !line.is_empty());

    let (name, message) = match last_line {
        Some(line) => match line.split_once(": ") {
            Some((name, message)) if is_exception_name(name) => {
                (name.to_owned(), message.to_owned())
            }
            _ if is_exception_name(line) => (line.to_owned(), String::new()),
            _ => ("ExecutionError".to_owned(), line.to_owned()),
        },
        None => (
            "ExecutionError".to_owned(),
            match status.code() {
                Some(code) => format!("process exited with status {code}"),
                None => "process terminated by signal".to_owned(),
            },
        ),
    };

    ExecutionError {
        name,
        message,
        traceback,
    }
}

fn is_exception_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
        && candidate.chars().next().is_some_and(|ch| ch.is_ascii_uppercase())
}
