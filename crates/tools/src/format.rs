use serde_json::{Map, Value, json};
use types::{ExecutionOutput, ResultKind, ToolError};

/// Lay out an execution result as notebook cell outputs: stdout and stderr
/// streams first, then the error, then rich results. Results with an empty
/// MIME bundle are dropped.
pub fn format_execution_output(output: &ExecutionOutput) -> Vec<Value> {
    let mut outputs = Vec::new();

    for (name, text) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
        if let Some(text) = text.as_deref().filter(|text| !text.is_empty()) {
            outputs.push(json!({
                "output_type": "stream",
                "name": name,
                "text": text,
            }));
        }
    }

    if let Some(error) = &output.error {
        outputs.push(json!({
            "output_type": "error",
            "ename": error.name,
            "evalue": error.message,
            "traceback": error.traceback,
        }));
    }

    for result in &output.results {
        if result.data.is_empty() {
            continue;
        }
        let mut cell = Map::new();
        let output_type = match result.kind {
            ResultKind::ExecuteResult => "execute_result",
            ResultKind::DisplayData => "display_data",
        };
        cell.insert("output_type".to_owned(), json!(output_type));
        cell.insert("metadata".to_owned(), json!({}));
        cell.insert("data".to_owned(), json!(result.data));
        if result.kind == ResultKind::ExecuteResult
            && let Some(count) = output.execution_count
        {
            cell.insert("execution_count".to_owned(), json!(count));
        }
        outputs.push(Value::Object(cell));
    }

    outputs
}

/// The tool message content sent back to the model.
pub fn render_tool_content(output: &ExecutionOutput) -> Result<String, ToolError> {
    Ok(serde_json::to_string(&format_execution_output(output))?)
}
