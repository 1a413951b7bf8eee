use serde_json::{Map, Value};
use types::ToolError;

/// Key that a bare (non-object) argument payload is wrapped under.
pub const BARE_ARGUMENT_KEY: &str = "code";

/// Decode the raw argument text of a tool call into a JSON object.
///
/// Small models regularly get the envelope wrong, so decoding is lenient:
/// - empty or whitespace-only text decodes to `{}`;
/// - a JSON string is parsed once more (double encoding). If that inner
///   parse fails the raw string itself is taken as the value;
/// - a value that is not an object is wrapped as `{"code": value}`.
///
/// Text that is not JSON at all is an [`ToolError::InvalidArguments`].
pub fn decode_arguments(tool: &str, raw: &str) -> Result<Map<String, Value>, ToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }

    let parsed: Value = serde_json::from_str(trimmed).map_err(|error| {
        ToolError::InvalidArguments {
            tool: tool.to_owned(),
            message: format!("arguments are not valid JSON: {error}; raw payload: {trimmed}"),
        }
    })?;

    let value = match parsed {
        Value::String(inner) => match serde_json::from_str::<Value>(&inner) {
            Ok(reparsed) => {
                tracing::debug!(tool, "recovered double-encoded tool arguments");
                reparsed
            }
            Err(_) => Value::String(inner),
        },
        other => other,
    };

    Ok(match value {
        Value::Object(object) => object,
        bare => {
            tracing::debug!(tool, "wrapping bare tool argument value");
            Map::from_iter([(BARE_ARGUMENT_KEY.to_owned(), bare)])
        }
    })
}
