use std::collections::BTreeMap;

use types::{ToolCall, ToolCallDelta};

/// Rebuilds complete tool calls from streamed fragments.
///
/// Fragments are keyed by their wire `index` and concatenated in arrival
/// order. Nothing is parsed until [`ToolCallAccumulator::freeze`].
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    by_index: BTreeMap<usize, PendingToolCall>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, delta: ToolCallDelta) {
        let entry = self.by_index.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(name) = delta.name {
            entry.name.push_str(&name);
        }
        if let Some(arguments) = delta.arguments {
            entry.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Freeze the table into calls ordered by index.
    ///
    /// Arguments that are not valid JSON are kept verbatim; executing such a
    /// call produces a tool error that is fed back to the model.
    pub fn freeze(self) -> Vec<ToolCall> {
        self.by_index
            .into_iter()
            .map(|(index, entry)| {
                let id = entry.id.unwrap_or_else(|| {
                    let generated = format!("call_{}", uuid::Uuid::new_v4().simple());
                    tracing::debug!(index, id = %generated, "streamed tool call had no id");
                    generated
                });
                let arguments = if entry.arguments.trim().is_empty() {
                    "{}".to_owned()
                } else {
                    entry.arguments
                };
                if let Err(error) = serde_json::from_str::<serde_json::Value>(&arguments) {
                    tracing::warn!(
                        index,
                        tool = %entry.name,
                        tool_call_id = %id,
                        %error,
                        "streamed tool call arguments are not valid JSON"
                    );
                }
                ToolCall {
                    id,
                    name: entry.name,
                    arguments,
                }
            })
            .collect()
    }

    /// Drop partially accumulated calls. Returns how many were discarded.
    pub fn discard(self) -> usize {
        let discarded = self.by_index.len();
        if discarded > 0 {
            tracing::debug!(discarded, "discarding incomplete tool calls at clean stop");
        }
        discarded
    }
}
