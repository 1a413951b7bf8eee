use types::{FinishReason, StreamEvent};

use super::*;

#[derive(Debug)]
pub(crate) enum TurnEnd {
    Stop,
    ToolCalls(Vec<ToolCall>),
}

/// One fully consumed stream.
#[derive(Debug)]
pub(crate) struct StreamedTurn {
    pub(crate) content: String,
    pub(crate) reasoning: String,
    pub(crate) end: TurnEnd,
}

impl AgentRuntime {
    /// Open a stream for `context` and route its events until the turn
    /// finishes. Content is rendered as it stabilizes; reasoning is rendered
    /// as-is when enabled.
    pub(crate) async fn stream_turn(
        &self,
        context: &Context,
        scope: &PromptScope<'_>,
    ) -> Result<StreamedTurn, RuntimeError> {
        let cancellation = scope.cancellation;
        if cancellation.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let mut stream = tokio::select! {
            _ = cancellation.cancelled() => return Err(RuntimeError::Cancelled),
            timed = tokio::time::timeout(
                self.limits.turn_timeout,
                self.provider.stream(context, self.limits.stream_buffer_size),
            ) => match timed {
                Ok(stream) => stream?,
                Err(_) => return Err(RuntimeError::TurnTimedOut(self.limits.turn_timeout)),
            },
        };
        let mut stabilizer = MarkdownStabilizer::new();
        let mut tool_calls = ToolCallAccumulator::new();
        let mut reasoning = String::new();
        let mut finish_reason = None;

        loop {
            let item = tokio::select! {
                _ = cancellation.cancelled() => return Err(RuntimeError::Cancelled),
                timed = tokio::time::timeout(self.limits.turn_timeout, stream.recv()) => match timed {
                    Ok(item) => item,
                    Err(_) => return Err(RuntimeError::TurnTimedOut(self.limits.turn_timeout)),
                }
            };
            let Some(item) = item else {
                break;
            };

            match item? {
                StreamEvent::ContentDelta(text) => {
                    if let Some(fragment) = stabilizer.advance(&text) {
                        scope.emit(FragmentKind::Content, fragment);
                    }
                }
                StreamEvent::ReasoningDelta(text) => {
                    if self.limits.show_reasoning {
                        scope.emit(FragmentKind::Reasoning, text.as_str());
                    }
                    reasoning.push_str(&text);
                }
                StreamEvent::ToolCallDelta(delta) => tool_calls.merge(delta),
                StreamEvent::TurnFinished(reason) => {
                    finish_reason = Some(reason);
                    break;
                }
            }
        }

        let finalized = stabilizer.finalize();
        if let Some(fragment) = finalized.fragment {
            scope.emit(FragmentKind::Content, fragment);
        }

        let end = match finish_reason {
            Some(FinishReason::ToolCalls) if !tool_calls.is_empty() => {
                TurnEnd::ToolCalls(tool_calls.freeze())
            }
            Some(FinishReason::ToolCalls) => {
                tracing::warn!("stream signalled tool_calls without any tool call; treating as stop");
                TurnEnd::Stop
            }
            Some(FinishReason::Stop) => {
                tool_calls.discard();
                TurnEnd::Stop
            }
            Some(FinishReason::Other(reason)) => {
                tracing::warn!(%reason, "stream finished with unexpected reason; treating as stop");
                tool_calls.discard();
                TurnEnd::Stop
            }
            None => {
                tracing::warn!(
                    pending_tool_calls = tool_calls.len(),
                    "stream ended without a finish reason; treating as stop"
                );
                tool_calls.discard();
                TurnEnd::Stop
            }
        };

        Ok(StreamedTurn {
            content: finalized.document,
            reasoning,
            end,
        })
    }
}
