use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use types::{
    Context, FragmentKind, Message, ModelId, Provider, RenderSender, ResponseRegions,
    RuntimeConfig, RuntimeError, SideInput, ToolCall, ToolExecutor,
};

mod accumulator;
mod budget;
mod dispatch;
mod provider_response;
mod session;
mod stabilizer;
mod tool_execution;

pub use accumulator::ToolCallAccumulator;
pub use dispatch::{
    CancelledBatches, DispatchMessage, JoinableQueue, QueueConsumer, TOOL_ERROR_PREFIX,
    ToolDispatchQueue, ToolExecutionJob, ToolExecutionResult, WorkerState, run_dispatch_worker,
};
pub use session::AgentSession;
pub use stabilizer::{Finalized, MarkdownStabilizer};

#[cfg(test)]
mod tests;

const DEFAULT_STREAM_BUFFER_SIZE: usize = 64;
const FILES_PLACEHOLDER: &str = "{files}";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding agent with access to a Python code \
interpreter. When possible break down tasks step-by-step.
The following files are available (if any):
{files}
Make sure to reference the exact filepath and filename in any code. Call \
`run_code_interpreter` with raw Python code only. Every call runs in a fresh process: \
variables do not persist between calls, but files written to the working directory do.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Start,
    Streaming,
    ToolCallsPending,
    Dispatching,
    AwaitingResults,
    CleanStop,
    BudgetExhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    /// Upper bound on streamed turns per prompt.
    pub max_iterations: usize,
    /// Longest allowed silence while opening or reading a stream.
    pub turn_timeout: Duration,
    pub tool_timeout: Duration,
    pub stream_buffer_size: usize,
    pub dispatch_queue_capacity: usize,
    pub show_reasoning: bool,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            turn_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(120),
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            dispatch_queue_capacity: 32,
            show_reasoning: false,
        }
    }
}

impl From<&RuntimeConfig> for RuntimeLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            turn_timeout: Duration::from_secs(config.turn_timeout_secs),
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
            stream_buffer_size: config.stream_buffer_size,
            dispatch_queue_capacity: config.dispatch_queue_capacity,
            show_reasoning: config.show_reasoning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// `max_iterations` ran out before a clean stop.
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub answer: String,
    pub status: TurnStatus,
    pub turns: usize,
}

pub struct AgentRuntime {
    provider: Box<dyn Provider>,
    executor: Arc<dyn ToolExecutor>,
    model: ModelId,
    limits: RuntimeLimits,
    system_prompt: Option<String>,
}

impl AgentRuntime {
    pub fn new(
        provider: Box<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
        model: ModelId,
        limits: RuntimeLimits,
    ) -> Self {
        Self {
            provider,
            executor,
            model,
            limits,
            system_prompt: None,
        }
    }

    /// Replace the built-in system prompt. A `{files}` placeholder is filled
    /// with the attachments of the first prompt.
    pub fn with_system_prompt(mut self, prompt: String) -> Self {
        self.system_prompt = Some(prompt);
        self
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub(crate) fn executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    pub fn system_prompt_for(&self, attachments: &[SideInput]) -> String {
        let files = if attachments.is_empty() {
            "(none)".to_owned()
        } else {
            attachments
                .iter()
                .map(|attachment| format!("- {}", attachment.file_name()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        self.system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
            .replace(FILES_PLACEHOLDER, &files)
    }

    /// Open a session with its own queues and dispatch worker. Must be called
    /// from within a Tokio runtime.
    pub fn start_session(self: &Arc<Self>) -> Result<AgentSession, RuntimeError> {
        AgentSession::new(Arc::clone(self))
    }

    pub(crate) fn build_context(&self, conversation: &[Message]) -> Context {
        Context {
            provider: self.provider.provider_id().clone(),
            model: self.model.clone(),
            tools: self.executor.definitions(),
            messages: conversation.to_vec(),
        }
    }

    /// Drive one prompt to a clean stop or to the iteration budget.
    ///
    /// The assistant tool-call message of a turn is held back until its tool
    /// results are in, so `conversation` only ever grows by whole turns.
    pub(crate) async fn run_prompt_turns(
        &self,
        conversation: &mut Vec<Message>,
        dispatch: &mut ToolDispatchQueue,
        scope: &PromptScope<'_>,
    ) -> Result<TurnOutcome, RuntimeError> {
        self.validate_guard_preconditions()?;
        let state = TurnState::Start;
        tracing::debug!(
            ?state,
            session_id = %scope.session_id,
            max_iterations = self.limits.max_iterations,
            "starting prompt"
        );
        let mut partial_answer = String::new();

        for turn in 1..=self.limits.max_iterations {
            if scope.cancellation.is_cancelled() {
                let state = TurnState::Cancelled;
                tracing::debug!(turn, ?state, "prompt cancelled before provider call");
                return Err(RuntimeError::Cancelled);
            }

            let state = TurnState::Streaming;
            tracing::debug!(turn, ?state, "running provider turn");
            tracing::info!(
                turn,
                max_iterations = self.limits.max_iterations,
                "calling provider"
            );
            let context = self.build_context(conversation);
            let streamed = self.stream_turn(&context, scope).await?;
            if !streamed.content.is_empty() {
                partial_answer.clone_from(&streamed.content);
            }

            let tool_calls = match streamed.end {
                provider_response::TurnEnd::ToolCalls(tool_calls) => tool_calls,
                provider_response::TurnEnd::Stop => {
                    let state = TurnState::CleanStop;
                    tracing::debug!(turn, ?state, "turn finished without tool calls");
                    conversation.push(
                        Message::assistant(streamed.content.clone())
                            .with_reasoning(Some(streamed.reasoning)),
                    );
                    return Ok(TurnOutcome {
                        answer: streamed.content,
                        status: TurnStatus::Completed,
                        turns: turn,
                    });
                }
            };

            let state = TurnState::ToolCallsPending;
            tracing::debug!(
                turn,
                ?state,
                tool_calls = tool_calls.len(),
                "holding assistant tool-call message"
            );
            let pending_tail = Message::assistant_tool_calls(
                Some(streamed.content),
                tool_calls.clone(),
            )
            .with_reasoning(Some(streamed.reasoning));

            let tool_messages = self
                .execute_tool_calls(dispatch, &tool_calls, scope, turn)
                .await?;
            conversation.push(pending_tail);
            conversation.extend(tool_messages);
        }

        let state = TurnState::BudgetExhausted;
        tracing::warn!(
            ?state,
            max_iterations = self.limits.max_iterations,
            "iteration budget exhausted before a clean stop"
        );
        Ok(TurnOutcome {
            answer: partial_answer,
            status: TurnStatus::BudgetExhausted,
            turns: self.limits.max_iterations,
        })
    }
}

/// Per-prompt routing: where fragments go and which files ride along with
/// each tool job.
pub(crate) struct PromptScope<'a> {
    pub(crate) session_id: &'a str,
    pub(crate) side_inputs: &'a [SideInput],
    pub(crate) regions: ResponseRegions,
    pub(crate) sink: &'a RenderSender,
    pub(crate) cancellation: &'a CancellationToken,
}

impl PromptScope<'_> {
    pub(crate) fn emit(&self, kind: FragmentKind, text: impl Into<String>) {
        // A closed sink means nobody is rendering; the turn still completes.
        let _ = self.sink.send(self.regions.fragment(kind, text));
    }

    pub(crate) fn job_for(&self, batch: u64, tool_call: &ToolCall) -> ToolExecutionJob {
        ToolExecutionJob {
            batch,
            tool_call: tool_call.clone(),
            side_inputs: self.side_inputs.to_vec(),
            session_id: self.session_id.to_owned(),
        }
    }
}
