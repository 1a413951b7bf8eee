use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use types::{
    FragmentKind, Message, MessageRole, RenderSender, ResponseRegions, RuntimeError, UserPrompt,
};

use crate::{AgentRuntime, PromptScope, ToolDispatchQueue, TurnOutcome};

/// One conversation with its own call/result queues and dispatch worker.
///
/// Sessions never share queues, so a cancelled prompt in one session cannot
/// leak results into another.
pub struct AgentSession {
    session_id: String,
    runtime: Arc<AgentRuntime>,
    conversation: Vec<Message>,
    dispatch: ToolDispatchQueue,
    worker: Option<JoinHandle<()>>,
    worker_shutdown: CancellationToken,
}

impl AgentSession {
    pub(crate) fn new(runtime: Arc<AgentRuntime>) -> Result<Self, RuntimeError> {
        runtime.validate_guard_preconditions()?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let worker_shutdown = CancellationToken::new();
        let limits = runtime.limits();
        let (dispatch, worker) = ToolDispatchQueue::new(
            limits.dispatch_queue_capacity,
            Arc::clone(runtime.executor()),
            limits.tool_timeout,
            worker_shutdown.clone(),
        );
        let worker = tokio::spawn(worker);
        tracing::info!(session_id = %session_id, "agent session started");
        Ok(Self {
            session_id,
            runtime,
            conversation: Vec::new(),
            dispatch,
            worker: Some(worker),
            worker_shutdown,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Committed history. Never contains an assistant tool-call message
    /// without its tool results.
    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    /// Run one user prompt, rendering into `regions` through `sink`.
    ///
    /// On any error the conversation is restored to what it was before the
    /// prompt. Errors other than cancellation are also rendered as an
    /// `Error` fragment.
    pub async fn run_prompt(
        &mut self,
        prompt: UserPrompt,
        regions: ResponseRegions,
        sink: &RenderSender,
        cancellation: &CancellationToken,
    ) -> Result<TurnOutcome, RuntimeError> {
        if self.worker.as_ref().is_none_or(JoinHandle::is_finished) {
            return Err(RuntimeError::WorkerStopped);
        }
        self.dispatch.drain_stale();

        let has_system = self
            .conversation
            .iter()
            .any(|message| message.role == MessageRole::System);
        if !has_system {
            self.conversation.insert(
                0,
                Message::system(self.runtime.system_prompt_for(&prompt.attachments)),
            );
        }
        let checkpoint = self.conversation.len();
        self.conversation.push(prompt.to_message());

        let scope = PromptScope {
            session_id: &self.session_id,
            side_inputs: &prompt.attachments,
            regions,
            sink,
            cancellation,
        };
        let outcome = self
            .runtime
            .run_prompt_turns(&mut self.conversation, &mut self.dispatch, &scope)
            .await;

        match outcome {
            Ok(outcome) => {
                tracing::info!(
                    session_id = %self.session_id,
                    turns = outcome.turns,
                    status = ?outcome.status,
                    "prompt finished"
                );
                Ok(outcome)
            }
            Err(error) => {
                self.conversation.truncate(checkpoint);
                if matches!(error, RuntimeError::Cancelled) {
                    tracing::debug!(session_id = %self.session_id, "prompt cancelled");
                } else {
                    tracing::warn!(session_id = %self.session_id, %error, "prompt failed");
                    scope.emit(FragmentKind::Error, format!("[Error]: {error}"));
                }
                Err(error)
            }
        }
    }

    /// Stop the dispatch worker and release the executor's per-session
    /// resources. Jobs still queued from a cancelled batch are skipped.
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take()
            && let Err(error) = self.dispatch.shutdown(worker).await
        {
            tracing::warn!(session_id = %self.session_id, %error, "dispatch worker failed");
        }

        let executor = Arc::clone(self.runtime.executor());
        let session_id = self.session_id.clone();
        if let Err(error) =
            tokio::task::spawn_blocking(move || executor.release_session(&session_id)).await
        {
            tracing::warn!(session_id = %self.session_id, %error, "failed to release session");
        }
        tracing::info!(session_id = %self.session_id, "agent session closed");
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.worker_shutdown.cancel();
    }
}
