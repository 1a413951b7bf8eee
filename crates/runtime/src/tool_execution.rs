use super::*;

impl AgentRuntime {
    /// Queue one job per call, wait for the whole batch and turn the results
    /// into tool messages in completion order.
    pub(crate) async fn execute_tool_calls(
        &self,
        dispatch: &mut ToolDispatchQueue,
        tool_calls: &[ToolCall],
        scope: &PromptScope<'_>,
        turn: usize,
    ) -> Result<Vec<Message>, RuntimeError> {
        let batch = dispatch.next_batch_id();
        let jobs = tool_calls
            .iter()
            .map(|tool_call| {
                scope.emit(
                    FragmentKind::ToolStatus,
                    format!("[{} call in queue.]", tool_call.name),
                );
                scope.job_for(batch, tool_call)
            })
            .collect::<Vec<_>>();

        let state = TurnState::Dispatching;
        tracing::debug!(turn, ?state, batch, jobs = jobs.len(), "dispatching tool calls");
        let results = dispatch.dispatch_batch(jobs, scope.cancellation).await?;

        let state = TurnState::AwaitingResults;
        tracing::debug!(turn, ?state, results = results.len(), "tool batch complete");
        Ok(results
            .into_iter()
            .map(|result| {
                scope.emit(FragmentKind::ToolStatus, status_line(&result));
                Message::tool_result(result.tool_call_id, result.content)
            })
            .collect())
    }
}

fn status_line(result: &ToolExecutionResult) -> String {
    if result.is_error {
        format!("[{} call failed.]", result.tool_name)
    } else {
        format!("[{} call finished.]", result.tool_name)
    }
}
