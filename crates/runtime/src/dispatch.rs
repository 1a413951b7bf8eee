use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use types::{RuntimeError, SideInput, ToolCall, ToolError, ToolExecutor, ToolInvocation};

pub const TOOL_ERROR_PREFIX: &str = "Error executing tool: ";

/// Producer side of a bounded FIFO whose submitters can wait for every
/// enqueued item to be marked done.
#[derive(Debug)]
pub struct JoinableQueue<T> {
    sender: mpsc::Sender<T>,
    unfinished: Arc<watch::Sender<usize>>,
}

impl<T> Clone for JoinableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            unfinished: Arc::clone(&self.unfinished),
        }
    }
}

/// Consumer side of a [`JoinableQueue`].
#[derive(Debug)]
pub struct QueueConsumer<T> {
    receiver: mpsc::Receiver<T>,
    unfinished: Arc<watch::Sender<usize>>,
}

impl<T> JoinableQueue<T> {
    pub fn bounded(capacity: usize) -> (Self, QueueConsumer<T>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (unfinished, _) = watch::channel(0_usize);
        let unfinished = Arc::new(unfinished);
        (
            Self {
                sender,
                unfinished: Arc::clone(&unfinished),
            },
            QueueConsumer {
                receiver,
                unfinished,
            },
        )
    }

    /// Enqueue a tracked item. The unfinished count is raised before the
    /// item becomes visible, so `join` can never observe it as done early.
    pub async fn put(&self, item: T) -> Result<(), RuntimeError> {
        self.unfinished.send_modify(|count| *count += 1);
        if self.sender.send(item).await.is_err() {
            decrement(&self.unfinished);
            return Err(RuntimeError::WorkerStopped);
        }
        Ok(())
    }

    /// Enqueue an item that is never marked done, such as a shutdown signal.
    pub async fn put_untracked(&self, item: T) -> Result<(), RuntimeError> {
        self.sender
            .send(item)
            .await
            .map_err(|_| RuntimeError::WorkerStopped)
    }

    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Wait until every tracked item has been marked done.
    pub async fn join(&self) {
        let mut watcher = self.unfinished.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = watcher.wait_for(|count| *count == 0).await;
    }
}

impl<T> QueueConsumer<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn task_done(&self) {
        decrement(&self.unfinished);
    }
}

fn decrement(unfinished: &watch::Sender<usize>) {
    unfinished.send_modify(|count| {
        if *count == 0 {
            tracing::warn!("task_done called more times than items were put");
        } else {
            *count -= 1;
        }
    });
}

/// Highest batch id whose queued jobs must not start. Batch ids start at 1
/// and only grow within a session, so marking one batch covers every
/// earlier one.
#[derive(Debug, Clone, Default)]
pub struct CancelledBatches(Arc<AtomicU64>);

impl CancelledBatches {
    pub fn cancel_through(&self, batch: u64) {
        self.0.fetch_max(batch, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self, batch: u64) -> bool {
        batch <= self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionJob {
    /// Identifies the prompt batch the job belongs to.
    pub batch: u64,
    pub tool_call: ToolCall,
    pub side_inputs: Vec<SideInput>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecutionResult {
    pub batch: u64,
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug)]
pub enum DispatchMessage {
    Job(ToolExecutionJob),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing,
    PublishResult,
    Stopped,
}

/// Consume jobs one at a time until `Shutdown`, a closed queue, or
/// cancellation. Every started job yields exactly one published result;
/// jobs of a cancelled batch are marked done without running.
pub async fn run_dispatch_worker(
    mut calls: QueueConsumer<DispatchMessage>,
    results: JoinableQueue<ToolExecutionResult>,
    executor: Arc<dyn ToolExecutor>,
    job_timeout: Duration,
    cancelled: CancelledBatches,
    shutdown: CancellationToken,
) {
    loop {
        let state = WorkerState::Idle;
        tracing::trace!(?state, "dispatch worker waiting for a job");
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            message = calls.recv() => message,
        };
        let job = match message {
            Some(DispatchMessage::Job(job)) => job,
            Some(DispatchMessage::Shutdown) | None => break,
        };
        if cancelled.is_cancelled(job.batch) {
            tracing::debug!(
                batch = job.batch,
                tool_call_id = %job.tool_call.id,
                "skipping job from a cancelled batch"
            );
            calls.task_done();
            continue;
        }

        let state = WorkerState::Executing;
        tracing::debug!(
            ?state,
            tool = %job.tool_call.name,
            tool_call_id = %job.tool_call.id,
            session_id = %job.session_id,
            "executing tool job"
        );
        let (result, overrun) = execute_job(&executor, job, job_timeout).await;

        let state = WorkerState::PublishResult;
        tracing::debug!(
            ?state,
            tool_call_id = %result.tool_call_id,
            is_error = result.is_error,
            "publishing tool result"
        );
        let published = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(RuntimeError::Cancelled),
            published = results.put(result) => published,
        };
        calls.task_done();
        if published.is_err() {
            tracing::debug!("result queue unavailable; stopping dispatch worker");
            break;
        }

        // A blocking call cannot be aborted. The next job waits for it so
        // executions never overlap.
        if let Some(overrun) = overrun {
            let state = WorkerState::Executing;
            tracing::debug!(?state, "waiting for timed-out tool call to return");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = overrun => {}
            }
        }
    }
    let state = WorkerState::Stopped;
    tracing::debug!(?state, "dispatch worker stopped");
}

/// Run one job. On timeout the still-running blocking task is handed back
/// alongside the error result.
async fn execute_job(
    executor: &Arc<dyn ToolExecutor>,
    job: ToolExecutionJob,
    job_timeout: Duration,
) -> (ToolExecutionResult, Option<JoinHandle<Result<String, ToolError>>>) {
    let ToolExecutionJob {
        batch,
        tool_call,
        side_inputs,
        session_id,
    } = job;
    let ToolCall {
        id: tool_call_id,
        name: tool_name,
        arguments,
    } = tool_call;

    let mut overrun = None;
    let outcome = match tools::decode_arguments(&tool_name, &arguments) {
        Ok(arguments) => {
            let executor = Arc::clone(executor);
            let invocation = ToolInvocation {
                name: tool_name.clone(),
                arguments,
                side_inputs,
                session_id,
            };
            let mut task = tokio::task::spawn_blocking(move || {
                executor
                    .execute(&invocation)
                    .and_then(|output| tools::render_tool_content(&output))
            });
            let waited = tokio::time::timeout(job_timeout, &mut task).await;
            match waited {
                Ok(Ok(outcome)) => outcome.map_err(|error| error.to_string()),
                Ok(Err(join_error)) => Err(format!("tool task failed: {join_error}")),
                Err(_) => {
                    overrun = Some(task);
                    Err(ToolError::TimedOut {
                        tool: tool_name.clone(),
                        timeout: job_timeout,
                    }
                    .to_string())
                }
            }
        }
        Err(error) => Err(error.to_string()),
    };

    let result = match outcome {
        Ok(content) => ToolExecutionResult {
            batch,
            tool_call_id,
            tool_name,
            content,
            is_error: false,
        },
        Err(err) => {
            tracing::warn!(
                %err,
                tool = %tool_name,
                tool_call_id = %tool_call_id,
                "tool execution failed, injecting error for self-correction"
            );
            ToolExecutionResult {
                batch,
                tool_call_id,
                tool_name,
                content: format!("{TOOL_ERROR_PREFIX}{err}"),
                is_error: true,
            }
        }
    };
    (result, overrun)
}

/// The loop-facing half of a session's call and result queues.
pub struct ToolDispatchQueue {
    calls: JoinableQueue<DispatchMessage>,
    results: QueueConsumer<ToolExecutionResult>,
    cancelled: CancelledBatches,
    next_batch: u64,
}

impl ToolDispatchQueue {
    /// Build both queues and the worker future that serves them. The caller
    /// decides where the worker runs.
    pub fn new(
        capacity: usize,
        executor: Arc<dyn ToolExecutor>,
        job_timeout: Duration,
        shutdown: CancellationToken,
    ) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let (calls, call_consumer) = JoinableQueue::bounded(capacity);
        let (results, result_consumer) = JoinableQueue::bounded(capacity);
        let cancelled = CancelledBatches::default();
        let worker = run_dispatch_worker(
            call_consumer,
            results,
            executor,
            job_timeout,
            cancelled.clone(),
            shutdown,
        );
        (
            Self {
                calls,
                results: result_consumer,
                cancelled,
                next_batch: 0,
            },
            worker,
        )
    }

    pub fn next_batch_id(&mut self) -> u64 {
        self.next_batch += 1;
        self.next_batch
    }

    /// Enqueue a batch, wait for all of it, and return its results in
    /// completion order. Results left over from earlier batches are dropped.
    ///
    /// On cancellation the batch's jobs that have not started yet are
    /// skipped by the worker; a job already running still finishes and its
    /// result is left for [`Self::drain_stale`].
    pub async fn dispatch_batch(
        &mut self,
        jobs: Vec<ToolExecutionJob>,
        cancellation: &CancellationToken,
    ) -> Result<Vec<ToolExecutionResult>, RuntimeError> {
        let batch = jobs.first().map(|job| job.batch);
        let expected = jobs.len();
        let calls = &self.calls;
        let results = &mut self.results;
        let cancelled = &self.cancelled;
        let mut collected = Vec::with_capacity(expected);

        // Results are drained while the batch is submitted so a full result
        // queue cannot stall the worker.
        let submit = async {
            for job in jobs {
                calls.put(DispatchMessage::Job(job)).await?;
            }
            calls.join().await;
            Ok::<(), RuntimeError>(())
        };
        tokio::pin!(submit);

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    if let Some(batch) = batch {
                        cancelled.cancel_through(batch);
                    }
                    return Err(RuntimeError::Cancelled);
                }
                submitted = &mut submit => {
                    submitted?;
                    break;
                }
                received = results.recv() => match received {
                    Some(result) => {
                        results.task_done();
                        collect_result(&mut collected, batch, result);
                    }
                    None => return Err(RuntimeError::WorkerStopped),
                },
            }
        }

        // Every result is published before its job is marked done.
        while let Some(result) = results.try_recv() {
            results.task_done();
            collect_result(&mut collected, batch, result);
        }
        if collected.len() != expected {
            tracing::warn!(
                expected,
                received = collected.len(),
                "tool batch finished with missing results"
            );
        }
        Ok(collected)
    }

    /// Drop results left behind by an interrupted batch.
    pub fn drain_stale(&mut self) -> usize {
        let mut drained = 0;
        while self.results.try_recv().is_some() {
            self.results.task_done();
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(drained, "drained stale tool results");
        }
        drained
    }

    /// Send `Shutdown` and wait for `worker` to exit. Queued jobs are
    /// skipped, and results published meanwhile are drained so the worker
    /// never blocks on a full result queue.
    pub(crate) async fn shutdown(&mut self, mut worker: JoinHandle<()>) -> Result<(), JoinError> {
        self.cancelled.cancel_through(u64::MAX);
        let results = &mut self.results;
        let send = self.calls.put_untracked(DispatchMessage::Shutdown);
        tokio::pin!(send);
        let mut sending = true;
        let mut results_open = true;
        let mut drained = 0_usize;

        let joined = loop {
            tokio::select! {
                joined = &mut worker => break joined,
                sent = &mut send, if sending => {
                    sending = false;
                    if sent.is_err() {
                        tracing::debug!("dispatch worker already stopped");
                    }
                }
                received = results.recv(), if results_open => match received {
                    Some(_) => {
                        results.task_done();
                        drained += 1;
                    }
                    None => results_open = false,
                },
            }
        };
        if drained > 0 {
            tracing::debug!(drained, "drained tool results during shutdown");
        }
        joined
    }
}

fn collect_result(
    collected: &mut Vec<ToolExecutionResult>,
    batch: Option<u64>,
    result: ToolExecutionResult,
) {
    if Some(result.batch) == batch {
        collected.push(result);
    } else {
        tracing::debug!(
            batch = result.batch,
            tool_call_id = %result.tool_call_id,
            "dropping tool result from an earlier batch"
        );
    }
}
