use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mockall::mock;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use types::{
    Context, ExecutionOutput, FinishReason, FragmentKind, FunctionDecl, Message, MessageRole,
    ModelId, Provider, ProviderError, ProviderId, ProviderStream, RenderFragment,
    ResponseRegions, RuntimeError, SideInput, StreamEvent, ToolCall, ToolCallDelta, ToolError,
    ToolExecutor, ToolInvocation, UserPrompt,
};

use super::{
    AgentRuntime, JoinableQueue, RuntimeLimits, TOOL_ERROR_PREFIX, ToolCallAccumulator,
    ToolDispatchQueue, ToolExecutionJob, TurnStatus,
};

mock! {
    Executor {}
    impl ToolExecutor for Executor {
        fn definitions(&self) -> Vec<FunctionDecl>;
        fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError>;
        fn release_session(&self, session_id: &str);
    }
}

#[derive(Debug)]
enum ProviderStep {
    Stream(Vec<Result<StreamEvent, ProviderError>>),
    StreamFailure(ProviderError),
    /// A stream that stays open and never yields.
    Silent,
}

struct FakeProvider {
    provider_id: ProviderId,
    steps: Mutex<VecDeque<ProviderStep>>,
    requests: Arc<Mutex<Vec<Context>>>,
    open_streams: Mutex<Vec<mpsc::Sender<Result<StreamEvent, ProviderError>>>>,
}

impl FakeProvider {
    fn new(steps: Vec<ProviderStep>) -> Self {
        Self {
            provider_id: ProviderId::from("fake"),
            steps: Mutex::new(steps.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
            open_streams: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Arc<Mutex<Vec<Context>>> {
        Arc::clone(&self.requests)
    }

    fn next_step(&self) -> ProviderStep {
        self.steps
            .lock()
            .expect("test provider mutex should not be poisoned")
            .pop_front()
            .expect("test provider expected another scripted step")
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    async fn stream(
        &self,
        context: &Context,
        _buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError> {
        self.requests
            .lock()
            .expect("request capture mutex should not be poisoned")
            .push(context.clone());
        match self.next_step() {
            ProviderStep::Stream(items) => {
                let (sender, receiver) = mpsc::channel(items.len().max(1));
                for item in items {
                    sender
                        .try_send(item)
                        .expect("test stream channel should accept scripted item");
                }
                Ok(receiver)
            }
            ProviderStep::StreamFailure(error) => Err(error),
            ProviderStep::Silent => {
                let (sender, receiver) = mpsc::channel(1);
                self.open_streams
                    .lock()
                    .expect("open stream mutex should not be poisoned")
                    .push(sender);
                Ok(receiver)
            }
        }
    }
}

/// Interprets the `code` argument: `fail` errors, `panic` panics,
/// `sleep:<ms>` blocks, anything else is echoed to stdout.
#[derive(Default)]
struct ScriptedExecutor {
    invocations: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedExecutor {
    fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations
            .lock()
            .expect("invocation mutex should not be poisoned")
            .clone()
    }
}

impl ToolExecutor for ScriptedExecutor {
    fn definitions(&self) -> Vec<FunctionDecl> {
        vec![code_tool_decl()]
    }

    fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError> {
        self.invocations
            .lock()
            .expect("invocation mutex should not be poisoned")
            .push(invocation.clone());
        let code = invocation
            .arguments
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if code == "fail" {
            return Err(ToolError::ExecutionFailed {
                tool: invocation.name.clone(),
                message: "kernel died".to_owned(),
            });
        }
        if code == "panic" {
            panic!("executor blew up");
        }
        if let Some(millis) = code.strip_prefix("sleep:") {
            let millis = millis.parse().expect("sleep duration should be numeric");
            std::thread::sleep(Duration::from_millis(millis));
        }
        Ok(stdout(code))
    }
}

/// Delegates to [`ScriptedExecutor`] and records how many calls ran at once.
#[derive(Default)]
struct OverlapTrackingExecutor {
    inner: ScriptedExecutor,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl OverlapTrackingExecutor {
    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl ToolExecutor for OverlapTrackingExecutor {
    fn definitions(&self) -> Vec<FunctionDecl> {
        self.inner.definitions()
    }

    fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionOutput, ToolError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let outcome = self.inner.execute(invocation);
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn code_tool_decl() -> FunctionDecl {
    FunctionDecl::new(
        "run_code_interpreter",
        Some("Run Python code".to_owned()),
        json!({
            "type": "object",
            "required": ["code"],
            "properties": { "code": { "type": "string" } }
        }),
    )
}

fn stdout(text: &str) -> ExecutionOutput {
    ExecutionOutput {
        stdout: Some(text.to_owned()),
        ..ExecutionOutput::default()
    }
}

fn content(text: &str) -> Result<StreamEvent, ProviderError> {
    Ok(StreamEvent::ContentDelta(text.to_owned()))
}

fn reasoning(text: &str) -> Result<StreamEvent, ProviderError> {
    Ok(StreamEvent::ReasoningDelta(text.to_owned()))
}

fn finish(reason: FinishReason) -> Result<StreamEvent, ProviderError> {
    Ok(StreamEvent::TurnFinished(reason))
}

fn tool_delta(
    index: usize,
    id: Option<&str>,
    name: Option<&str>,
    arguments: Option<&str>,
) -> ToolCallDelta {
    ToolCallDelta {
        index,
        id: id.map(str::to_owned),
        name: name.map(str::to_owned),
        arguments: arguments.map(str::to_owned),
    }
}

fn tool_event(delta: ToolCallDelta) -> Result<StreamEvent, ProviderError> {
    Ok(StreamEvent::ToolCallDelta(delta))
}

fn code_call(id: &str, code: &str) -> Vec<Result<StreamEvent, ProviderError>> {
    let arguments = json!({ "code": code }).to_string();
    vec![
        tool_event(tool_delta(
            0,
            Some(id),
            Some("run_code_interpreter"),
            Some(arguments.as_str()),
        )),
        finish(FinishReason::ToolCalls),
    ]
}

fn transport_error(message: &str) -> ProviderError {
    ProviderError::Transport {
        provider: ProviderId::from("fake"),
        message: message.to_owned(),
    }
}

fn test_limits() -> RuntimeLimits {
    RuntimeLimits {
        max_iterations: 4,
        turn_timeout: Duration::from_secs(5),
        tool_timeout: Duration::from_secs(5),
        ..RuntimeLimits::default()
    }
}

fn build_runtime(
    provider: FakeProvider,
    executor: Arc<dyn ToolExecutor>,
    limits: RuntimeLimits,
) -> Arc<AgentRuntime> {
    Arc::new(AgentRuntime::new(
        Box::new(provider),
        executor,
        ModelId::from("test-model"),
        limits,
    ))
}

fn drain_fragments(receiver: &mut mpsc::UnboundedReceiver<RenderFragment>) -> Vec<RenderFragment> {
    let mut fragments = Vec::new();
    while let Ok(fragment) = receiver.try_recv() {
        fragments.push(fragment);
    }
    fragments
}

fn texts_of(fragments: &[RenderFragment], kind: FragmentKind) -> Vec<String> {
    fragments
        .iter()
        .filter(|fragment| fragment.kind == kind)
        .map(|fragment| fragment.text.clone())
        .collect()
}

fn roles(messages: &[Message]) -> Vec<MessageRole> {
    messages.iter().map(|message| message.role).collect()
}

fn frozen_arguments(fragments: &[&str]) -> String {
    let mut accumulator = ToolCallAccumulator::new();
    accumulator.merge(tool_delta(0, Some("call_1"), Some("run"), None));
    for fragment in fragments {
        accumulator.merge(tool_delta(0, None, None, Some(fragment)));
    }
    let calls = accumulator.freeze();
    assert_eq!(calls.len(), 1);
    calls[0].arguments.clone()
}

#[test]
fn accumulator_arguments_survive_every_fragmentation() {
    let arguments = r#"{"code":"import math\nprint(math.pi)  # π ≈ 3.14","n":[1,2,{"k":"}"}]}"#;
    let chars = arguments.char_indices().map(|(index, _)| index).collect::<Vec<_>>();

    for width in 1..=chars.len() {
        let mut fragments = Vec::new();
        let mut start = 0;
        for boundary in chars.iter().copied().skip(width).step_by(width) {
            fragments.push(&arguments[start..boundary]);
            start = boundary;
        }
        fragments.push(&arguments[start..]);
        assert_eq!(frozen_arguments(&fragments), arguments, "width {width}");
    }

    for &split in &chars {
        let fragments = [&arguments[..split], &arguments[split..]];
        assert_eq!(frozen_arguments(&fragments), arguments, "split at {split}");
    }
}

#[test]
fn accumulator_keeps_interleaved_calls_apart_in_index_order() {
    let mut accumulator = ToolCallAccumulator::new();
    accumulator.merge(tool_delta(1, Some("call_b"), Some("get"), None));
    accumulator.merge(tool_delta(0, Some("call_a"), Some("ru"), None));
    accumulator.merge(tool_delta(0, None, Some("n"), Some("{\"x\":")));
    accumulator.merge(tool_delta(1, None, None, Some("{\"y\":2}")));
    accumulator.merge(tool_delta(0, None, None, Some("1}")));
    assert_eq!(accumulator.len(), 2);

    assert_eq!(
        accumulator.freeze(),
        vec![
            ToolCall {
                id: "call_a".to_owned(),
                name: "run".to_owned(),
                arguments: "{\"x\":1}".to_owned(),
            },
            ToolCall {
                id: "call_b".to_owned(),
                name: "get".to_owned(),
                arguments: "{\"y\":2}".to_owned(),
            },
        ]
    );
}

#[test]
fn accumulator_fills_missing_ids_and_empty_arguments() {
    let mut accumulator = ToolCallAccumulator::new();
    accumulator.merge(tool_delta(0, Some(""), Some("run"), Some("  ")));
    accumulator.merge(tool_delta(1, Some("first"), Some("run"), Some("{not json")));
    accumulator.merge(tool_delta(1, Some("second"), None, None));

    let calls = accumulator.freeze();
    assert!(calls[0].id.starts_with("call_"));
    assert_eq!(calls[0].arguments, "{}");
    assert_eq!(calls[1].id, "second");
    assert_eq!(calls[1].arguments, "{not json");
}

#[test]
fn accumulator_discard_reports_dropped_calls() {
    let mut accumulator = ToolCallAccumulator::new();
    assert_eq!(ToolCallAccumulator::new().discard(), 0);
    accumulator.merge(tool_delta(0, Some("call_1"), Some("run"), Some("{\"co")));
    assert_eq!(accumulator.discard(), 1);
}

#[tokio::test]
async fn join_never_returns_before_every_item_is_done() {
    for count in 0..=256_usize {
        let (queue, mut consumer) = JoinableQueue::<usize>::bounded(8);
        let processed = Arc::new(AtomicUsize::new(0));
        let worker_processed = Arc::clone(&processed);
        let worker = tokio::spawn(async move {
            while let Some(_item) = consumer.recv().await {
                tokio::task::yield_now().await;
                worker_processed.fetch_add(1, Ordering::SeqCst);
                consumer.task_done();
            }
        });

        for item in 0..count {
            queue.put(item).await.expect("consumer should be running");
        }
        queue.join().await;
        assert_eq!(processed.load(Ordering::SeqCst), count, "count {count}");
        assert_eq!(queue.unfinished(), 0);

        drop(queue);
        worker.await.expect("consumer task should finish");
    }
}

#[tokio::test]
async fn put_fails_once_the_consumer_is_gone() {
    let (queue, consumer) = JoinableQueue::<u8>::bounded(1);
    drop(consumer);
    assert!(matches!(
        queue.put(1).await,
        Err(RuntimeError::WorkerStopped)
    ));
    assert_eq!(queue.unfinished(), 0);
}

fn job(batch: u64, id: &str, code: &str) -> ToolExecutionJob {
    ToolExecutionJob {
        batch,
        tool_call: ToolCall {
            id: id.to_owned(),
            name: "run_code_interpreter".to_owned(),
            arguments: json!({ "code": code }).to_string(),
        },
        side_inputs: Vec::new(),
        session_id: "session-1".to_owned(),
    }
}

fn spawn_dispatch(
    executor: Arc<dyn ToolExecutor>,
    job_timeout: Duration,
) -> (ToolDispatchQueue, tokio::task::JoinHandle<()>) {
    let (dispatch, worker) =
        ToolDispatchQueue::new(2, executor, job_timeout, CancellationToken::new());
    (dispatch, tokio::spawn(worker))
}

#[tokio::test]
async fn one_failing_job_does_not_affect_its_siblings() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor.clone(), Duration::from_secs(5));
    let jobs = vec![
        job(1, "call_1", "print(1)"),
        job(1, "call_2", "fail"),
        job(1, "call_3", "print(3)"),
    ];

    let results = dispatch
        .dispatch_batch(jobs, &CancellationToken::new())
        .await
        .expect("batch should complete");

    let ids = results
        .iter()
        .map(|result| result.tool_call_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);
    assert!(!results[0].is_error);
    assert!(results[0].content.contains("print(1)"));
    assert!(results[1].is_error);
    assert!(results[1].content.starts_with(TOOL_ERROR_PREFIX));
    assert!(results[1].content.contains("kernel died"));
    assert!(!results[2].is_error);
    assert_eq!(executor.invocations().len(), 3);
}

#[tokio::test]
async fn panics_timeouts_and_bad_arguments_become_error_results() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor.clone(), Duration::from_millis(100));
    let mut malformed = job(1, "call_bad", "");
    malformed.tool_call.arguments = "{\"code\": ".to_owned();
    let jobs = vec![
        job(1, "call_panic", "panic"),
        job(1, "call_slow", "sleep:400"),
        malformed,
        job(1, "call_ok", "print('still alive')"),
    ];

    let results = dispatch
        .dispatch_batch(jobs, &CancellationToken::new())
        .await
        .expect("batch should complete");

    assert_eq!(results.len(), 4);
    assert!(results[0].is_error);
    assert!(results[1].is_error);
    assert!(results[1].content.contains("timed out"));
    assert!(results[2].is_error);
    assert!(results[2].content.contains("raw payload"));
    assert!(!results[3].is_error);
    // The malformed call never reached the executor.
    assert_eq!(executor.invocations().len(), 3);
}

#[tokio::test]
async fn double_encoded_arguments_are_recovered_before_execution() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor.clone(), Duration::from_secs(5));
    let mut double_encoded = job(1, "call_1", "");
    double_encoded.tool_call.arguments =
        serde_json::to_string(&json!({ "code": "print(2)" }).to_string())
            .expect("string should serialize");

    let results = dispatch
        .dispatch_batch(vec![double_encoded], &CancellationToken::new())
        .await
        .expect("batch should complete");

    assert!(!results[0].is_error);
    assert_eq!(
        executor.invocations()[0].arguments.get("code"),
        Some(&json!("print(2)"))
    );
}

#[tokio::test]
async fn cancelled_batch_results_never_leak_into_the_next_batch() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor, Duration::from_secs(5));

    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let cancelled = dispatch
        .dispatch_batch(vec![job(1, "call_old", "sleep:150")], &cancellation)
        .await;
    assert!(matches!(cancelled, Err(RuntimeError::Cancelled)));

    let results = dispatch
        .dispatch_batch(vec![job(2, "call_new", "print(2)")], &CancellationToken::new())
        .await
        .expect("second batch should complete");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_call_id, "call_new");
    assert_eq!(dispatch.drain_stale(), 0);
}

#[tokio::test]
async fn drain_stale_clears_results_of_an_interrupted_batch() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor, Duration::from_secs(5));
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let cancelled = dispatch
        .dispatch_batch(vec![job(1, "call_old", "sleep:80")], &cancellation)
        .await;
    assert!(matches!(cancelled, Err(RuntimeError::Cancelled)));

    // The interrupted job still finishes and publishes its result.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(dispatch.drain_stale(), 1);
    assert_eq!(dispatch.drain_stale(), 0);
}

#[tokio::test]
async fn worker_stops_on_shutdown_message() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, worker) = spawn_dispatch(executor, Duration::from_secs(5));
    tokio::time::timeout(Duration::from_secs(1), dispatch.shutdown(worker))
        .await
        .expect("worker should stop promptly")
        .expect("worker should not panic");
}

#[tokio::test]
async fn queued_jobs_of_a_cancelled_batch_never_start() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor.clone(), Duration::from_secs(5));
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let cancelled = dispatch
        .dispatch_batch(
            vec![
                job(1, "call_1", "sleep:100"),
                job(1, "call_2", "sleep:100"),
                job(1, "call_3", "sleep:100"),
            ],
            &cancellation,
        )
        .await;
    assert!(matches!(cancelled, Err(RuntimeError::Cancelled)));
    assert_eq!(executor.invocations().len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(executor.invocations().len(), 1);
    assert_eq!(dispatch.drain_stale(), 1);

    let results = dispatch
        .dispatch_batch(vec![job(2, "call_next", "print(2)")], &CancellationToken::new())
        .await
        .expect("a later batch should still run");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_call_id, "call_next");
    assert_eq!(executor.invocations().len(), 2);
}

#[tokio::test]
async fn timed_out_call_finishes_before_the_next_job_starts() {
    let executor = Arc::new(OverlapTrackingExecutor::default());
    let (mut dispatch, _worker) = spawn_dispatch(executor.clone(), Duration::from_millis(100));
    let jobs = vec![
        job(1, "call_slow", "sleep:300"),
        job(1, "call_2", "print(2)"),
        job(1, "call_3", "print(3)"),
    ];

    let results = dispatch
        .dispatch_batch(jobs, &CancellationToken::new())
        .await
        .expect("batch should complete");

    assert_eq!(results.len(), 3);
    assert!(results[0].is_error);
    assert!(results[0].content.contains("timed out"));
    assert!(!results[1].is_error);
    assert!(!results[2].is_error);
    assert_eq!(executor.inner.invocations().len(), 3);
    assert_eq!(executor.max_running(), 1);
}

#[tokio::test]
async fn scenario_a_plain_answer_enqueues_no_jobs() {
    let provider = FakeProvider::new(vec![ProviderStep::Stream(vec![
        content("Hello"),
        content(" world"),
        finish(FinishReason::Stop),
    ])]);
    let requests = provider.requests();
    let mut executor = MockExecutor::new();
    executor
        .expect_definitions()
        .returning(|| vec![code_tool_decl()]);
    executor.expect_execute().times(0);
    let runtime = build_runtime(provider, Arc::new(executor), test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, mut fragments) = mpsc::unbounded_channel();

    let outcome = session
        .run_prompt(
            UserPrompt::new("Say hello"),
            ResponseRegions::new("r1"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    assert_eq!(outcome.answer, "Hello world");
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.turns, 1);
    let fragments = drain_fragments(&mut fragments);
    assert_eq!(texts_of(&fragments, FragmentKind::Content), vec!["Hello world"]);
    assert!(fragments.iter().all(|fragment| fragment.region == "content-r1"));
    assert_eq!(
        roles(session.conversation()),
        vec![MessageRole::System, MessageRole::User, MessageRole::Assistant]
    );

    let requests = requests.lock().expect("request mutex should not be poisoned");
    assert_eq!(requests[0].tools, vec![code_tool_decl()]);
    assert_eq!(requests[0].model, ModelId::from("test-model"));
}

#[tokio::test]
async fn scenario_b_interleaved_tool_calls_run_as_one_batch() {
    let provider = FakeProvider::new(vec![
        ProviderStep::Stream(vec![
            tool_event(tool_delta(0, Some("call_run"), Some("run"), None)),
            tool_event(tool_delta(1, Some("call_get"), Some("get"), None)),
            tool_event(tool_delta(0, None, None, Some("{\"code\":"))),
            tool_event(tool_delta(1, None, None, Some("{\"code\":\"get()\"}"))),
            tool_event(tool_delta(0, None, None, Some("\"run()\"}"))),
            finish(FinishReason::ToolCalls),
        ]),
        ProviderStep::Stream(vec![content("Both done."), finish(FinishReason::Stop)]),
    ]);
    let requests = provider.requests();
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor.clone(), test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, mut fragments) = mpsc::unbounded_channel();

    let outcome = session
        .run_prompt(
            UserPrompt::new("Run both"),
            ResponseRegions::new("r2"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    assert_eq!(outcome.answer, "Both done.");
    assert_eq!(outcome.turns, 2);
    let invocations = executor.invocations();
    let names = invocations
        .iter()
        .map(|invocation| invocation.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["run", "get"]);
    assert_eq!(invocations[0].arguments.get("code"), Some(&json!("run()")));
    assert_eq!(invocations[0].session_id, session.session_id());

    let conversation = session.conversation();
    assert_eq!(
        roles(conversation),
        vec![
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::Assistant,
        ]
    );
    assert_eq!(conversation[2].tool_calls.len(), 2);
    assert_eq!(conversation[2].content, None);
    assert_eq!(conversation[3].tool_call_id.as_deref(), Some("call_run"));
    assert_eq!(conversation[4].tool_call_id.as_deref(), Some("call_get"));

    let fragments = drain_fragments(&mut fragments);
    assert_eq!(
        texts_of(&fragments, FragmentKind::ToolStatus),
        vec![
            "[run call in queue.]",
            "[get call in queue.]",
            "[run call finished.]",
            "[get call finished.]",
        ]
    );
    assert!(
        fragments
            .iter()
            .filter(|fragment| fragment.kind == FragmentKind::ToolStatus)
            .all(|fragment| fragment.region == "tool-r2")
    );

    // The second request carries the committed tool turn.
    let requests = requests.lock().expect("request mutex should not be poisoned");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 5);
}

#[tokio::test]
async fn scenario_c_fenced_block_is_rendered_only_once_closed() {
    let provider = FakeProvider::new(vec![ProviderStep::Stream(vec![
        content("```py\nprint(1)"),
        content("\n```\n"),
        finish(FinishReason::Stop),
    ])]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, mut fragments) = mpsc::unbounded_channel();

    session
        .run_prompt(
            UserPrompt::new("code please"),
            ResponseRegions::new("r3"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    let fragments = drain_fragments(&mut fragments);
    assert_eq!(
        texts_of(&fragments, FragmentKind::Content),
        vec!["```py\nprint(1)\n```\n"]
    );
}

#[tokio::test]
async fn scenario_d_failed_tool_is_reported_to_the_model() {
    let mut first_turn = Vec::new();
    for (index, code) in ["print(1)", "fail", "print(3)"].into_iter().enumerate() {
        let arguments = json!({ "code": code }).to_string();
        first_turn.push(tool_event(tool_delta(
            index,
            Some(format!("call_{index}").as_str()),
            Some("run_code_interpreter"),
            Some(arguments.as_str()),
        )));
    }
    first_turn.push(finish(FinishReason::ToolCalls));
    let provider = FakeProvider::new(vec![
        ProviderStep::Stream(first_turn),
        ProviderStep::Stream(vec![content("Recovered."), finish(FinishReason::Stop)]),
    ]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, mut fragments) = mpsc::unbounded_channel();

    let outcome = session
        .run_prompt(
            UserPrompt::new("three things"),
            ResponseRegions::new("r4"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    assert_eq!(outcome.status, TurnStatus::Completed);
    let tool_messages = session
        .conversation()
        .iter()
        .filter(|message| message.role == MessageRole::Tool)
        .collect::<Vec<_>>();
    assert_eq!(tool_messages.len(), 3);
    assert!(
        tool_messages[1]
            .content
            .as_deref()
            .is_some_and(|content| content.starts_with(TOOL_ERROR_PREFIX))
    );
    assert!(
        tool_messages[2]
            .content
            .as_deref()
            .is_some_and(|content| content.contains("print(3)"))
    );
    assert!(
        texts_of(&drain_fragments(&mut fragments), FragmentKind::ToolStatus)
            .contains(&"[run_code_interpreter call failed.]".to_owned())
    );
}

#[tokio::test]
async fn loop_stops_at_max_iterations_with_degraded_answer() {
    let mut steps = Vec::new();
    for turn in 0..3 {
        let mut events = vec![content(&format!("attempt {turn}"))];
        events.extend(code_call(&format!("call_{turn}"), "print(0)"));
        steps.push(ProviderStep::Stream(events));
    }
    let provider = FakeProvider::new(steps);
    let requests = provider.requests();
    let executor = Arc::new(ScriptedExecutor::default());
    let limits = RuntimeLimits {
        max_iterations: 3,
        ..test_limits()
    };
    let runtime = build_runtime(provider, executor.clone(), limits);
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();

    let outcome = session
        .run_prompt(
            UserPrompt::new("loop forever"),
            ResponseRegions::new("r5"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("budget exhaustion is not an error");

    assert_eq!(outcome.status, TurnStatus::BudgetExhausted);
    assert_eq!(outcome.turns, 3);
    assert_eq!(outcome.answer, "attempt 2");
    assert_eq!(
        requests
            .lock()
            .expect("request mutex should not be poisoned")
            .len(),
        3
    );
    assert_eq!(executor.invocations().len(), 3);
    // Every held tool-call message was committed with its result.
    let conversation = session.conversation();
    let assistant_calls = conversation
        .iter()
        .filter(|message| !message.tool_calls.is_empty())
        .count();
    let tool_results = conversation
        .iter()
        .filter(|message| message.role == MessageRole::Tool)
        .count();
    assert_eq!((assistant_calls, tool_results), (3, 3));
}

#[tokio::test]
async fn clean_stop_discards_incomplete_tool_calls() {
    let provider = FakeProvider::new(vec![ProviderStep::Stream(vec![
        content("No tools needed.\n"),
        tool_event(tool_delta(0, Some("call_1"), Some("run"), Some("{\"co"))),
        finish(FinishReason::Stop),
    ])]);
    let mut executor = MockExecutor::new();
    executor.expect_definitions().returning(Vec::new);
    executor.expect_execute().times(0);
    let runtime = build_runtime(provider, Arc::new(executor), test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();

    let outcome = session
        .run_prompt(
            UserPrompt::new("hi"),
            ResponseRegions::new("r6"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    assert_eq!(outcome.answer, "No tools needed.\n");
    assert!(session.conversation().iter().all(|message| message.tool_calls.is_empty()));
}

#[tokio::test]
async fn stream_without_finish_reason_is_treated_as_stop() {
    let provider = FakeProvider::new(vec![ProviderStep::Stream(vec![content("partial")])]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();

    let outcome = session
        .run_prompt(
            UserPrompt::new("hi"),
            ResponseRegions::new("r7"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    assert_eq!(outcome.answer, "partial");
    assert_eq!(outcome.status, TurnStatus::Completed);
}

#[tokio::test]
async fn reasoning_is_rendered_only_when_enabled() {
    for show_reasoning in [false, true] {
        let provider = FakeProvider::new(vec![ProviderStep::Stream(vec![
            reasoning("thinking..."),
            content("answer"),
            finish(FinishReason::Stop),
        ])]);
        let executor = Arc::new(ScriptedExecutor::default());
        let limits = RuntimeLimits {
            show_reasoning,
            ..test_limits()
        };
        let runtime = build_runtime(provider, executor, limits);
        let mut session = runtime.start_session().expect("limits are valid");
        let (sink, mut fragments) = mpsc::unbounded_channel();

        session
            .run_prompt(
                UserPrompt::new("think"),
                ResponseRegions::new("r8"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .expect("prompt should complete");

        let fragments = drain_fragments(&mut fragments);
        let reasoning_fragments = fragments
            .iter()
            .filter(|fragment| fragment.kind == FragmentKind::Reasoning)
            .collect::<Vec<_>>();
        if show_reasoning {
            assert_eq!(reasoning_fragments.len(), 1);
            assert_eq!(reasoning_fragments[0].region, "reasoning-r8");
        } else {
            assert!(reasoning_fragments.is_empty());
        }
        assert_eq!(
            session.conversation().last().and_then(|m| m.reasoning.as_deref()),
            Some("thinking...")
        );
    }
}

#[tokio::test]
async fn transport_error_rolls_back_the_prompt_and_renders_an_error() {
    let provider = FakeProvider::new(vec![
        ProviderStep::Stream(vec![content("Hal"), Err(transport_error("connection reset"))]),
        ProviderStep::Stream(vec![content("Second try."), finish(FinishReason::Stop)]),
    ]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, mut fragments) = mpsc::unbounded_channel();

    let error = session
        .run_prompt(
            UserPrompt::new("first"),
            ResponseRegions::new("r9"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("transport failure should surface");
    assert!(matches!(
        error,
        RuntimeError::Provider(ProviderError::Transport { .. })
    ));
    assert_eq!(roles(session.conversation()), vec![MessageRole::System]);
    let errors = texts_of(&drain_fragments(&mut fragments), FragmentKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("[Error]: "));
    assert!(errors[0].contains("connection reset"));

    let outcome = session
        .run_prompt(
            UserPrompt::new("again"),
            ResponseRegions::new("r10"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("session should stay usable");
    assert_eq!(outcome.answer, "Second try.");
    assert_eq!(
        roles(session.conversation()),
        vec![MessageRole::System, MessageRole::User, MessageRole::Assistant]
    );
}

#[tokio::test]
async fn stream_setup_failure_is_returned_to_the_caller() {
    let provider = FakeProvider::new(vec![ProviderStep::StreamFailure(
        ProviderError::HttpStatus {
            provider: ProviderId::from("fake"),
            status: 401,
            message: "bad key".to_owned(),
        },
    )]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();

    let error = session
        .run_prompt(
            UserPrompt::new("hi"),
            ResponseRegions::new("r11"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("setup failure should surface");
    assert!(matches!(
        error,
        RuntimeError::Provider(ProviderError::HttpStatus { status: 401, .. })
    ));
}

#[tokio::test]
async fn cancellation_aborts_a_silent_stream_without_touching_history() {
    let provider = FakeProvider::new(vec![ProviderStep::Silent]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, mut fragments) = mpsc::unbounded_channel();
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let error = session
        .run_prompt(
            UserPrompt::new("never answered"),
            ResponseRegions::new("r12"),
            &sink,
            &cancellation,
        )
        .await
        .expect_err("cancellation should abort the prompt");

    assert!(matches!(error, RuntimeError::Cancelled));
    assert_eq!(roles(session.conversation()), vec![MessageRole::System]);
    assert!(texts_of(&drain_fragments(&mut fragments), FragmentKind::Error).is_empty());
}

#[tokio::test]
async fn cancellation_during_tool_batch_discards_the_pending_tail() {
    let provider = FakeProvider::new(vec![ProviderStep::Stream(code_call(
        "call_slow",
        "sleep:200",
    ))]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let error = session
        .run_prompt(
            UserPrompt::new("slow tool"),
            ResponseRegions::new("r13"),
            &sink,
            &cancellation,
        )
        .await
        .expect_err("cancellation should abort the prompt");

    assert!(matches!(error, RuntimeError::Cancelled));
    assert!(
        session
            .conversation()
            .iter()
            .all(|message| message.tool_calls.is_empty() && message.role != MessageRole::Tool)
    );
}

#[tokio::test]
async fn silent_stream_times_out() {
    let provider = FakeProvider::new(vec![ProviderStep::Silent]);
    let executor = Arc::new(ScriptedExecutor::default());
    let limits = RuntimeLimits {
        turn_timeout: Duration::from_millis(50),
        ..test_limits()
    };
    let runtime = build_runtime(provider, executor, limits);
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();

    let error = session
        .run_prompt(
            UserPrompt::new("hello?"),
            ResponseRegions::new("r14"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("silence should time out");
    assert!(matches!(error, RuntimeError::TurnTimedOut(timeout) if timeout == Duration::from_millis(50)));
}

#[tokio::test]
async fn invalid_limits_are_rejected_before_a_session_starts() {
    let executor = Arc::new(ScriptedExecutor::default());
    for (limits, field) in [
        (
            RuntimeLimits {
                max_iterations: 0,
                ..test_limits()
            },
            "max_iterations",
        ),
        (
            RuntimeLimits {
                turn_timeout: Duration::ZERO,
                ..test_limits()
            },
            "turn_timeout",
        ),
        (
            RuntimeLimits {
                dispatch_queue_capacity: 0,
                ..test_limits()
            },
            "dispatch_queue_capacity",
        ),
    ] {
        let runtime = build_runtime(FakeProvider::new(Vec::new()), executor.clone(), limits);
        assert!(matches!(
            runtime.start_session(),
            Err(RuntimeError::InvalidLimit { field: rejected }) if rejected == field
        ));
    }
}

#[tokio::test]
async fn attachments_reach_the_prompt_the_system_message_and_every_job() {
    let provider = FakeProvider::new(vec![
        ProviderStep::Stream(code_call("call_1", "print(open('data.csv').read())")),
        ProviderStep::Stream(vec![content("Read it."), finish(FinishReason::Stop)]),
    ]);
    let requests = provider.requests();
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor.clone(), test_limits());
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();
    let attachment = SideInput::new("uploads/data.csv", b"a,b\n1,2\n".to_vec());

    session
        .run_prompt(
            UserPrompt::new("summarize").with_attachments(vec![attachment.clone()]),
            ResponseRegions::new("r15"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    let requests = requests.lock().expect("request mutex should not be poisoned");
    let first = &requests[0].messages;
    assert!(
        first[0]
            .content
            .as_deref()
            .is_some_and(|prompt| prompt.contains("- data.csv"))
    );
    assert_eq!(
        first[1].content.as_deref(),
        Some("summarize\nAttached file: uploads/data.csv")
    );
    assert_eq!(executor.invocations()[0].side_inputs, vec![attachment]);
}

#[test]
fn custom_system_prompt_fills_the_files_placeholder() {
    let runtime = AgentRuntime::new(
        Box::new(FakeProvider::new(Vec::new())),
        Arc::new(ScriptedExecutor::default()),
        ModelId::from("test-model"),
        RuntimeLimits::default(),
    )
    .with_system_prompt("Files:\n{files}\nBe brief.".to_owned());

    assert_eq!(
        runtime.system_prompt_for(&[]),
        "Files:\n(none)\nBe brief."
    );
    assert_eq!(
        runtime.system_prompt_for(&[
            SideInput::new("a/x.txt", Vec::new()),
            SideInput::new("y.png", Vec::new()),
        ]),
        "Files:\n- x.txt\n- y.png\nBe brief."
    );
}

#[tokio::test]
async fn shutdown_stops_the_worker_and_releases_the_session() {
    let mut executor = MockExecutor::new();
    executor.expect_definitions().returning(Vec::new);
    let released = Arc::new(Mutex::new(Vec::<String>::new()));
    let released_capture = Arc::clone(&released);
    executor
        .expect_release_session()
        .times(1)
        .returning(move |session_id| {
            released_capture
                .lock()
                .expect("release mutex should not be poisoned")
                .push(session_id.to_owned());
        });
    let runtime = build_runtime(FakeProvider::new(Vec::new()), Arc::new(executor), test_limits());
    let session = runtime.start_session().expect("limits are valid");
    let session_id = session.session_id().to_owned();

    session.shutdown().await;

    assert_eq!(
        *released.lock().expect("release mutex should not be poisoned"),
        vec![session_id]
    );
}

#[tokio::test]
async fn shutdown_after_a_cancelled_multi_call_batch_completes() {
    let mut events = (0..3)
        .map(|index| {
            let id = format!("call_{index}");
            let arguments = json!({ "code": "sleep:100" }).to_string();
            tool_event(tool_delta(
                index,
                Some(id.as_str()),
                Some("run_code_interpreter"),
                Some(arguments.as_str()),
            ))
        })
        .collect::<Vec<_>>();
    events.push(finish(FinishReason::ToolCalls));
    let provider = FakeProvider::new(vec![ProviderStep::Stream(events)]);
    let executor = Arc::new(ScriptedExecutor::default());
    let limits = RuntimeLimits {
        dispatch_queue_capacity: 1,
        ..test_limits()
    };
    let runtime = build_runtime(provider, executor.clone(), limits);
    let mut session = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let error = session
        .run_prompt(
            UserPrompt::new("three slow tools"),
            ResponseRegions::new("r-shutdown"),
            &sink,
            &cancellation,
        )
        .await
        .expect_err("cancellation should abort the prompt");
    assert!(matches!(error, RuntimeError::Cancelled));

    tokio::time::timeout(Duration::from_secs(3), session.shutdown())
        .await
        .expect("shutdown should not wait on a full result queue");
    assert_eq!(executor.invocations().len(), 1);
}

#[tokio::test]
async fn sessions_do_not_share_history_or_ids() {
    let provider = FakeProvider::new(vec![
        ProviderStep::Stream(vec![content("one"), finish(FinishReason::Stop)]),
        ProviderStep::Stream(vec![content("two"), finish(FinishReason::Stop)]),
    ]);
    let executor = Arc::new(ScriptedExecutor::default());
    let runtime = build_runtime(provider, executor, test_limits());
    let mut first = runtime.start_session().expect("limits are valid");
    let second = runtime.start_session().expect("limits are valid");
    let (sink, _fragments) = mpsc::unbounded_channel();

    first
        .run_prompt(
            UserPrompt::new("hi"),
            ResponseRegions::new("r16"),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .expect("prompt should complete");

    assert_ne!(first.session_id(), second.session_id());
    assert_eq!(first.conversation().len(), 3);
    assert!(second.conversation().is_empty());
}
