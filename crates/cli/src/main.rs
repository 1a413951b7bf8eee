use std::{io::Write, path::PathBuf, process::ExitCode};

use clap::Parser;
use cli::{
    CliError, CliOverrides, TerminalRenderer, build_runtime, load_agent_config, read_attachments,
};
use runtime::{AgentSession, TurnOutcome, TurnStatus};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use types::{ResponseRegions, RuntimeError, SideInput, UserPrompt, init_tracing};

const QUIT_COMMAND: &str = "/quit";

type StdioRenderer = TerminalRenderer<std::io::Stdout, std::io::Stderr>;

#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(
    name = "codechat",
    about = "Chat with a local OpenAI-compatible model that can run Python code"
)]
struct CodechatArgs {
    /// Run a single prompt and exit instead of starting a REPL.
    #[arg(short = 'p', long = "prompt")]
    prompt: Option<String>,
    /// Attach a file to the first prompt. May be repeated.
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,
    #[arg(long = "model")]
    model: Option<String>,
    #[arg(long = "base-url")]
    base_url: Option<String>,
    #[arg(long = "max-iterations")]
    max_iterations: Option<usize>,
    #[arg(long = "show-reasoning")]
    show_reasoning: bool,
    /// Config profile selected from profile-keyed `agent.toml` files.
    #[arg(long = "profile")]
    profile: Option<String>,
    /// Directory whose `agent.toml` replaces `./.codechat/agent.toml`.
    #[arg(long = "profile-dir")]
    profile_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = run().await {
        eprintln!("codechat error: {error}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<(), CliError> {
    init_tracing();
    let args = CodechatArgs::parse();
    let overrides = CliOverrides::from_flags(
        args.max_iterations,
        args.show_reasoning,
        args.model.clone(),
        args.base_url.clone(),
    );
    let config = load_agent_config(
        args.profile.as_deref(),
        args.profile_dir.as_deref(),
        overrides,
    )?;
    info!(
        base_url = %config.provider.base_url,
        model = %config.provider.model,
        max_iterations = config.runtime.max_iterations,
        "agent config loaded"
    );

    let attachments = read_attachments(&args.files)?;
    let runtime = build_runtime(&config)?;
    let mut session = runtime.start_session()?;
    let renderer = TerminalRenderer::stdio();

    let result = match args.prompt {
        Some(text) => {
            let prompt = UserPrompt::new(text).with_attachments(attachments);
            let (_, outcome) = run_prompt(&mut session, renderer, prompt).await;
            outcome.map(report_outcome).map_err(CliError::from)
        }
        None => repl(&mut session, renderer, attachments).await,
    };

    session.shutdown().await;
    result
}

async fn repl(
    session: &mut AgentSession,
    mut renderer: StdioRenderer,
    attachments: Vec<SideInput>,
) -> Result<(), CliError> {
    let mut pending_attachments = Some(attachments);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let _ = std::io::stderr().flush();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == QUIT_COMMAND {
            break;
        }

        let prompt = UserPrompt::new(text)
            .with_attachments(pending_attachments.take().unwrap_or_default());
        let (returned, outcome) = run_prompt(session, renderer, prompt).await;
        renderer = returned;
        match outcome {
            Ok(outcome) => report_outcome(outcome),
            Err(RuntimeError::Cancelled) => eprintln!("[cancelled]"),
            // Already rendered as an error fragment; the session stays usable.
            Err(_) => {}
        }
    }
    Ok(())
}

/// Run one prompt with a fresh render channel and a Ctrl-C watcher that
/// cancels it. The renderer is handed back once every fragment is written.
async fn run_prompt(
    session: &mut AgentSession,
    mut renderer: StdioRenderer,
    prompt: UserPrompt,
) -> (StdioRenderer, Result<TurnOutcome, RuntimeError>) {
    let (sink, mut fragments) = mpsc::unbounded_channel();
    let render_task = tokio::spawn(async move {
        while let Some(fragment) = fragments.recv().await {
            if let Err(error) = renderer.apply_fragment(&fragment) {
                warn!(%error, "failed to write fragment to terminal");
            }
        }
        if let Err(error) = renderer.finish_response() {
            warn!(%error, "failed to finish terminal response");
        }
        renderer
    });

    let cancellation = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancellation.cancel();
            }
        }
    });

    let regions = ResponseRegions::new(uuid::Uuid::new_v4().simple().to_string());
    let outcome = session
        .run_prompt(prompt, regions, &sink, &cancellation)
        .await;
    interrupt.abort();
    drop(sink);

    let renderer = match render_task.await {
        Ok(renderer) => renderer,
        Err(error) => {
            warn!(%error, "terminal renderer task failed");
            TerminalRenderer::stdio()
        }
    };
    (renderer, outcome)
}

fn report_outcome(outcome: TurnOutcome) {
    if outcome.status == TurnStatus::BudgetExhausted {
        eprintln!(
            "[stopped after {} turns without a final answer]",
            outcome.turns
        );
    }
}
