use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use tasker::agent::{
    Agent, AgentEvent, JsonSessionStore, Session, SessionStore, StatusHandle, StopReason, SubAgent,
    SubAgentConfig, SubAgentKind, build_system_prompt,
};
use tasker::cli::{Cli, Commands};
use tasker::config::{self, AppConfig};
use tasker::provider::{ChatProvider, OpenAiClient};
use tasker::tasks::{
    BackgroundManager, OrchestrationEvent, ProgressCallback, Schedule, SubAgentExecutor, TaskDefinition,
    TaskOrchestrator, TaskProgress, TaskRunner, TaskScheduler, TaskStatus, Workflow,
};
use tasker::tools::builtin::{agent_registry, builtin_registry};
use tasker::tools::{
    AlwaysGrant, LinePrompt, PermissionManager, PermissionPrompt, TomlPermissionStore, ToolExecutor,
};

type InputLines = Arc<Mutex<Lines<BufReader<Stdin>>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    tracing::info!(model = %config.model, workspace = %config.workspace.display(), "Config loaded");

    match cli.command {
        Commands::Chat { session, yes, .. } => run_chat(&config, session, yes).await,
        Commands::Exec { prompt, explore, .. } => run_exec(&config, &prompt, explore).await,
        Commands::Workflow { file, .. } => run_workflow(&config, &file).await,
    }
}

fn build_provider(config: &AppConfig) -> anyhow::Result<Arc<dyn ChatProvider>> {
    let settings = config.provider_settings()?;
    Ok(Arc::new(OpenAiClient::new(settings)?))
}

fn build_executor(config: &AppConfig, permissions: PermissionManager) -> anyhow::Result<ToolExecutor> {
    let registry = builtin_registry(&config.blocked_patterns, config.shell_timeout_secs)?;
    let workspace = config
        .workspace
        .canonicalize()
        .with_context(|| format!("Workspace {} is not accessible", config.workspace.display()))?;
    tracing::info!(
        workspace = %workspace.display(),
        timeout_secs = config.shell_timeout_secs,
        blocklist_patterns = config.blocked_patterns.len(),
        tools = registry.len(),
        "Tools initialized"
    );
    Ok(ToolExecutor::new(registry, Arc::new(permissions), workspace))
}

fn task_runner(provider: Arc<dyn ChatProvider>, executor: &ToolExecutor, config: &AppConfig) -> TaskRunner {
    let sub_agents = SubAgentExecutor::new(provider, executor.clone(), config.sub_agent_config());
    TaskRunner::new(Arc::new(sub_agents), config.retry_defaults())
}

/// Cancel `token` on the first Ctrl-C. Abort the handle once the work is done.
fn cancel_on_ctrl_c(token: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

fn render_event(event: AgentEvent) {
    match event {
        AgentEvent::TextDelta(delta) => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::ToolCall(call) => eprintln!("\n[tool] {} {}", call.name, call.arguments),
        AgentEvent::ToolResult { name, result, .. } if !result.success => {
            eprintln!("[tool] {name} failed: {}", result.error.as_deref().unwrap_or(&result.output));
        }
        AgentEvent::Compacted(result) => eprintln!(
            "[context compacted: {} -> {} tokens]",
            result.original_tokens, result.compressed_tokens
        ),
        AgentEvent::Error(message) => eprintln!("\n[error] {message}"),
        _ => {}
    }
}

enum Flow {
    Continue,
    Exit,
}

struct ChatSession {
    agent: Agent,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    background: BackgroundManager,
    scheduler: TaskScheduler,
}

impl ChatSession {
    /// Run one turn, rendering events as they arrive. Ctrl-C cancels the turn.
    async fn turn(&mut self, text: &str) {
        let cancel = CancellationToken::new();
        let watcher = cancel_on_ctrl_c(&cancel);

        let outcome = {
            let turn = self.agent.send_message(text, &cancel);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    outcome = &mut turn => break outcome,
                    Some(event) = self.events.recv() => render_event(event),
                }
            }
        };
        watcher.abort();
        while let Ok(event) = self.events.try_recv() {
            render_event(event);
        }
        println!();

        match outcome {
            Ok(turn) if turn.stop == StopReason::Cancelled => eprintln!("[cancelled]"),
            Ok(turn) if turn.stop == StopReason::MaxIterations => {
                eprintln!("[stopped after {} iterations]", turn.iterations)
            }
            Ok(_) => {}
            Err(e) => eprintln!("[error] {e}"),
        }
    }

    async fn command(&mut self, line: &str) -> Flow {
        let (name, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();
        match name {
            "exit" | "quit" => return Flow::Exit,
            "help" => println!(
                "/status  /compact  /clear  /tasks  /bg <prompt>  /output <id>\n\
                 /schedule <secs> <prompt>  /cancel <id>  /cleanup  /exit"
            ),
            "status" => {
                let context = self.agent.context();
                let stats = self.background.stats();
                println!(
                    "status: {}\nsession: {}\nmessages: {} (~{} tokens)\nbackground: {} running, {} pending, {} done",
                    self.agent.status(),
                    self.agent.session_id().unwrap_or("-"),
                    context.message_count(),
                    context.estimate_tokens(),
                    stats.running,
                    stats.pending,
                    stats.completed + stats.failed + stats.cancelled,
                );
            }
            "compact" => match self.agent.compact(&CancellationToken::new()).await {
                Some(result) => println!(
                    "compacted {} -> {} tokens{}",
                    result.original_tokens,
                    result.compressed_tokens,
                    if result.fallback { " (fallback)" } else { "" }
                ),
                None => println!("nothing to compact"),
            },
            "clear" => {
                self.agent.reset();
                self.agent.executor().permissions().clear_session();
                println!("conversation cleared");
            }
            "tasks" => {
                let tasks = self.background.list();
                if tasks.is_empty() {
                    println!("no background tasks");
                }
                for task in tasks {
                    println!(
                        "{}  {:<9}  {:>3}%  {}",
                        task.id,
                        task.progress.status.to_string(),
                        task.progress.progress,
                        task.definition.display_name()
                    );
                }
                for entry in self.scheduler.queue() {
                    println!("{}  scheduled for {}  {}", entry.id, entry.next_run, entry.task.display_name());
                }
            }
            "bg" if !arg.is_empty() => match self.background.start(TaskDefinition::new("", arg)) {
                Ok(id) => println!("started {id}"),
                Err(e) => eprintln!("[error] {e}"),
            },
            "output" if !arg.is_empty() => match self.background.output(arg) {
                Some(output) if output.is_empty() => println!("(no output yet)"),
                Some(output) => println!("{output}"),
                None => eprintln!("no background task '{arg}'"),
            },
            "schedule" => {
                let parsed = arg
                    .split_once(' ')
                    .and_then(|(secs, prompt)| Some((secs.parse::<u64>().ok()?, prompt.trim())));
                match parsed {
                    Some((secs, prompt)) if !prompt.is_empty() => {
                        let task = TaskDefinition::new(uuid::Uuid::new_v4().to_string(), prompt);
                        match self.scheduler.schedule(task, Schedule::After(Duration::from_secs(secs))) {
                            Ok(id) => println!("scheduled {id}"),
                            Err(e) => eprintln!("[error] {e}"),
                        }
                    }
                    _ => eprintln!("usage: /schedule <secs> <prompt>"),
                }
            }
            "cleanup" => {
                let removed = self.background.cleanup() + self.scheduler.cleanup();
                println!("removed {removed} finished task(s)");
            }
            "cancel" if !arg.is_empty() => {
                if self.background.cancel(arg) || self.scheduler.cancel(arg) {
                    println!("cancelled {arg}");
                } else {
                    eprintln!("nothing to cancel for '{arg}'");
                }
            }
            _ => eprintln!("unknown command /{line}; try /help"),
        }
        Flow::Continue
    }
}

async fn run_chat(config: &AppConfig, session_id: Option<String>, yes: bool) -> anyhow::Result<()> {
    let provider = build_provider(config)?;
    let input: InputLines = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));

    let status = StatusHandle::new();

    let prompt: Arc<dyn PermissionPrompt> = if yes {
        Arc::new(AlwaysGrant)
    } else {
        Arc::new(LinePrompt::new(input.clone()).with_status(status.clone()))
    };
    let mut permissions = PermissionManager::new(config.permissions.clone()).with_prompt(prompt);
    if let Some(dir) = config::global_config_dir() {
        permissions = permissions
            .with_store(Arc::new(TomlPermissionStore::new(dir.join("permissions.toml"))))
            .await;
    }
    let base = build_executor(config, permissions)?;

    // Background tasks and spawned sub-agents run with the base tools only.
    let runner = task_runner(provider.clone(), &base, config);
    let background = BackgroundManager::new(runner.clone(), config.max_concurrent);
    let registry = agent_registry(&base, provider.clone(), background.clone(), config.sub_agent_config())?;
    let executor = base.scoped(registry, base.permissions().clone());

    let system_prompt = build_system_prompt(executor.workspace(), &config.model, &executor.definitions()).await;
    let store = Arc::new(JsonSessionStore::new(sessions_dir(executor.workspace())));
    let session = match session_id {
        Some(id) => store
            .load(&id)
            .await?
            .with_context(|| format!("No saved session '{id}'"))?,
        None => Session::new(Some(system_prompt.clone())),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let agent = Agent::new(provider, executor, config.agent_settings())
        .with_status(status)
        .with_system_prompt(system_prompt)
        .with_events(tx)
        .with_session(store, session);

    let mut chat = ChatSession {
        agent,
        events: rx,
        background,
        scheduler: TaskScheduler::new(runner, config.max_queue_size),
    };

    println!(
        "tasker | model {} | session {} | /help for commands, Ctrl-D to quit",
        config.model,
        chat.agent.session_id().unwrap_or("-")
    );

    loop {
        chat.agent.set_waiting_input();
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = input.lock().await.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            match chat.command(command).await {
                Flow::Exit => break,
                Flow::Continue => continue,
            }
        }
        chat.turn(line).await;
    }

    chat.scheduler.stop();
    chat.background.shutdown();
    Ok(())
}

fn sessions_dir(workspace: &Path) -> PathBuf {
    config::data_dir()
        .unwrap_or_else(|| workspace.join(".tasker"))
        .join("sessions")
}

async fn run_exec(config: &AppConfig, prompt: &str, explore: bool) -> anyhow::Result<()> {
    let provider = build_provider(config)?;
    let executor = build_executor(config, PermissionManager::new(config.permissions.clone()))?;
    let sub_config = SubAgentConfig {
        kind: if explore {
            SubAgentKind::Explore
        } else {
            SubAgentKind::General
        },
        ..config.sub_agent_config()
    };
    let agent = SubAgent::new(provider, &executor, sub_config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let AgentEvent::ToolCall(call) = event {
                eprintln!("[tool] {} {}", call.name, call.arguments);
            }
        }
    });

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(&cancel);
    let result = agent.execute(prompt, &cancel, Some(tx)).await;
    watcher.abort();
    let _ = printer.await;

    println!("{}", result.output);
    tracing::info!(
        iterations = result.iterations,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "Exec finished"
    );
    if !result.success {
        anyhow::bail!(if result.cancelled {
            "cancelled"
        } else {
            "sub-agent did not complete"
        });
    }
    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let workflow = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?
    };
    Ok(workflow)
}

async fn run_workflow(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let provider = build_provider(config)?;
    let executor = build_executor(config, PermissionManager::new(config.permissions.clone()))?;

    let progress: ProgressCallback = Arc::new(|p: &TaskProgress| {
        if let Some(message) = &p.message {
            eprintln!("[{}] {}% {}", p.task_id, p.progress, message);
        }
    });
    let runner = task_runner(provider, &executor, config).with_progress(progress);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OrchestrationEvent::TaskStarted { task_id } => eprintln!("[{task_id}] started"),
                OrchestrationEvent::TaskCompleted(result) => {
                    eprintln!("[{}] {} ({} ms)", result.task_id, result.status, result.duration_ms)
                }
                OrchestrationEvent::AllComplete(results) => eprintln!("{} task(s) finished", results.len()),
            }
        }
    });

    let orchestrator = TaskOrchestrator::new(runner).with_events(tx);
    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(&cancel);
    let outcome = orchestrator.execute(&workflow, &cancel).await;
    watcher.abort();
    drop(orchestrator);
    let _ = printer.await;

    let results = outcome?;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let unfinished = results
        .values()
        .filter(|r| r.status != TaskStatus::Completed)
        .count();
    if unfinished > 0 {
        anyhow::bail!("{unfinished} of {} task(s) did not complete", results.len());
    }
    Ok(())
}
