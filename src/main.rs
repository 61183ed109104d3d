// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, Read};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clap::Parser;
use cli::{Cli, Commands};
use opal_core::{
    spawn_session_actor, Agent, AgentEvent, AgentRuntimeContext, BusMessage, ChildKind, EventBus,
    SessionSupervisor, TaskTool,
};
use opal_model::catalog::ModelCatalogEntry;
use opal_tools::{
    ApplyPatchTool, AskQuestionTool, DeleteFileTool, EditFileTool, FindFileTool, GrepTool,
    ListDirTool, ReadFileTool, ReadLintsTool, RunTerminalCommandTool, SearchCodebaseTool,
    SwitchModeTool, TodoItem, TodoWriteTool, ToolEvent, ToolRegistry, UpdateMemoryTool,
    WebFetchTool, WebSearchTool, WriteTool,
};
use tokio::sync::{mpsc, Mutex};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                let config = opal_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::ListModels { provider } => {
                return list_models_cmd(provider.as_deref());
            }
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
        }
    }

    let mut config = opal_config::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.agent.default_mode = mode;
    }
    if let Some(ref model) = cli.model {
        config.model = opal_model::resolve_model_from_config(&config, model);
    }
    let config = Arc::new(config);

    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None if !is_stdin_tty() => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        }
        None => {
            anyhow::bail!(
                "no prompt given: pass one as an argument or pipe it on stdin"
            );
        }
    };

    let (mut agent, event_bus, session_topic) = build_agent(&config).await?;
    if let Some(session_path) = &cli.session {
        agent
            .resume_from(session_path.clone())
            .with_context(|| format!("resuming session from {}", session_path.display()))?;
    }
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);

    let mut sub_agent_events = event_bus.subscribe(&session_topic);
    let sub_drain = tokio::spawn(async move { drain_sub_agent_events(&mut sub_agent_events).await });
    let drain = tokio::spawn(async move { drain_events(&mut rx).await });

    // Drive the turn through the session actor rather than calling
    // `agent.submit` directly: the spawned agent-process task becomes the
    // sole owner of `agent`, and is registered with a `SessionSupervisor` so
    // a crash here is handled the same way a multi-session host would.
    let (handle, agent_task) = spawn_session_actor(agent);
    let mut supervisor = SessionSupervisor::new(session_topic.clone());
    supervisor.supervise(ChildKind::AgentProcess, agent_task);

    let submit_result = handle.submit(prompt.trim(), tx).await;
    supervisor.teardown();
    submit_result?;

    drain.await.context("event drain task panicked")?;
    event_bus.unsubscribe(&session_topic);
    sub_drain.abort();

    Ok(())
}

/// Build the agent's tool registry and wrap a model provider into a fresh
/// [`Agent`], the way every front-end (CLI, CI, gateway) does it.
///
/// Returns the `EventBus` and the bus topic that `task` sub-agents publish
/// their events onto, so the caller can subscribe before the first `submit`.
async fn build_agent(
    config: &Arc<opal_config::Config>,
) -> anyhow::Result<(Agent, Arc<EventBus>, String)> {
    let model: Arc<dyn opal_model::ModelProvider> =
        Arc::from(opal_model::from_config(&config.model)?);
    let max_ctx = model.catalog_context_window().unwrap_or(128_000) as usize;

    let mode = Arc::new(Mutex::new(config.agent.default_mode));
    let (tool_tx, tool_rx) = mpsc::channel::<ToolEvent>(64);

    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = ToolRegistry::new();
    registry.register(RunTerminalCommandTool {
        timeout_secs: config.tools.timeout_secs,
    });
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(FindFileTool);
    registry.register(GrepTool);
    registry.register(SearchCodebaseTool);
    registry.register(ListDirTool);
    registry.register(DeleteFileTool);
    registry.register(ApplyPatchTool);
    registry.register(ReadLintsTool);
    registry.register(AskQuestionTool::new());
    registry.register(WebFetchTool);
    registry.register(WebSearchTool {
        api_key: config.tools.web.search.api_key.clone(),
    });
    registry.register(UpdateMemoryTool {
        memory_file: config.tools.memory.memory_file.clone(),
    });
    registry.register(TodoWriteTool::new(todos, tool_tx.clone()));
    registry.register(SwitchModeTool::new(mode.clone(), tool_tx));
    let event_bus = Arc::new(EventBus::new());
    let session_topic = uuid::Uuid::new_v4().to_string();
    registry.register(TaskTool::new(
        model.clone(),
        Arc::new(config.as_ref().clone()),
        Arc::new(config.agent.clone()),
        Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        event_bus.clone(),
        session_topic.clone(),
    ));

    let mut runtime = AgentRuntimeContext::default();
    if let Ok(root) = opal_runtime::find_project_root() {
        runtime.git_context_note = opal_runtime::collect_git_context(&root).to_prompt_section();
        runtime.project_context_file = opal_runtime::load_project_context_file(&root);
        runtime.skills = opal_runtime::Shared::new(opal_runtime::discover_skills(Some(&root)));
        runtime.agents = opal_runtime::Shared::new(opal_runtime::discover_agents(Some(&root)));
        runtime.knowledge = opal_runtime::Shared::new(opal_runtime::discover_knowledge(Some(&root)));
        let drift = opal_runtime::check_knowledge_drift(&root, &runtime.knowledge.get());
        runtime.knowledge_drift_note = opal_runtime::format_drift_warnings(&drift);
        runtime.project_root = Some(root);
    }
    let ci = opal_runtime::detect_ci_context();
    runtime.ci_context_note = ci.to_prompt_section();

    let agent = Agent::new(
        model,
        Arc::new(registry),
        Arc::new(config.agent.clone()),
        runtime,
        mode,
        tool_rx,
        max_ctx,
    );
    Ok((agent, event_bus, session_topic))
}

/// Drain agent events to stdout/stderr until the turn completes.
///
/// Text deltas are written to stdout as they arrive; everything else is
/// logged so the output stream stays pipeable into other tools.
async fn drain_events(rx: &mut mpsc::Receiver<AgentEvent>) {
    use std::io::Write;
    use tracing::{debug, info, warn};

    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::AgentStart => {
                debug!("agent session started");
            }
            AgentEvent::AgentEnd { usage } => {
                debug!(
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "agent session ended"
                );
            }
            AgentEvent::AgentRecovered => {
                info!("agent resumed from persisted session history");
            }
            AgentEvent::ContextDiscovered { files } => {
                debug!(count = files.len(), "project context discovered");
            }
            AgentEvent::SkillLoaded { name, .. } => {
                debug!(skill = %name, "skill loaded");
            }
            AgentEvent::CompactionStart { old_len } => {
                debug!(old_len, "compaction starting");
            }
            AgentEvent::TextDelta(delta) => {
                print!("{delta}");
                let _ = io::stdout().flush();
            }
            AgentEvent::TextComplete(_) => {
                println!();
            }
            AgentEvent::ThinkingDelta(_) | AgentEvent::ThinkingComplete(_) => {}
            AgentEvent::StatusUpdate(status) => {
                info!(status = %status, "agent status");
            }
            AgentEvent::ToolCallStarted(call) => {
                debug!(tool = %call.name, call_id = %call.id, "tool call started");
            }
            AgentEvent::ToolCallFinished {
                tool_name,
                is_error,
                ..
            } => {
                debug!(tool = %tool_name, is_error, "tool call finished");
            }
            AgentEvent::ContextCompacted {
                tokens_before,
                tokens_after,
                ..
            } => {
                info!(tokens_before, tokens_after, "context compacted");
            }
            AgentEvent::TokenUsage { .. } => {}
            AgentEvent::TurnComplete => {
                break;
            }
            AgentEvent::Error(msg) => {
                warn!(error = %msg, "agent error");
                eprintln!("[opal:error] {msg}");
            }
            AgentEvent::TodoUpdate(_) | AgentEvent::ModeChanged(_) => {}
            AgentEvent::Question { id, questions } => {
                eprintln!("[opal:question {id}] {}", questions.join(" / "));
            }
            AgentEvent::QuestionAnswer { .. } => {}
            AgentEvent::Aborted { .. } => break,
        }
    }
}

/// Log the `task` tool's sub-agent event stream, forwarded onto the parent
/// session's bus by [`TaskTool`]. Runs for the lifetime of the process; the
/// caller aborts it once the top-level turn has finished draining.
async fn drain_sub_agent_events(rx: &mut tokio::sync::broadcast::Receiver<BusMessage>) {
    use tracing::debug;

    loop {
        match rx.recv().await {
            Ok(msg) => {
                if let BusMessage::SubAgent {
                    sub_session_id,
                    parent_call_id,
                    inner,
                    ..
                } = msg
                {
                    debug!(
                        sub_session = %sub_session_id,
                        call_id = %parent_call_id,
                        event = ?inner,
                        "sub-agent event"
                    );
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// List available models from the static catalog.
fn list_models_cmd(provider_filter: Option<&str>) -> anyhow::Result<()> {
    if let Some(prov) = provider_filter {
        if opal_model::get_driver(prov).is_none() {
            eprintln!("Unknown provider: {prov:?}");
            eprintln!("\nAvailable providers:");
            for d in opal_model::list_drivers() {
                eprintln!("  {:20} {}", d.id, d.name);
            }
            anyhow::bail!("Invalid provider: {prov}");
        }
    }

    let mut entries: Vec<ModelCatalogEntry> = opal_model::catalog::static_catalog();
    if let Some(prov) = provider_filter {
        entries.retain(|e| e.provider == prov);
    }
    entries.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.id.cmp(&b.id)));

    if entries.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    let id_w = entries.iter().map(|e| e.id.len()).max().unwrap_or(10).max(10);
    let prov_w = entries
        .iter()
        .map(|e| e.provider.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}  DESCRIPTION",
        "ID",
        "PROVIDER",
        "CTX WINDOW",
        "MAX OUT TOKENS",
        id_w = id_w,
        prov_w = prov_w,
    );
    println!("{}", "-".repeat(id_w + prov_w + 50));
    for e in &entries {
        let ctx = if e.context_window == 0 {
            "  -".to_string()
        } else {
            format!("{:>12}", e.context_window)
        };
        let max_out = if e.max_output_tokens == 0 {
            "  -".to_string()
        } else {
            format!("{:>16}", e.max_output_tokens)
        };
        println!(
            "{:<id_w$}  {:<prov_w$}  {}  {}  {}",
            e.id,
            e.provider,
            ctx,
            max_out,
            e.description,
            id_w = id_w,
            prov_w = prov_w,
        );
    }
    println!("\nTotal: {} model(s)", entries.len());
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn is_stdin_tty() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        unsafe { libc::isatty(io::stdin().as_raw_fd()) != 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
