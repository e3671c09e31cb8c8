use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowline_core::config::AppConfig;
use flowline_core::event::{EventBus, EventPayload};
use flowline_core::traits::{SessionFilter, SessionStorage};
use flowline_core::types::{RunStatus, WorkflowRunResponse};
use flowline_engine::{RunLogger, RunOptions, WorkflowDef};

#[derive(Parser)]
#[command(name = "flowline", version, about = "Step-based workflow runner")]
struct Cli {
    /// Path to config file (defaults to ~/.flowline/config.toml when present)
    #[arg(short, long, env = "FLOWLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Session ID (auto-generated if not provided)
        #[arg(short, long)]
        session: Option<String>,
        /// User the session belongs to
        #[arg(short, long)]
        user: Option<String>,
        /// Print events as they happen
        #[arg(long)]
        stream: bool,
        /// Include unit-level events in the stream
        #[arg(long)]
        intermediate: bool,
        /// Print the full run response as JSON
        #[arg(long)]
        json: bool,
        /// Workflow input; read from stdin when empty
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
    },
    /// Validate a workflow definition without running it
    Check {
        workflow: PathBuf,
    },
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, newest first
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Show one session and its run history
    Show {
        session_id: String,
        /// Print the session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set a session's display name
    Rename { session_id: String, name: String },
    /// Delete a session
    Delete { session_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowline=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Check { workflow } => {
            let def = WorkflowDef::load(&workflow)?;
            let wf = def.builder()?.config(config.engine.clone()).build()?;
            println!("{} ({})", wf.name(), wf.workflow_id());
            for unit in wf.units() {
                match unit.description() {
                    Some(d) => println!("  {} [{}] {}", unit.name(), unit.kind(), d),
                    None => println!("  {} [{}]", unit.name(), unit.kind()),
                }
            }
        }
        Commands::Sessions { action } => {
            let storage = flowline_storage::open_storage(&config.storage).await?;
            handle_sessions(action, storage.as_ref()).await?;
        }
        Commands::Run {
            workflow,
            session,
            user,
            stream,
            intermediate,
            json,
            input,
        } => {
            let text = if input.is_empty() {
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                input.join(" ")
            };
            let options = RunArgs {
                session,
                user,
                stream,
                intermediate,
                json,
            };
            run_workflow(&config, &workflow, text, options).await?;
        }
    }

    Ok(())
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    if let Some(path) = explicit {
        return Ok(AppConfig::load(path)?);
    }
    let default = AppConfig::default_path();
    if default.exists() {
        info!(path = %default.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&default)?);
    }
    Ok(AppConfig::default())
}

struct RunArgs {
    session: Option<String>,
    user: Option<String>,
    stream: bool,
    intermediate: bool,
    json: bool,
}

async fn run_workflow(
    config: &AppConfig,
    path: &Path,
    input: String,
    args: RunArgs,
) -> anyhow::Result<()> {
    let def = WorkflowDef::load(path)?;
    let storage = flowline_storage::open_storage(&config.storage).await?;
    let session_id = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut builder = def.builder()?.config(config.engine.clone()).storage(storage);

    // Optional JSONL run log fed from the event bus.
    let cancel = CancellationToken::new();
    let mut logger = None;
    if let Some(log) = config.log.as_ref().filter(|l| l.enabled) {
        let bus = Arc::new(EventBus::new(config.engine.event_bus_capacity));
        let rx = bus.subscribe();
        builder = builder.event_bus(bus);
        let run_logger = RunLogger::new(log.resolved_dir(), log.level);
        logger = Some(tokio::spawn(run_logger.run(
            rx,
            session_id.clone(),
            cancel.clone(),
        )));
    }

    let wf = Arc::new(builder.build()?);
    let mut options = RunOptions::new().session(session_id.clone());
    if args.intermediate {
        options = options.intermediate_steps(true);
    }
    if let Some(user) = args.user {
        options = options.user(user);
    }

    info!(workflow = %wf.name(), session_id = %session_id, "Running workflow");
    let result = if args.stream {
        stream_run(&wf, input, options).await
    } else {
        wf.run(input, options).await
    };

    if let Some(mut handle) = logger {
        if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
            cancel.cancel();
            handle.await.ok();
        }
    }

    let response = result?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if !args.stream {
        print_response(&response);
    }
    if response.status == RunStatus::Halted {
        eprintln!("[halted]");
    }
    eprintln!("[session: {}]", session_id);
    Ok(())
}

async fn stream_run(
    wf: &Arc<flowline_engine::Workflow>,
    input: String,
    options: RunOptions,
) -> flowline_core::error::Result<WorkflowRunResponse> {
    let mut events = wf.run_stream(input, options);
    let mut streamed = false;
    while let Some(event) = events.next().await {
        match &event.payload {
            EventPayload::ContentDelta { delta, .. } => {
                print!("{}", delta);
                io::stdout().flush().ok();
                streamed = true;
            }
            EventPayload::StepStarted { step_name, .. } => {
                eprintln!("\n[step: {}]", step_name);
            }
            EventPayload::StepCompleted {
                step_name, result, ..
            } => {
                let status = if result.success { "ok" } else { "ERROR" };
                eprintln!(
                    "[{}: {}] {}",
                    step_name,
                    status,
                    truncate(&result.content.to_text(), 200)
                );
            }
            EventPayload::RouterStarted {
                step_name,
                selected_steps,
                ..
            } => {
                eprintln!("[{} -> {}]", step_name, selected_steps.join(", "));
            }
            EventPayload::WorkflowError { error } => {
                eprintln!("[error] {}", error);
            }
            _ => {}
        }
    }
    let response = events.finish().await?;
    if streamed {
        println!();
    } else if let Some(content) = &response.content {
        println!("{}", content);
    }
    Ok(response)
}

fn print_response(response: &WorkflowRunResponse) {
    for step in &response.step_results {
        if !step.success {
            eprintln!(
                "[{}: ERROR] {}",
                step.step_name,
                step.error.as_deref().unwrap_or_default()
            );
        }
    }
    if let Some(content) = &response.content {
        println!("{}", content);
    }
}

async fn handle_sessions(action: SessionAction, storage: &dyn SessionStorage) -> anyhow::Result<()> {
    match action {
        SessionAction::List { user, workflow } => {
            let sessions = storage
                .list_sessions(SessionFilter {
                    user_id: user,
                    workflow_id: workflow,
                })
                .await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{}  {}  runs={}  updated={}{}",
                    s.session_id,
                    s.workflow_name.as_deref().unwrap_or(&s.workflow_id),
                    s.runs.len(),
                    s.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    s.session_name
                        .as_ref()
                        .map(|n| format!("  \"{}\"", n))
                        .unwrap_or_default(),
                );
            }
        }
        SessionAction::Show { session_id, json } => {
            let Some(session) = storage.read(&session_id).await? else {
                anyhow::bail!("session not found: {}", session_id);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
                return Ok(());
            }
            println!("session:  {}", session.session_id);
            println!("workflow: {}", session.workflow_id);
            if let Some(name) = &session.session_name {
                println!("name:     {}", name);
            }
            if let Some(user) = &session.user_id {
                println!("user:     {}", user);
            }
            println!("created:  {}", session.created_at.to_rfc3339());
            for run in &session.runs {
                let preview = run
                    .response()
                    .and_then(|r| r.content.as_ref())
                    .map(|c| c.to_text())
                    .unwrap_or_default();
                println!(
                    "  {}  {:<9} {}",
                    run.run_id(),
                    run.status(),
                    truncate(&preview, 80)
                );
            }
        }
        SessionAction::Rename { session_id, name } => {
            let Some(mut session) = storage.read(&session_id).await? else {
                anyhow::bail!("session not found: {}", session_id);
            };
            session.rename(name.as_str());
            storage.upsert(session).await?;
            println!("Renamed {} to \"{}\"", session_id, name);
        }
        SessionAction::Delete { session_id } => {
            if storage.read(&session_id).await?.is_none() {
                warn!(session_id = %session_id, "Session not found");
            }
            storage.delete(&session_id).await?;
            println!("Deleted {}", session_id);
        }
    }
    Ok(())
}

/// Truncate on a character boundary.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
