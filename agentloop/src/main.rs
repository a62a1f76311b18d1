//! `agentloop`: drive a coding agent through repeated fresh sessions.
//!
//! State lives in `.agentloop/sessions/<session>.jsonl` (configurable). The
//! agent itself updates tasks and notes through the same CLI while `run` is
//! driving it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentloop::acp::{AcpRunner, AcpRunnerConfig, ProcessSpawner};
use agentloop::core::completion::IncompleteTasks;
use agentloop::core::selector::{blocked_tasks, next_task};
use agentloop::core::types::{NoteKind, Task, TaskStatus};
use agentloop::exit_codes;
use agentloop::io::config::{DEFAULT_CONFIG_FILE, LoopConfig, load_config, resolve_path, write_config};
use agentloop::io::git::{Committer, GitCommitter};
use agentloop::io::hooks::ShellHookExecutor;
use agentloop::logging;
use agentloop::orchestrator::{ConsoleUi, LoopListener, LoopStop, Orchestrator, OrchestratorParts, UiSink};
use agentloop::store::{JsonlEventLog, SessionStore};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "agentloop",
    version,
    about = "Iterative coding-agent loop with an append-only session log"
)]
struct Cli {
    /// Config file; relative paths inside it resolve against its directory.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        #[arg(long)]
        session: Option<String>,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run iterations until the session completes, the limit is hit, or Ctrl-C.
    Run {
        /// Override `max_iterations` (0 = unlimited).
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Print a summary of the session.
    Status,
    /// Print the id of the next eligible task.
    Next,
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Note(NoteCommand),
    /// Record a summary of the current iteration.
    Summary { text: String },
    /// Print recent iteration summaries.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Clear tasks, notes and history. The log itself is kept.
    Reset,
    /// Mark the session complete. Fails while any task is not completed.
    Complete,
}

#[derive(Subcommand)]
enum TaskCommand {
    Add {
        content: String,
        /// 0 (lowest) to 4 (highest).
        #[arg(long, default_value_t = 2)]
        priority: i64,
        #[arg(long = "depends")]
        depends: Vec<String>,
    },
    Status { id: String, status: TaskStatus },
    Priority { id: String, priority: i64 },
    /// Replace the dependencies of a task. No ids clears them.
    Depends { id: String, depends: Vec<String> },
    List,
}

#[derive(Subcommand)]
enum NoteCommand {
    Add { kind: NoteKind, content: String },
    List {
        #[arg(long = "type")]
        kind: Option<NoteKind>,
    },
}

/// Config plus the directory its relative paths resolve against.
struct Workspace {
    base: PathBuf,
    config: LoopConfig,
}

impl Workspace {
    fn load(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path)?;
        let base = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self { base, config })
    }

    fn workdir(&self) -> PathBuf {
        resolve_path(&self.base, &self.config.workdir)
    }

    fn store(&self) -> Result<SessionStore> {
        let dir = resolve_path(&self.base, &self.config.store.dir);
        let log = JsonlEventLog::open(&dir)
            .with_context(|| format!("open session store {}", dir.display()))?;
        SessionStore::new(Arc::new(log), self.config.session.clone())
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    if let Command::Init { session, force } = &cli.command {
        cmd_init(&cli.config, session.as_deref(), *force)?;
        return Ok(exit_codes::OK);
    }
    let ws = Workspace::load(&cli.config)?;
    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Run { max_iterations } => cmd_run(ws, max_iterations).await,
        Command::Status => cmd_status(&ws.store()?),
        Command::Next => cmd_next(&ws.store()?),
        Command::Task(command) => cmd_task(&ws.store()?, command),
        Command::Note(command) => cmd_note(&ws.store()?, command),
        Command::Summary { text } => {
            ws.store()?.record_iteration_summary(&text)?;
            Ok(exit_codes::OK)
        }
        Command::History { limit } => {
            for record in ws.store()?.history(limit)? {
                println!("{}. {}", record.number, record.summary.trim());
            }
            Ok(exit_codes::OK)
        }
        Command::Reset => {
            ws.store()?.reset()?;
            Ok(exit_codes::OK)
        }
        Command::Complete => cmd_complete(&ws.store()?),
    }
}

fn cmd_init(config_path: &Path, session: Option<&str>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let mut config = LoopConfig::default();
    if let Some(session) = session {
        config.session = session.to_string();
    }
    write_config(config_path, &config)?;
    println!("wrote {}", config_path.display());
    Ok(())
}

async fn cmd_run(ws: Workspace, max_iterations: Option<u32>) -> Result<i32> {
    let workdir = ws.workdir();
    let store = ws.store()?;
    let mut config = ws.config;
    if let Some(limit) = max_iterations {
        config.max_iterations = limit;
    }
    config.workdir = workdir.clone();

    let ui: Arc<dyn UiSink> = Arc::new(ConsoleUi);
    let listener = Arc::new(LoopListener::new(Arc::clone(&ui)));
    let spawner = ProcessSpawner {
        command: config.agent.command.clone(),
        args: config.agent.args.clone(),
        env: config.agent.env.clone(),
        cwd: workdir.clone(),
    };
    let runner = Arc::new(AcpRunner::new(
        Arc::new(spawner),
        listener.clone(),
        AcpRunnerConfig {
            cwd: workdir.clone(),
            model: config.agent.model.clone(),
            mcp_servers: config.agent.mcp_servers.clone(),
        },
    ));
    let committer: Option<Arc<dyn Committer>> = if config.auto_commit {
        Some(Arc::new(GitCommitter::new(workdir)))
    } else {
        None
    };

    let orchestrator = Orchestrator::new(OrchestratorParts {
        config,
        store,
        runner,
        hooks: Arc::new(ShellHookExecutor),
        ui,
        listener,
        committer,
    })?;

    let handle = orchestrator.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, stopping");
            handle.stop().await;
        }
    });
    let outcome = orchestrator.run().await;
    interrupt.abort();
    orchestrator.stop().await;

    let outcome = outcome?;
    info!(iterations = outcome.iterations, stop = ?outcome.stop, "run finished");
    Ok(match outcome.stop {
        LoopStop::Complete | LoopStop::MaxIterations => exit_codes::OK,
        LoopStop::Cancelled => exit_codes::CANCELLED,
    })
}

fn cmd_status(store: &SessionStore) -> Result<i32> {
    let state = store.state()?;
    let count = |status: TaskStatus| state.tasks.iter().filter(|t| t.status == status).count();
    println!("session: {}", store.session());
    println!(
        "tasks: {} total, {} remaining, {} in progress, {} blocked, {} completed",
        state.tasks.len(),
        count(TaskStatus::Remaining),
        count(TaskStatus::InProgress),
        count(TaskStatus::Blocked),
        count(TaskStatus::Completed),
    );
    match next_task(&state) {
        Some(task) => println!("next: {} {}", task.id, task.content.trim()),
        None => println!("next: none"),
    }
    let waiting = blocked_tasks(&state);
    if !waiting.is_empty() {
        let ids: Vec<&str> = waiting.iter().map(|t| t.id.as_str()).collect();
        println!("waiting on dependencies: {}", ids.join(", "));
    }
    println!("notes: {}", state.notes.len());
    println!("last iteration: {}", state.control.last_iteration);
    if let Some(err) = &state.control.last_error {
        println!("last error: {err}");
    }
    println!("complete: {}", state.control.complete);
    Ok(exit_codes::OK)
}

fn cmd_next(store: &SessionStore) -> Result<i32> {
    match store.next_task()? {
        Some(task) => {
            println!("{}", task.id);
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("no eligible task");
            Ok(exit_codes::NO_TASK)
        }
    }
}

fn cmd_task(store: &SessionStore, command: TaskCommand) -> Result<i32> {
    match command {
        TaskCommand::Add {
            content,
            priority,
            depends,
        } => {
            let task = store.add_task(&content, priority, &depends)?;
            println!("{}", task.id);
        }
        TaskCommand::Status { id, status } => {
            store.set_task_status(&id, status)?;
        }
        TaskCommand::Priority { id, priority } => {
            store.set_task_priority(&id, priority)?;
        }
        TaskCommand::Depends { id, depends } => {
            store.set_task_dependencies(&id, &depends)?;
        }
        TaskCommand::List => {
            for task in store.state()?.tasks {
                println!("{}", format_task(&task));
            }
        }
    }
    Ok(exit_codes::OK)
}

fn format_task(task: &Task) -> String {
    let deps = if task.dependencies.is_empty() {
        String::new()
    } else {
        let ids: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
        format!(" after {}", ids.join(","))
    };
    format!(
        "{} [{}] p{}{}: {}",
        task.id,
        task.status,
        task.priority,
        deps,
        task.content.trim()
    )
}

fn cmd_note(store: &SessionStore, command: NoteCommand) -> Result<i32> {
    match command {
        NoteCommand::Add { kind, content } => {
            let note = store.add_note(kind, &content)?;
            println!("{}", note.id);
        }
        NoteCommand::List { kind } => {
            for note in store.notes(kind)? {
                println!("{} [{}] {}", note.id, note.kind.as_str(), note.content.trim());
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_complete(store: &SessionStore) -> Result<i32> {
    match store.complete() {
        Ok(_) => {
            println!("session complete");
            Ok(exit_codes::OK)
        }
        Err(err) => match err.downcast_ref::<IncompleteTasks>() {
            Some(incomplete) => {
                eprintln!("cannot complete: {} task(s) outstanding", incomplete.outstanding.len());
                for task in &incomplete.outstanding {
                    eprintln!("  {} [{}] {}", task.id, task.status, task.content.trim());
                }
                Ok(exit_codes::INVALID)
            }
            None => Err(err),
        },
    }
}
