//! Taskherd CLI entry point

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use taskherd::core::{StatusCounts, TaskId, TaskState, TaskStatus, TaskUpdate};
use taskherd::{App, Config, ConfigError, JsonFileStore, NewTask, SupervisorError, TaskStore};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Parser)]
#[command(
    name = "taskherd",
    version,
    about = "Resource-aware FIFO dispatcher and supervisor for worker processes"
)]
struct Cli {
    /// Config file (default: ./taskherd.yml, then the user config dir)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Supervise the queue until Ctrl-C
    Run(RunArgs),
    /// Queue a new task
    Submit(SubmitArgs),
    /// Show tasks and counters
    List(ListArgs),
    /// Write a task's outcome or progress, as a module does
    Report(ReportArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Print observer events as JSON lines
    #[arg(long = "events")]
    events: bool,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// Task type, as configured under `modules`
    #[arg(short = 't', long = "type")]
    task_type: u32,

    #[arg(long = "creator", default_value = "")]
    creator: String,

    /// Free-form JSON parameters
    #[arg(long = "params")]
    params: Option<String>,

    /// Estimated duration in seconds
    #[arg(long = "eta")]
    eta: Option<u64>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(short = 'n', long = "limit", default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Args)]
struct ReportArgs {
    id: TaskId,

    #[arg(long = "finished", conflicts_with = "failed")]
    finished: bool,

    #[arg(long = "failed")]
    failed: bool,

    #[arg(short = 'm', long = "message")]
    message: Option<String>,

    #[arg(long = "eta")]
    eta: Option<u64>,

    #[arg(long = "output")]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 2 for configuration problems, 1 for anything else
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let configuration = err.downcast_ref::<ConfigError>().is_some()
        || err
            .downcast_ref::<SupervisorError>()
            .is_some_and(|e| e.is_configuration());
    if configuration {
        2
    } else {
        1
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None => Config::discover()?,
    };
    log::debug!("Loading config from: {}", path.display());
    Ok(Config::load(&path)?)
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(cli.config)?;
    match cli.cmd {
        Commands::Run(args) => run(config, args).await,
        Commands::Submit(args) => submit(&config, args),
        Commands::List(args) => list(&config, args),
        Commands::Report(args) => report(&config, args),
    }
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    log::info!("taskherd v{}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "Store: {}, {} module(s), logs in {}",
        config.store.display(),
        config.modules.len(),
        config.log_dir.display()
    );

    let mut app = App::from_config(config)?;

    if args.events {
        let mut rx = app.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => println!("{}", event.to_json_line()),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Event printer fell behind, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    app.run().await
}

fn submit(config: &Config, args: SubmitArgs) -> Result<()> {
    if !config.modules.contains_key(&args.task_type) {
        log::warn!(
            "Task type {} has no module configured; it will fail when dispatched",
            args.task_type
        );
    }
    let params = match args.params {
        Some(raw) => serde_json::from_str(&raw).context("--params is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let store = JsonFileStore::new(config.store.clone());
    let task = store.insert_task(NewTask {
        task_type: args.task_type,
        creator: args.creator,
        params,
        eta_seconds: args.eta,
        worker: None,
    })?;

    println!("{}", task.id);
    Ok(())
}

fn list(config: &Config, args: ListArgs) -> Result<()> {
    let store = JsonFileStore::new(config.store.clone());
    let tasks = store.list_tasks(args.limit)?;

    println!(
        "{:>6}  {:>4}  {:<14}  {:>7}  {:>8}  MESSAGE",
        "ID", "TYPE", "STATUS", "FIELD", "PID"
    );
    for task in &tasks {
        let status = match task.state() {
            TaskState::Waiting { position } => format!("WAITING #{}", position),
            state => TaskStatus::from(state).to_string(),
        };
        let pid = task
            .process_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>6}  {:>4}  {:<14}  {:>7}  {:>8}  {}",
            task.id, task.task_type, status, task.status, pid, task.message
        );
    }

    let counts =
        StatusCounts::tally(tasks.iter().map(|t| TaskStatus::from(t.state())));
    println!("{}", counts);
    Ok(())
}

fn report(config: &Config, args: ReportArgs) -> Result<()> {
    let mut update = TaskUpdate::new();
    if args.finished {
        update = update.state(TaskState::Finished);
    }
    if args.failed {
        update = update.state(TaskState::Failed);
    }
    if let Some(message) = args.message {
        update = update.message(message);
    }
    if let Some(eta) = args.eta {
        update = update.eta_seconds(eta);
    }
    if let Some(output) = args.output {
        update = update.output(output);
    }
    if update == TaskUpdate::new() {
        bail!("Nothing to report; pass --finished, --failed, --message, --eta or --output");
    }

    let store = JsonFileStore::new(config.store.clone());
    if !store.update_task(args.id, &update) {
        bail!("Task {} could not be updated", args.id);
    }
    Ok(())
}
