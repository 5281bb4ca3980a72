use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowline_actions::builtin::LogHandler;
use flowline_actions::ActionDispatcher;
use flowline_core::config::{AppConfig, StoreBackend};
use flowline_core::event::EventBus;
use flowline_core::run::{RunId, RunStatus};
use flowline_core::traits::{DefinitionStore, RunStore};
use flowline_core::workflow::{NodeConfig, WorkflowDefinition, WorkflowStatus};
use flowline_engine::{
    read_definition, validate, CronTriggers, Engine, RunLogger, WorkflowRegistry,
};
use flowline_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "flowline", version, about = "Client onboarding workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowline.toml", env = "FLOWLINE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check workflow definition files for structural errors
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Execute a single workflow file in-process and print the finished run
    Run {
        /// Workflow definition (.json or .toml)
        file: PathBuf,
        /// Trigger type (defaults to the trigger node's event)
        #[arg(long)]
        trigger: Option<String>,
        /// Trigger payload as inline JSON
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,
        /// Trigger payload read from a JSON file
        #[arg(long)]
        payload_file: Option<PathBuf>,
        /// Seconds to wait for the run to finish
        #[arg(long, default_value = "300")]
        timeout: u64,
        /// Log instead of failing for action types without a handler
        #[arg(long)]
        stub: bool,
    },
    /// Run the engine, firing triggers read as JSON lines from stdin
    Serve,
    /// List stored workflow definitions
    Workflows {
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },
    /// List the runs of a workflow
    Runs {
        workflow_id: String,
        #[arg(long)]
        status: Option<RunStatus>,
    },
    /// Print one run as JSON
    Show { run_id: String },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// One line of `serve` input.
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Intake {
    Fire {
        workflow: String,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default)]
        payload: Map<String, Value>,
    },
    Cancel {
        run_id: String,
    },
}

struct Stores {
    runs: Arc<dyn RunStore>,
    definitions: Arc<dyn DefinitionStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("FLOWLINE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("flowline=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowline", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate { files } => validate_files(&files),
        Commands::Run {
            file,
            trigger,
            payload,
            payload_file,
            timeout,
            stub,
        } => {
            let payload = read_payload(payload.as_deref(), payload_file.as_deref())?;
            run_file(&config, &file, trigger, payload, Duration::from_secs(timeout), stub).await
        }
        Commands::Serve => serve(config).await,
        Commands::Workflows { status } => {
            let stores = open_stores(&config)?;
            let mut defs = stores.definitions.list_definitions().await?;
            defs.retain(|d| status.map_or(true, |s| d.status == s));
            defs.sort_by(|a, b| a.id.cmp(&b.id));
            if defs.is_empty() {
                println!("No workflows.");
            }
            for def in defs {
                println!(
                    "{:<32} {:<9} v{:<4} {}",
                    def.id, def.status, def.version, def.name
                );
            }
            Ok(())
        }
        Commands::Runs {
            workflow_id,
            status,
        } => {
            let stores = open_stores(&config)?;
            let runs = stores.runs.list_runs(&workflow_id, status).await?;
            if runs.is_empty() {
                println!("No runs.");
            }
            for run in runs {
                println!(
                    "{}  {:<9}  {}  {}",
                    run.id,
                    run.status,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Show { run_id } => {
            let stores = open_stores(&config)?;
            let run = stores
                .runs
                .load_run(&RunId::from_string(&run_id))
                .await?
                .with_context(|| format!("run {} not found", run_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn validate_files(files: &[PathBuf]) -> anyhow::Result<()> {
    let mut failed = 0;
    for file in files {
        match read_definition(file).and_then(|def| validate(&def).map(|_| def)) {
            Ok(def) => println!(
                "ok    {} ({}: {} nodes, {} edges)",
                file.display(),
                def.id,
                def.nodes.len(),
                def.edges.len()
            ),
            Err(e) => {
                failed += 1;
                println!("FAIL  {}: {}", file.display(), e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} definitions invalid", failed, files.len());
    }
    Ok(())
}

fn read_payload(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Map<String, Value>> {
    let raw = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };
    let value: Value = serde_json::from_str(&raw).context("parsing payload")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("payload must be a JSON object"),
    }
}

/// Action types used by a definition, deduplicated.
fn action_types(def: &WorkflowDefinition) -> Vec<String> {
    let mut kinds: Vec<String> = def
        .nodes
        .iter()
        .filter_map(|n| match &n.config {
            NodeConfig::Action(action) => Some(action.action_type.clone()),
            _ => None,
        })
        .collect();
    kinds.sort();
    kinds.dedup();
    kinds
}

async fn run_file(
    config: &AppConfig,
    file: &Path,
    trigger: Option<String>,
    payload: Map<String, Value>,
    timeout: Duration,
    stub: bool,
) -> anyhow::Result<()> {
    let def = read_definition(file)?;
    let workflow_id = def.id.clone();
    let trigger = match trigger {
        Some(t) => t,
        None => default_trigger(&def)?,
    };

    let mut dispatcher = ActionDispatcher::with_builtins(&config.handlers);
    if stub {
        for kind in action_types(&def) {
            if dispatcher.get(&kind).is_none() {
                warn!(kind = %kind, "No handler registered, stubbing with log");
                dispatcher.register(kind, LogHandler);
            }
        }
    }

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(WorkflowRegistry::new(store.clone()));
    registry.load().await?;
    registry.create(def).await?;
    registry.activate(&workflow_id).await?;

    let engine = Engine::new(
        config.engine.clone(),
        registry,
        Arc::new(dispatcher),
        store,
        Arc::new(EventBus::new(config.engine.event_capacity)),
    );
    let cancel = CancellationToken::new();
    engine.start(cancel.clone()).await?;

    let run_id = engine.fire(&workflow_id, &trigger, payload).await?;
    let result = engine.wait_for_completion(&run_id, timeout).await;
    cancel.cancel();

    let run = result.with_context(|| format!("waiting for run {}", run_id))?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.status != RunStatus::Completed {
        anyhow::bail!(
            "run {} {}: {}",
            run.id,
            run.status,
            run.error_message.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let stores = open_stores(&config)?;
    let registry = Arc::new(WorkflowRegistry::new(stores.definitions));
    registry.load().await?;

    let dir = config.workflows_dir();
    if dir.is_dir() {
        let imported = registry
            .import_dir(&dir, config.workflows.activate_on_import)
            .await?;
        info!(count = imported.len(), dir = %dir.display(), "Imported workflow definitions");
    }

    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let dispatcher = Arc::new(ActionDispatcher::with_builtins(&config.handlers));
    let engine = Engine::new(
        config.engine.clone(),
        registry,
        dispatcher,
        stores.runs,
        event_bus.clone(),
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    if let Some(log_dir) = config.log_dir() {
        let logger = RunLogger::new(log_dir, &event_bus);
        tokio::spawn(logger.run(cancel.clone()));
    }

    engine.start(cancel.clone()).await?;
    tokio::spawn(CronTriggers::new(engine.clone(), cancel.clone()).run());
    info!("Flowline engine running");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        println!("{}", handle_intake(&engine, line).await);
                    }
                }
                Ok(None) => {
                    info!("Input closed, serving until interrupted");
                    cancel.cancelled().await;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    }

    info!("Flowline stopped");
    Ok(())
}

async fn handle_intake(engine: &Engine, line: &str) -> Value {
    let intake: Intake = match serde_json::from_str(line) {
        Ok(intake) => intake,
        Err(e) => return json!({ "error": format!("invalid input: {}", e) }),
    };

    match intake {
        Intake::Fire {
            workflow,
            trigger,
            payload,
        } => {
            let trigger = match trigger {
                Some(t) => t,
                None => match engine.registry().get(&workflow).await {
                    Ok(def) => match default_trigger(&def) {
                        Ok(t) => t,
                        Err(e) => return json!({ "error": e.to_string() }),
                    },
                    Err(e) => return json!({ "error": e.to_string() }),
                },
            };
            match engine.fire(&workflow, &trigger, payload).await {
                Ok(run_id) => json!({ "run_id": run_id }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Intake::Cancel { run_id } => {
            let run_id = RunId::from_string(&run_id);
            match engine.cancel(&run_id).await {
                Ok(()) => json!({ "cancelled": run_id }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
    }
}

/// The trigger type a run gets when none is given.
fn default_trigger(def: &WorkflowDefinition) -> anyhow::Result<String> {
    match def.trigger().map(|n| &n.config) {
        Some(NodeConfig::Trigger(t)) if t.event != "*" => Ok(t.event.clone()),
        Some(_) => Ok("manual".to_string()),
        None => anyhow::bail!("workflow '{}' has no trigger node", def.id),
    }
}

fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            let path = config.store_path();
            let store = Arc::new(
                SqliteStore::open(&path).with_context(|| format!("opening {}", path.display()))?,
            );
            info!(path = %path.display(), "Using sqlite store");
            Ok(Stores {
                runs: store.clone(),
                definitions: store,
            })
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                runs: store.clone(),
                definitions: store,
            })
        }
    }
}
