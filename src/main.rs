use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skillflow_core::config::AppConfig;
use skillflow_core::state::{ExecutionSummary, GraphState, WorkflowStatus};
use skillflow_core::traits::SchemaSource;
use skillflow_core::types::{ExecutionId, HumanFeedback};
use skillflow_engine::{compile, CheckpointStore, DirectorySchemaSource, WorkflowEngine};

#[derive(Parser)]
#[command(name = "skillflow", version, about = "Declarative multi-step extraction workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skillflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a schema over a document
    Run {
        /// Schema id (directory name under the schema dir)
        #[arg(short, long)]
        schema: String,
        /// Document text file; "-" reads stdin
        #[arg(short, long, default_value = "-")]
        document: String,
        /// Print progress events as JSON lines while running
        #[arg(long)]
        follow: bool,
    },
    /// Resume a paused or interrupted execution
    Resume {
        execution_id: String,
        /// JSON file with reviewer feedback or a bare corrections object
        #[arg(long)]
        feedback: Option<PathBuf>,
    },
    /// Show the summary of a persisted execution
    Status { execution_id: String },
    /// Print the persisted progress events of an execution
    Events { execution_id: String },
    /// Compile a schema and print its execution plan
    Plan {
        #[arg(short, long)]
        schema: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "skillflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { schema } => {
            let source = DirectorySchemaSource::new(config.schema_dir());
            let definition = source.load(&schema).await?;
            let plan = compile(&definition)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Status { execution_id } => {
            let store = open_store(&config)?;
            let state = store.load(&ExecutionId::from_str(&execution_id))?;
            print_summary(&state)?;
        }
        Commands::Events { execution_id } => {
            let store = open_store(&config)?;
            let state = store.load(&ExecutionId::from_str(&execution_id))?;
            for event in &state.progress_events {
                println!("{}", serde_json::to_string(event)?);
            }
        }
        Commands::Run {
            schema,
            document,
            follow,
        } => {
            let engine = build_engine(&config)?;
            let text = read_document(&document)?;
            let state = if follow {
                let id = engine.start(text, &schema).await?;
                follow_events(&engine, &id).await?;
                engine.wait(&id).await?
            } else {
                engine.execute(text, &schema).await?
            };
            print_summary(&state)?;
            exit_for(&state);
        }
        Commands::Resume {
            execution_id,
            feedback,
        } => {
            let engine = build_engine(&config)?;
            let feedback = feedback.as_deref().map(read_feedback).transpose()?;
            let state = engine
                .resume(&ExecutionId::from_str(&execution_id), feedback)
                .await?;
            print_summary(&state)?;
            exit_for(&state);
        }
        // Handled before config loading.
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path)?)
    } else {
        eprintln!(
            "Warning: {} not found, using defaults",
            path.display()
        );
        Ok(AppConfig::default())
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<CheckpointStore>> {
    let store = CheckpointStore::from_config(&config.checkpoint, &config.checkpoint_path())
        .with_context(|| format!("opening checkpoints at {}", config.checkpoint_path().display()))?;
    Ok(Arc::new(store))
}

fn build_engine(config: &AppConfig) -> anyhow::Result<Arc<WorkflowEngine>> {
    let Some(ref inference) = config.inference else {
        bail!("no [inference] section in config; set inference.endpoint to run skills");
    };
    let client = skillflow_inference::create_client(inference)?;
    let source = Arc::new(DirectorySchemaSource::new(config.schema_dir()));
    let store = open_store(config)?;

    info!(
        endpoint = %inference.endpoint,
        schemas = %config.schema_dir().display(),
        max_concurrent_skills = config.engine.max_concurrent_skills,
        "Engine ready"
    );
    Ok(Arc::new(WorkflowEngine::new(
        config.engine.clone(),
        config.retry.clone(),
        client,
        source,
        store,
    )))
}

fn read_document(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading document {}", path))
    }
}

/// Accepts `{"corrections": {...}, "reviewer": ...}` or a bare corrections object.
fn read_feedback(path: &Path) -> anyhow::Result<HumanFeedback> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading feedback {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) if map.contains_key("corrections") => {
            Ok(serde_json::from_value(Value::Object(map))?)
        }
        Value::Object(map) => Ok(HumanFeedback::with_corrections(map)),
        _ => bail!("feedback must be a JSON object"),
    }
}

async fn follow_events(engine: &WorkflowEngine, id: &ExecutionId) -> anyhow::Result<()> {
    let mut events = engine.stream_events(id)?;
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn print_summary(state: &GraphState) -> anyhow::Result<()> {
    let summary = ExecutionSummary::from_state(state);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if state.status == WorkflowStatus::AwaitingHumanReview {
        eprintln!(
            "Execution {} awaits review. Resume with: skillflow resume {} --feedback <file>",
            state.execution_id, state.execution_id
        );
    }
    Ok(())
}

fn exit_for(state: &GraphState) {
    if state.status == WorkflowStatus::Failed {
        warn!(
            execution_id = %state.execution_id,
            reason = state.failure.as_deref().unwrap_or("unknown"),
            "Execution failed"
        );
        std::process::exit(1);
    }
}
