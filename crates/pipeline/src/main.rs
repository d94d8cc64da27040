//! Taxi ETL pipeline binary.
//!
//! Runs the pipeline against the local lake under `TAXI_ETL_DATA_DIR`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taxi_pipeline::{
    parse_trigger_document, InputValidator, LocalJobClient, LocalStorage, LogNotifier, Notifier,
    PipelineConfig, PipelineOrchestrator, RunStatus, TriggerEvent, WebhookNotifier,
};
use taxi_quality::{QualityEngine, Record, RuleSet, RunId};

#[derive(Parser)]
#[command(name = "taxi-pipeline")]
#[command(version, about = "NYC taxi batch ETL pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for a trigger file
    ///
    /// The trigger file holds either one trigger object
    /// ({"bucket", "key", "size", "eventTime"}) or an object-store
    /// notification with a "Records" array. Ctrl-C cancels in-flight runs.
    #[command(verbatim_doc_comment)]
    Run {
        /// Path to the trigger JSON file
        #[arg(short, long)]
        trigger: PathBuf,

        /// Local lake root (overrides TAXI_ETL_DATA_DIR)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// YAML rule set (overrides TAXI_ETL_RULES_PATH)
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Validate a trigger without running any job
    CheckTrigger {
        /// Path to the trigger JSON file
        #[arg(short, long)]
        trigger: PathBuf,

        /// Local lake root (overrides TAXI_ETL_DATA_DIR)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Run the quality checks over a JSON-lines file and print the report
    Quality {
        /// JSON-lines input, one trip per line
        #[arg(short, long)]
        input: PathBuf,

        /// YAML rule set (defaults to the built-in taxi rules)
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taxi_pipeline=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn load_rules(path: Option<&Path>) -> Result<RuleSet> {
    match path {
        Some(path) => RuleSet::from_file(path)
            .with_context(|| format!("Failed to load rule set from {}", path.display())),
        None => Ok(RuleSet::taxi_default()),
    }
}

fn load_triggers(path: &Path) -> Result<Vec<TriggerEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trigger file {}", path.display()))?;
    let document: serde_json::Value =
        serde_json::from_str(&content).context("Trigger file is not valid JSON")?;
    let triggers = parse_trigger_document(document)?;
    if triggers.is_empty() {
        bail!("No object-created records in {}", path.display());
    }
    Ok(triggers)
}

async fn run(
    config: PipelineConfig,
    trigger_path: &Path,
    data_dir: Option<PathBuf>,
    rules_path: Option<PathBuf>,
) -> Result<()> {
    let triggers = load_triggers(trigger_path)?;
    let data_dir = data_dir.unwrap_or_else(|| config.data_dir.clone());
    let rules = load_rules(rules_path.or_else(|| config.rules_path.clone()).as_deref())?;

    let storage = Arc::new(LocalStorage::new(&data_dir));
    let jobs = Arc::new(LocalJobClient::new(
        storage.clone(),
        QualityEngine::new(Arc::new(rules)),
        config.transform_job_name.clone(),
    ));
    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(LogNotifier),
    };
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        config.orchestrator_config(),
        jobs,
        notifier,
        storage,
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, cancelling runs");
            shutdown.cancel();
        }
    });

    tracing::info!(runs = triggers.len(), data_dir = %data_dir.display(), "Starting pipeline runs");

    let mut runs = JoinSet::new();
    for trigger in triggers {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.child_token();
        runs.spawn(async move { orchestrator.run(trigger, cancel).await });
    }

    let mut summaries = Vec::new();
    while let Some(result) = runs.join_next().await {
        summaries.push(result.context("Pipeline run task failed")?);
    }

    println!("{}", serde_json::to_string_pretty(&summaries)?);

    let failed = summaries
        .iter()
        .filter(|s| !matches!(s.status, RunStatus::Success | RunStatus::PartialSuccess))
        .count();
    if failed > 0 {
        bail!("{} of {} run(s) did not succeed", failed, summaries.len());
    }
    Ok(())
}

async fn check_trigger(config: PipelineConfig, trigger_path: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    let triggers = load_triggers(trigger_path)?;
    let storage = LocalStorage::new(data_dir.unwrap_or_else(|| config.data_dir.clone()));
    let validator = InputValidator::new(config.validator_config());

    let mut all_valid = true;
    for trigger in &triggers {
        let report = validator.validate(trigger, &storage).await;
        all_valid &= report.is_valid();
        let output = serde_json::json!({
            "location": trigger.location(),
            "valid": report.is_valid(),
            "message": report.message(),
            "checks": report.checks,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    if !all_valid {
        bail!("Trigger validation failed");
    }
    Ok(())
}

fn quality(input: &Path, rules_path: Option<PathBuf>) -> Result<()> {
    let rules = load_rules(rules_path.as_deref())?;
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid record", input.display(), index + 1))?;
        records.push(record);
    }

    let engine = QualityEngine::new(Arc::new(rules));
    let outcome = engine.evaluate(records, &RunId::new(), chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            trigger,
            data_dir,
            rules,
        } => {
            let config = PipelineConfig::from_env()
                .and_then(PipelineConfig::for_local_lake)
                .context("Failed to load configuration")?;
            run(config, &trigger, data_dir, rules).await
        }
        Commands::CheckTrigger { trigger, data_dir } => {
            let config = PipelineConfig::from_env()
                .and_then(PipelineConfig::for_local_lake)
                .context("Failed to load configuration")?;
            check_trigger(config, &trigger, data_dir).await
        }
        Commands::Quality { input, rules } => quality(&input, rules),
    }
}
