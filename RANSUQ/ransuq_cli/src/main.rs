use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ransuq::{
    telemetry::RansuqTelemetry, MlTurb, Registry, RunConfig, RunSelection, RunSummary, ScalePredictor,
    Scheduler,
};
use serde::Serialize;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ransuq", version, about = "Machine-learned turbulence model pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generates data, trains (or reuses) a predictor and postprocesses it.
    Run(RunArgs),
    /// Lists every valid catalog key.
    Options {
        #[arg(long)]
        config: PathBuf,
    },
    /// Appends model predictions to a copy of a dataset file.
    Predict(PredictArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Training collection or dataset name.
    #[arg(long)]
    training: String,
    /// Testing collection or dataset name.
    #[arg(long)]
    testing: Option<String>,
    #[arg(long)]
    features: String,
    #[arg(long, default_value = "none")]
    weights: String,
    #[arg(long, default_value = "net_2_layer")]
    algorithm: String,
    #[arg(long, default_value = "standard")]
    convergence: String,
    /// Core budget for simulations; overrides the config file.
    #[arg(long)]
    cpus: Option<usize>,
    /// Ignore a cached predictor.
    #[arg(long)]
    retrain: bool,
    /// Fixed seed for the initial model parameters.
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Also write debug records to the log.
    #[arg(long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct PredictArgs {
    #[arg(long)]
    config: PathBuf,
    /// Persisted predictor file.
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    dataset: String,
    #[arg(long)]
    features: String,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct PredictSummary {
    dataset: String,
    rows: usize,
    columns: Vec<String>,
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let summary = handle_run(&args)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Options { config } => {
            let registry = Registry::new(load_config(&config)?);
            println!("{}", serde_json::to_string_pretty(&registry.options())?);
            Ok(())
        }
        Commands::Predict(args) => {
            let summary = handle_predict(&args)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn build_telemetry(args: &RunArgs) -> Result<Option<RansuqTelemetry>> {
    if args.log.is_none() && args.event_log.is_none() {
        return Ok(None);
    }
    let run_id = format!("run-{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), Uuid::new_v4().simple());
    let mut builder = RansuqTelemetry::builder("ransuq").run_id(run_id);
    if let Some(path) = &args.log {
        builder = builder.log_path(path.clone());
    }
    if args.verbose {
        builder = builder.min_level(LogLevel::Debug);
    }
    if let Some(path) = &args.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    builder.build().map(Some)
}

fn selection(args: &RunArgs) -> RunSelection {
    RunSelection {
        training: args.training.clone(),
        testing: args.testing.clone(),
        features: args.features.clone(),
        weights: args.weights.clone(),
        algorithm: args.algorithm.clone(),
        convergence: args.convergence.clone(),
        seed: args.seed,
    }
}

fn handle_run(args: &RunArgs) -> Result<RunSummary> {
    let config = load_config(&args.config)?;
    let telemetry = build_telemetry(args)?;
    let cores = args.cpus.or(config.cores);
    let mut scheduler = cores.map_or_else(Scheduler::detect, Scheduler::new);
    if let Some(tel) = &telemetry {
        scheduler = scheduler.with_telemetry(tel.clone());
    }
    let registry = Registry::new(config);
    let settings = registry.settings(&selection(args), &scheduler)?;
    let mut mlturb = MlTurb::new(settings).retrain(args.retrain);
    if let Some(tel) = telemetry {
        mlturb = mlturb.with_telemetry(tel);
    }
    let summary = mlturb.run().map_err(|err| {
        let phase = err.phase();
        anyhow::Error::new(err).context(format!("run failed in {phase:?} phase"))
    })?;
    let record = summary.save_path.join("summary.json");
    fs::write(&record, serde_json::to_vec_pretty(&summary)?)
        .with_context(|| format!("writing {}", record.display()))?;
    Ok(summary)
}

fn handle_predict(args: &PredictArgs) -> Result<PredictSummary> {
    let registry = Registry::new(load_config(&args.config)?);
    let features = registry.feature_set(&args.features)?.clone();
    let predictor = ScalePredictor::load(&args.model)?;
    if predictor.model().input_dim() != features.inputs.len()
        || predictor.model().output_dim() != features.outputs.len()
    {
        bail!(
            "predictor at {} does not match feature set {:?}",
            args.model.display(),
            args.features
        );
    }
    let dataset = registry.dataset(&args.dataset, &Scheduler::new(1))?;
    let Some(appendable) = dataset.format().as_appendable() else {
        bail!("dataset {} cannot be appended to", dataset.id());
    };
    let inputs = dataset.load(&features.inputs)?;
    let predicted = predictor.predict(inputs.view());
    let columns: Vec<String> = features.outputs.iter().map(|name| format!("ML_{name}")).collect();
    appendable.append_columns(dataset.source(), &args.output, &columns, predicted.view())?;
    eprintln!(
        "{}",
        json!({ "dataset": dataset.id(), "output": args.output, "columns": columns })
    );
    Ok(PredictSummary {
        dataset: dataset.id().to_string(),
        rows: predicted.nrows(),
        columns,
        output: args.output.clone(),
    })
}
