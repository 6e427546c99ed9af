#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Machine-learned turbulence-model pipeline: dataset generation through a
//! core-budgeted scheduler, concurrent feature loading, predictor training,
//! and postprocessing of training and held-out data.

/// Structured logging and event telemetry.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Aggregated errors from concurrent fan-outs.
#[path = "../error.rs"]
pub mod error;

/// Core-budgeted job scheduler.
#[path = "../scheduler.rs"]
pub mod scheduler;

/// Dataset capability traits.
#[path = "../dataset.rs"]
pub mod dataset;

/// Solver-backed datasets and comparison runs.
#[path = "../simulation.rs"]
pub mod simulation;

/// Feature requests and concurrent training-data loading.
#[path = "../load.rs"]
pub mod load;

/// Scaling, models, optimisation and predictor persistence.
#[path = "../trainer/main.rs"]
pub mod trainer;

/// TOML run configuration.
#[path = "../config.rs"]
pub mod config;

/// Named catalogs resolved into run settings.
#[path = "../registry.rs"]
pub mod registry;

/// Predictor evaluation reports.
#[path = "../postprocess.rs"]
pub mod postprocess;

/// End-to-end run sequencing.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

pub use config::{ConfigError, RunConfig};
pub use dataset::{Comparable, Dataset, DatasetError, FileDataset, Generatable, PostProcessor};
pub use error::AggregateError;
pub use load::{load_data, load_training_data, FeatureRequest, LoadDataError, LoadedData, WeightFunction};
pub use orchestrator::{MlTurb, RunError, RunPhase, RunSummary};
pub use postprocess::{PostProcessReport, Role};
pub use registry::{Registry, RegistryError, RunSelection, Settings};
pub use scheduler::{Job, Scheduler, SchedulerError};
pub use simulation::{SimulationDataset, SimulationJob};
pub use telemetry::RansuqTelemetry;
pub use trainer::{persist::ScalePredictor, Trainer, TrainerConfig, TrainerError};
