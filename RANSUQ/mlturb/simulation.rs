use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use ransuq_dataloader::{Format, RestartFormat};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{Comparable, Dataset, DatasetError, Generatable, PostProcessor},
    scheduler::{Job, JobFailure, Scheduler},
};

/// Features compared between a baseline run and its model-driven counterpart.
pub const COMPARED_FEATURES: [&str; 4] = ["NuHat", "UVel", "VVel", "Pressure"];

/// External solver invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationJob {
    /// Executable.
    pub program: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; created if missing.
    pub workdir: PathBuf,
    /// Cores the solver occupies.
    #[serde(default = "default_cores")]
    pub cores: usize,
}

const fn default_cores() -> usize {
    1
}

impl SimulationJob {
    /// Wraps the invocation as a scheduler job; solver output goes to `<workdir>/<id>.solver.log`.
    #[must_use]
    pub fn into_job(self, id: &str) -> Job {
        let log_name = format!("{id}.solver.log");
        Job::new(id, self.cores, move || {
            let launch = |source| JobFailure::Launch {
                program: self.program.clone(),
                source,
            };
            fs::create_dir_all(&self.workdir).map_err(launch)?;
            let log = File::create(self.workdir.join(&log_name)).map_err(launch)?;
            let log_err = log.try_clone().map_err(launch)?;
            let status = Command::new(&self.program)
                .args(&self.args)
                .current_dir(&self.workdir)
                .stdin(Stdio::null())
                .stdout(log)
                .stderr(log_err)
                .status()
                .map_err(launch)?;
            if status.success() {
                Ok(())
            } else {
                Err(JobFailure::Exit {
                    program: self.program.clone(),
                    status: status.to_string(),
                })
            }
        })
    }
}

fn run_simulation(
    scheduler: &Scheduler,
    id: &str,
    job: &SimulationJob,
    output: &Path,
) -> Result<(), DatasetError> {
    let outcome = scheduler
        .run(job.clone().into_job(id))
        .map_err(|source| DatasetError::Schedule {
            id: id.to_string(),
            source,
        })?;
    outcome.result.map_err(|source| DatasetError::Simulation {
        id: id.to_string(),
        source,
    })?;
    if output.exists() {
        Ok(())
    } else {
        Err(DatasetError::NotGenerated {
            id: id.to_string(),
            path: output.to_path_buf(),
        })
    }
}

/// Restart-file data that a solver run produces on demand.
#[derive(Debug, Clone)]
pub struct SimulationDataset {
    id: String,
    restart: PathBuf,
    job: SimulationJob,
    comparison_args: Option<Vec<String>>,
    scheduler: Scheduler,
    format: Arc<RestartFormat>,
}

impl SimulationDataset {
    /// Creates a dataset whose restart file is written by `job`.
    pub fn new(
        id: impl Into<String>,
        restart: impl Into<PathBuf>,
        job: SimulationJob,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            id: id.into(),
            restart: restart.into(),
            job,
            comparison_args: None,
            scheduler,
            format: Arc::new(RestartFormat::new()),
        }
    }

    /// Enables comparison runs. `{model}`, `{features}` and `{output}` in the
    /// arguments are substituted when a comparison is spawned.
    #[must_use]
    pub fn with_comparison_args(mut self, args: Vec<String>) -> Self {
        self.comparison_args = Some(args);
        self
    }
}

impl Dataset for SimulationDataset {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> &dyn Format {
        self.format.as_ref()
    }

    fn source(&self) -> &Path {
        &self.restart
    }

    fn as_generatable(&self) -> Option<&dyn Generatable> {
        Some(self)
    }

    fn as_comparable(&self) -> Option<&dyn Comparable> {
        self.comparison_args.as_ref().map(|_| self as &dyn Comparable)
    }
}

impl Generatable for SimulationDataset {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_generated(&self) -> bool {
        self.restart.exists()
    }

    fn run(&self) -> Result<(), DatasetError> {
        run_simulation(&self.scheduler, &self.id, &self.job, &self.restart)
    }
}

fn substitute(arg: &str, model: &Path, features: &str, output: &Path) -> String {
    arg.replace("{model}", &model.display().to_string())
        .replace("{features}", features)
        .replace("{output}", &output.display().to_string())
}

impl Comparable for SimulationDataset {
    fn spawn_comparison(
        &self,
        model_path: &Path,
        output: &Path,
        feature_set: &str,
    ) -> Result<Box<dyn Generatable>, DatasetError> {
        let template = self.comparison_args.as_deref().unwrap_or_default();
        let args = template
            .iter()
            .map(|arg| substitute(arg, model_path, feature_set, output))
            .collect();
        let file_name = self
            .restart
            .file_name()
            .map_or_else(|| "restart_flow.dat".into(), ToOwned::to_owned);
        Ok(Box::new(ComparisonRun {
            id: format!("{}-comparison", self.id),
            baseline: self.restart.clone(),
            restart: output.join(file_name),
            output: output.to_path_buf(),
            job: SimulationJob {
                program: self.job.program.clone(),
                args,
                workdir: output.to_path_buf(),
                cores: self.job.cores,
            },
            scheduler: self.scheduler.clone(),
            format: Arc::clone(&self.format),
        }))
    }
}

/// A solver run driven by a trained predictor, compared against its baseline.
#[derive(Debug)]
pub struct ComparisonRun {
    id: String,
    baseline: PathBuf,
    restart: PathBuf,
    output: PathBuf,
    job: SimulationJob,
    scheduler: Scheduler,
    format: Arc<RestartFormat>,
}

/// Difference between baseline and comparison for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDifference {
    /// Logical feature.
    pub feature: String,
    /// Root-mean-square difference over all points.
    pub rms: f64,
    /// Largest absolute pointwise difference.
    pub max_abs: f64,
}

/// Written to `comparison.json` in the comparison output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Comparison run identifier.
    pub run: String,
    /// Baseline restart file.
    pub baseline: PathBuf,
    /// Comparison restart file.
    pub comparison: PathBuf,
    /// Mesh points compared.
    pub points: usize,
    /// Per-feature differences.
    pub fields: Vec<FieldDifference>,
}

impl Generatable for ComparisonRun {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_generated(&self) -> bool {
        self.restart.exists()
    }

    fn run(&self) -> Result<(), DatasetError> {
        run_simulation(&self.scheduler, &self.id, &self.job, &self.restart)
    }

    fn as_post_processor(&self) -> Option<&dyn PostProcessor> {
        Some(self)
    }
}

impl PostProcessor for ComparisonRun {
    fn post_process(&self) -> Result<(), DatasetError> {
        let features: Vec<String> = COMPARED_FEATURES.iter().map(ToString::to_string).collect();
        let load = |path: &Path| {
            ransuq_dataloader::load_features(self.format.as_ref(), path, &features).map_err(
                |source| DatasetError::Load {
                    id: self.id.clone(),
                    source,
                },
            )
        };
        let baseline = load(&self.baseline)?;
        let comparison = load(&self.restart)?;
        if baseline.nrows() != comparison.nrows() {
            return Err(DatasetError::PointCountMismatch {
                id: self.id.clone(),
                baseline: baseline.nrows(),
                comparison: comparison.nrows(),
            });
        }
        let points = baseline.nrows();
        let fields = features
            .iter()
            .enumerate()
            .map(|(col, feature)| {
                let diff = &comparison.column(col) - &baseline.column(col);
                let rms = if points == 0 {
                    0.0
                } else {
                    (diff.mapv(|d| d * d).sum() / points as f64).sqrt()
                };
                let max_abs = diff.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
                FieldDifference {
                    feature: feature.clone(),
                    rms,
                    max_abs,
                }
            })
            .collect();
        let report = ComparisonReport {
            run: self.id.clone(),
            baseline: self.baseline.clone(),
            comparison: self.restart.clone(),
            points,
            fields,
        };
        let path = self.output.join("comparison.json");
        let body = serde_json::to_vec_pretty(&report).map_err(|source| DatasetError::Json {
            id: self.id.clone(),
            source,
        })?;
        fs::write(&path, body).map_err(|source| DatasetError::Io {
            id: self.id.clone(),
            path,
            source,
        })
    }
}
