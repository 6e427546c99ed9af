//! Run sequencing: generate, load, train or reuse, then postprocess and compare.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Instant,
};

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    dataset::{Dataset, DatasetError},
    error::{collect_all, AggregateError},
    load::{load_training_data, LoadDataError, LoadedData},
    postprocess::{post_process_all, PostProcessError, PostProcessReport, Role},
    registry::Settings,
    telemetry::{self, RansuqTelemetry},
    trainer::{
        persist::{PersistError, ScalePredictor},
        Trainer, TrainerError, TrainingDiagnostics,
    },
};

/// Stage of a run, as reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Settings validation.
    Settings,
    /// Training data generation.
    Generation,
    /// Training data loading.
    Loading,
    /// Predictor fitting.
    Training,
    /// Predictor save or reload.
    Persistence,
    /// Per-dataset evaluation.
    PostProcessing,
    /// Model-driven comparison simulations.
    Comparison,
    /// Both postprocessing and comparisons.
    Finishing,
}

/// A failed run, by phase.
#[derive(Debug, Error)]
pub enum RunError {
    /// The settings cannot describe a run.
    #[error("invalid settings: {reason}")]
    InvalidSettings {
        /// What is wrong.
        reason: String,
    },
    /// One or more training datasets could not be generated.
    #[error("generating training data: {0}")]
    Generation(#[source] AggregateError<DatasetError>),
    /// Training data could not be loaded.
    #[error("loading training data: {0}")]
    Loading(#[source] LoadDataError),
    /// Fitting failed.
    #[error("training: {0}")]
    Training(#[source] TrainerError),
    /// The predictor could not be saved or reloaded.
    #[error("predictor persistence: {0}")]
    Persistence(#[source] PersistError),
    /// Evaluation failed on one or more datasets.
    #[error("postprocessing: {0}")]
    PostProcessing(#[source] AggregateError<PostProcessError>),
    /// One or more comparison simulations failed.
    #[error("comparison runs: {0}")]
    Comparison(#[source] AggregateError<DatasetError>),
    /// Postprocessing and comparisons both failed.
    #[error("postprocessing: {postprocessing}\ncomparison runs: {comparison}")]
    Finishing {
        /// Postprocessing failures.
        postprocessing: AggregateError<PostProcessError>,
        /// Comparison failures.
        comparison: AggregateError<DatasetError>,
    },
}

impl RunError {
    /// Phase the run failed in.
    #[must_use]
    pub const fn phase(&self) -> RunPhase {
        match self {
            Self::InvalidSettings { .. } => RunPhase::Settings,
            Self::Generation(_) => RunPhase::Generation,
            Self::Loading(_) => RunPhase::Loading,
            Self::Training(_) => RunPhase::Training,
            Self::Persistence(_) => RunPhase::Persistence,
            Self::PostProcessing(_) => RunPhase::PostProcessing,
            Self::Comparison(_) => RunPhase::Comparison,
            Self::Finishing { .. } => RunPhase::Finishing,
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Telemetry run id, if any.
    pub run_id: Option<String>,
    /// Result directory.
    pub save_path: PathBuf,
    /// Persisted predictor.
    pub predictor_path: PathBuf,
    /// False when a cached predictor was reused.
    pub trained: bool,
    /// Training rows across all training datasets.
    pub training_samples: usize,
    /// Present when a predictor was trained.
    pub diagnostics: Option<TrainingDiagnostics>,
    /// One report per evaluated dataset.
    pub reports: Vec<PostProcessReport>,
    /// Output directories of comparison runs.
    pub comparisons: Vec<PathBuf>,
    /// Testing datasets that were skipped, with the reason.
    pub warnings: Vec<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Elapsed seconds.
    pub wall_time_secs: f64,
}

/// Runs the full pipeline for one [`Settings`].
#[derive(Debug)]
pub struct MlTurb {
    settings: Settings,
    telemetry: Option<RansuqTelemetry>,
    retrain: bool,
}

impl MlTurb {
    /// Creates the orchestrator.
    #[must_use]
    pub const fn new(settings: Settings) -> Self {
        Self {
            settings,
            telemetry: None,
            retrain: false,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RansuqTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Ignores a cached predictor when set.
    #[must_use]
    pub const fn retrain(mut self, retrain: bool) -> Self {
        self.retrain = retrain;
        self
    }

    /// Resolved settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    fn validate(&self) -> Result<(), RunError> {
        let invalid = |reason: &str| RunError::InvalidSettings {
            reason: reason.to_string(),
        };
        if self.settings.training.is_empty() {
            return Err(invalid("no training datasets"));
        }
        if self.settings.request.inputs.is_empty() {
            return Err(invalid("no input features"));
        }
        if self.settings.request.outputs.is_empty() {
            return Err(invalid("no output features"));
        }
        self.settings
            .request
            .validate()
            .map_err(|err| invalid(&err.to_string()))
    }

    /// Runs every phase.
    ///
    /// Training and testing data are generated concurrently and both finish
    /// before a training-generation failure is returned. Testing datasets that
    /// fail to generate are skipped later and listed in the summary's warnings.
    ///
    /// # Panics
    /// Panics when loaded matrices disagree with the requested features.
    pub fn run(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let tel = self.telemetry.as_ref();
        let settings = &self.settings;
        self.validate()?;
        telemetry::event(
            tel,
            "mlturb.started",
            json!({
                "save_path": settings.save_path,
                "training": ids(&settings.training),
                "testing": ids(&settings.testing),
            }),
        );

        let (training_gen, testing_gen) = thread::scope(|scope| {
            let testing = scope.spawn(|| generate_all(&settings.testing, tel));
            let training = generate_all(&settings.training, tel);
            let testing = testing
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (training, testing)
        });
        let mut warnings = Vec::new();
        let mut skipped = HashSet::new();
        for (id, result) in testing_gen {
            if let Err(err) = result {
                telemetry::log(
                    tel,
                    LogLevel::Warn,
                    "mlturb.testing.generation_failed",
                    json!({ "dataset": id, "error": err.to_string() }),
                );
                warnings.push(format!("testing dataset {id} skipped: {err}"));
                skipped.insert(id);
            }
        }
        collect_all(training_gen).map_err(RunError::Generation)?;
        telemetry::event(tel, "mlturb.generation.completed", json!({ "skipped": skipped }));

        let mut data =
            load_training_data(&settings.training, &settings.request, tel).map_err(RunError::Loading)?;
        check_shapes(&data, settings);
        let training_samples = data.len();

        let predictor_path = settings.predictor_path();
        let diagnostics = if !self.retrain && predictor_path.exists() {
            telemetry::event(tel, "mlturb.training.cached", json!({ "predictor": predictor_path }));
            None
        } else {
            Some(self.train(&mut data, &predictor_path)?)
        };
        let predictor = ScalePredictor::load(&predictor_path).map_err(RunError::Persistence)?;
        check_predictor(&predictor, settings).map_err(RunError::Persistence)?;

        let testing: Vec<&Arc<dyn Dataset>> = settings
            .testing
            .iter()
            .filter(|dataset| !skipped.contains(dataset.id()))
            .collect();
        let evaluated: Vec<(Role, Arc<dyn Dataset>)> = settings
            .training
            .iter()
            .map(|dataset| (Role::Training, Arc::clone(dataset)))
            .chain(testing.iter().map(|dataset| (Role::Testing, Arc::clone(dataset))))
            .collect();
        let report_dir = settings.save_path.join("postprocess");
        let (post, comparisons) = thread::scope(|scope| {
            let comparisons = scope.spawn(|| self.run_comparisons(&testing, &predictor_path));
            let post = post_process_all(&predictor, &settings.request, &evaluated, &report_dir, tel);
            let comparisons = comparisons
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (post, comparisons)
        });
        let (reports, comparisons) = match (post, comparisons) {
            (Ok(reports), Ok(comparisons)) => (reports, comparisons),
            (Err(postprocessing), Ok(_)) => return Err(RunError::PostProcessing(postprocessing)),
            (Ok(_), Err(comparison)) => return Err(RunError::Comparison(comparison)),
            (Err(postprocessing), Err(comparison)) => {
                return Err(RunError::Finishing {
                    postprocessing,
                    comparison,
                })
            }
        };

        let summary = RunSummary {
            run_id: tel.and_then(RansuqTelemetry::run_id).map(ToString::to_string),
            save_path: settings.save_path.clone(),
            predictor_path,
            trained: diagnostics.is_some(),
            training_samples,
            diagnostics,
            reports,
            comparisons,
            warnings,
            started_at,
            wall_time_secs: started.elapsed().as_secs_f64(),
        };
        telemetry::event(
            tel,
            "mlturb.finished",
            json!({ "trained": summary.trained, "wall_time_secs": summary.wall_time_secs }),
        );
        Ok(summary)
    }

    fn train(&self, data: &mut LoadedData, predictor_path: &Path) -> Result<TrainingDiagnostics, RunError> {
        let mut trainer = Trainer::new(self.settings.trainer.clone());
        if let Some(tel) = &self.telemetry {
            trainer = trainer.with_telemetry(tel.clone());
        }
        let LoadedData {
            inputs,
            outputs,
            weights,
        } = data;
        let (predictor, diagnostics) = trainer
            .train(inputs, outputs, weights.as_ref().map(Array1::view))
            .map_err(RunError::Training)?;
        predictor.save(predictor_path).map_err(RunError::Persistence)?;
        let record = self.settings.save_path.join("settings.json");
        let body = serde_json::to_vec_pretty(&json!({
            "selection": self.settings.selection,
            "trainer": self.settings.trainer,
            "diagnostics": diagnostics,
        }))
        .map_err(|source| {
            RunError::Persistence(PersistError::Json {
                path: record.clone(),
                source,
            })
        })?;
        fs::write(&record, body).map_err(|source| {
            RunError::Persistence(PersistError::Io {
                path: record.clone(),
                source,
            })
        })?;
        telemetry::event(
            self.telemetry.as_ref(),
            "mlturb.training.finished",
            json!({ "evaluations": diagnostics.evaluations, "objective": diagnostics.objective }),
        );
        Ok(diagnostics)
    }

    /// Spawns, runs and postprocesses a comparison for every comparable
    /// testing dataset, concurrently.
    fn run_comparisons(
        &self,
        datasets: &[&Arc<dyn Dataset>],
        predictor_path: &Path,
    ) -> Result<Vec<PathBuf>, AggregateError<DatasetError>> {
        let root = self.settings.save_path.join("comparison");
        let feature_set = self.settings.feature_set.as_str();
        let results = thread::scope(|scope| {
            let handles: Vec<_> = datasets
                .iter()
                .filter_map(|dataset| dataset.as_comparable().map(|comparable| (dataset.id(), comparable)))
                .map(|(id, comparable)| {
                    let output = root.join(id);
                    let handle = scope.spawn(move || -> Result<PathBuf, DatasetError> {
                        let run = comparable.spawn_comparison(predictor_path, &output, feature_set)?;
                        if !run.is_generated() {
                            run.run()?;
                        }
                        if let Some(post) = run.as_post_processor() {
                            post.post_process()?;
                        }
                        Ok(output)
                    });
                    (id, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                    (id.to_string(), result)
                })
                .collect::<Vec<_>>()
        });
        collect_all(results)
    }
}

fn ids(datasets: &[Arc<dyn Dataset>]) -> Vec<&str> {
    datasets.iter().map(|dataset| dataset.id()).collect()
}

/// Runs every not-yet-generated dataset concurrently; one result per run.
fn generate_all(
    datasets: &[Arc<dyn Dataset>],
    tel: Option<&RansuqTelemetry>,
) -> Vec<(String, Result<(), DatasetError>)> {
    thread::scope(|scope| {
        let handles: Vec<_> = datasets
            .iter()
            .filter_map(|dataset| dataset.as_generatable())
            .filter(|generatable| !generatable.is_generated())
            .map(|generatable| {
                telemetry::log(
                    tel,
                    LogLevel::Info,
                    "mlturb.generation.started",
                    json!({ "dataset": generatable.id() }),
                );
                (generatable.id(), scope.spawn(move || generatable.run()))
            })
            .collect();
        handles
            .into_iter()
            .map(|(id, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                (id.to_string(), result)
            })
            .collect()
    })
}

/// A cached predictor may come from another feature set.
fn check_predictor(predictor: &ScalePredictor, settings: &Settings) -> Result<(), PersistError> {
    let widths = [
        ("predictor inputs", settings.request.inputs.len(), predictor.input_dim()),
        ("predictor outputs", settings.request.outputs.len(), predictor.output_dim()),
    ];
    for (part, expected, found) in widths {
        if expected != found {
            return Err(PersistError::Dimension {
                part,
                expected,
                found,
            });
        }
    }
    Ok(())
}

fn check_shapes(data: &LoadedData, settings: &Settings) {
    let rows = data.inputs.nrows();
    assert_eq!(data.outputs.nrows(), rows, "input and output sample counts differ");
    assert_eq!(
        data.inputs.ncols(),
        settings.request.inputs.len(),
        "input columns differ from requested inputs"
    );
    assert_eq!(
        data.outputs.ncols(),
        settings.request.outputs.len(),
        "output columns differ from requested outputs"
    );
    if let Some(weights) = &data.weights {
        assert_eq!(weights.len(), rows, "weight count differs from sample count");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::FileDataset,
        load::FeatureRequest,
        postprocess::report_path,
        registry::{RunSelection, PREDICTOR_FILE},
        scheduler::Scheduler,
        simulation::{SimulationDataset, SimulationJob},
        trainer::{
            model::{LinearModel, Model, Trainable},
            scaler::Scaler,
            Algorithm, TrainerConfig,
        },
    };
    use ransuq_dataloader::CsvFormat;
    use tempfile::tempdir;

    fn csv(dir: &Path, id: &str, rows: &[(f64, f64)]) -> Arc<dyn Dataset> {
        let body: String = rows.iter().map(|(x, y)| format!("{x},{y}\n")).collect();
        let path = dir.join(format!("{id}.csv"));
        fs::write(&path, format!("x,y\n{body}")).unwrap();
        Arc::new(FileDataset::new(id, Arc::new(CsvFormat::default()), path))
    }

    fn settings(save: &Path, training: Vec<Arc<dyn Dataset>>, testing: Vec<Arc<dyn Dataset>>) -> Settings {
        Settings {
            training,
            testing,
            request: FeatureRequest::new(vec!["x".into()], vec!["y".into()]),
            feature_set: "flat".into(),
            save_path: save.to_path_buf(),
            trainer: TrainerConfig::new(Algorithm::Linear),
            selection: RunSelection::new("train", "flat"),
        }
    }

    fn shell(script: &str, workdir: &Path) -> SimulationJob {
        SimulationJob {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            workdir: workdir.to_path_buf(),
            cores: 1,
        }
    }

    #[test]
    fn rejects_empty_settings() {
        let dir = tempdir().unwrap();
        let err = MlTurb::new(settings(dir.path(), Vec::new(), Vec::new())).run().unwrap_err();
        assert_eq!(err.phase(), RunPhase::Settings);

        let mut s = settings(dir.path(), vec![csv(dir.path(), "a", &[(1.0, 2.0)])], Vec::new());
        s.request.outputs.clear();
        assert!(matches!(
            MlTurb::new(s).run(),
            Err(RunError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn trains_then_reuses_cached_predictor() {
        let dir = tempdir().unwrap();
        let save = dir.path().join("results");
        let training = vec![
            csv(dir.path(), "a", &[(0.0, 1.0), (1.0, 3.0)]),
            csv(dir.path(), "b", &[(2.0, 5.0), (3.0, 7.0)]),
        ];
        let testing = vec![csv(dir.path(), "t", &[(10.0, 21.0)])];
        let s = settings(&save, training, testing);

        let first = MlTurb::new(s.clone()).run().unwrap();
        assert!(first.trained);
        assert_eq!(first.training_samples, 4);
        assert!(save.join(PREDICTOR_FILE).exists());
        assert!(save.join("settings.json").exists());
        assert_eq!(first.reports.len(), 3);
        let test_report = first.reports.iter().find(|r| r.role == Role::Testing).unwrap();
        assert!(test_report.outputs[0].rmse < 1e-9);
        assert!(report_path(&save.join("postprocess"), Role::Testing, "t").exists());

        let second = MlTurb::new(s.clone()).run().unwrap();
        assert!(!second.trained);
        assert!(second.diagnostics.is_none());

        let third = MlTurb::new(s).retrain(true).run().unwrap();
        assert!(third.trained);
    }

    #[test]
    fn cached_predictor_of_another_width_is_rejected() {
        let dir = tempdir().unwrap();
        let save = dir.path().join("results");
        let mut model = LinearModel::new(2, 1);
        model.set_parameters(&[1.0, 1.0, 0.0]);
        ScalePredictor::new(Model::Linear(model), Scaler::identity(2), Scaler::identity(1))
            .unwrap()
            .save(save.join(PREDICTOR_FILE))
            .unwrap();
        let training = vec![csv(dir.path(), "a", &[(0.0, 1.0), (1.0, 3.0)])];
        let err = MlTurb::new(settings(&save, training, Vec::new())).run().unwrap_err();
        assert_eq!(err.phase(), RunPhase::Persistence);
        assert!(matches!(
            err,
            RunError::Persistence(PersistError::Dimension {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn training_generation_failure_waits_for_testing() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::new(2);
        let broken: Arc<dyn Dataset> = Arc::new(SimulationDataset::new(
            "broken",
            dir.path().join("never.dat"),
            shell("exit 1", dir.path()),
            scheduler.clone(),
        ));
        let marker = dir.path().join("testing_ran");
        let slow: Arc<dyn Dataset> = Arc::new(SimulationDataset::new(
            "slow",
            dir.path().join("also_never.dat"),
            shell(&format!("sleep 0.2 && touch {}", marker.display()), dir.path()),
            scheduler,
        ));
        let err = MlTurb::new(settings(&dir.path().join("r"), vec![broken], vec![slow]))
            .run()
            .unwrap_err();
        assert_eq!(err.phase(), RunPhase::Generation);
        assert!(marker.exists());
        match err {
            RunError::Generation(aggregate) => {
                assert_eq!(aggregate.ids().collect::<Vec<_>>(), vec!["broken"]);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn failed_testing_generation_is_skipped_with_warning() {
        let dir = tempdir().unwrap();
        let testing: Arc<dyn Dataset> = Arc::new(SimulationDataset::new(
            "flaky",
            dir.path().join("flaky.dat"),
            shell("exit 2", dir.path()),
            Scheduler::new(1),
        ));
        let training = vec![csv(dir.path(), "a", &[(0.0, 0.0), (1.0, 1.0)])];
        let summary = MlTurb::new(settings(&dir.path().join("r"), training, vec![testing]))
            .run()
            .unwrap();
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("flaky"));
        assert_eq!(summary.reports.len(), 1);
    }

    fn restart_body(rows: &[[f64; 4]]) -> String {
        let header = ["PointID", "Conservative_1", "Conservative_2", "Conservative_3", "Conservative_5", "Pressure"]
            .map(|name| format!("\"{name}\""))
            .join(",");
        let lines: String = rows
            .iter()
            .enumerate()
            .map(|(i, [rho, rho_u, nu_hat, p])| format!("{i}\t{rho}\t{rho_u}\t0\t{nu_hat}\t{p}\n"))
            .collect();
        format!("{header}\n{lines}")
    }

    #[test]
    fn comparisons_run_with_the_trained_model() {
        let dir = tempdir().unwrap();
        let baseline = dir.path().join("case/restart_flow.dat");
        fs::create_dir_all(baseline.parent().unwrap()).unwrap();
        let rows = [[1.0, 2.0, 1e-5, 100.0], [2.0, 2.0, 2e-5, 101.0], [4.0, 2.0, 3e-5, 99.0]];
        fs::write(&baseline, restart_body(&rows)).unwrap();
        let copy = format!("cp {} {{output}}/restart_flow.dat", baseline.display());
        let case: Arc<dyn Dataset> = Arc::new(
            SimulationDataset::new("case", &baseline, shell("true", dir.path()), Scheduler::new(2))
                .with_comparison_args(vec!["-c".into(), copy]),
        );
        let save = dir.path().join("r");
        let mut s = settings(&save, vec![Arc::clone(&case)], vec![case]);
        s.request = FeatureRequest::new(vec!["Density".into()], vec!["UVel".into()]);
        let summary = MlTurb::new(s).run().unwrap();
        assert_eq!(summary.comparisons, vec![save.join("comparison/case")]);
        assert!(save.join("comparison/case/comparison.json").exists());
        assert_eq!(summary.reports.len(), 2);
    }

    #[test]
    fn comparison_failure_names_the_phase() {
        let dir = tempdir().unwrap();
        let baseline = dir.path().join("restart_flow.dat");
        fs::write(&baseline, restart_body(&[[1.0, 1.0, 1e-5, 1.0], [2.0, 1.0, 1e-5, 1.0]])).unwrap();
        let case: Arc<dyn Dataset> = Arc::new(
            SimulationDataset::new("case", &baseline, shell("true", dir.path()), Scheduler::new(1))
                .with_comparison_args(vec!["-c".into(), "exit 4".into()]),
        );
        let mut s = settings(&dir.path().join("r"), vec![Arc::clone(&case)], vec![case]);
        s.request = FeatureRequest::new(vec!["Density".into()], vec!["UVel".into()]);
        let err = MlTurb::new(s).run().unwrap_err();
        assert_eq!(err.phase(), RunPhase::Comparison);
    }
}
