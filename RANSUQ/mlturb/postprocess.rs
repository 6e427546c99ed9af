use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    dataset::Dataset,
    error::{collect_all, AggregateError},
    load::{load_data, FeatureRequest, LoadDataError},
    telemetry::{self, RansuqTelemetry},
    trainer::persist::ScalePredictor,
};

/// Why a dataset is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Part of the training data.
    Training,
    /// Held out.
    Testing,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Training => "training",
            Self::Testing => "testing",
        })
    }
}

/// Prediction error for one output feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputStats {
    /// Output feature.
    pub feature: String,
    /// Root-mean-square error.
    pub rmse: f64,
    /// Largest absolute error.
    pub max_abs_error: f64,
    /// Root-mean-square of the true values, for scale.
    pub rms_truth: f64,
}

/// Prediction quality on one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessReport {
    /// Dataset role.
    pub role: Role,
    /// Dataset identifier.
    pub dataset: String,
    /// Rows evaluated.
    pub samples: usize,
    /// Per-output statistics.
    pub outputs: Vec<OutputStats>,
}

/// Postprocessing failures for one dataset.
#[derive(Debug, Error)]
pub enum PostProcessError {
    /// The dataset could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadDataError),
    /// The report could not be written.
    #[error("writing {path}: {source}")]
    Io {
        /// Report path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The report could not be encoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Evaluates `predictor` on `dataset`.
pub fn evaluate(
    predictor: &ScalePredictor,
    request: &FeatureRequest,
    role: Role,
    dataset: &dyn Dataset,
) -> Result<PostProcessReport, PostProcessError> {
    let data = load_data(dataset, request)?;
    let predicted = predictor.predict(data.inputs.view());
    let samples = data.len();
    let outputs = request
        .outputs
        .iter()
        .enumerate()
        .map(|(col, feature)| {
            let truth = data.outputs.column(col);
            let errors = &predicted.column(col) - &truth;
            let mean_square = |sum: f64| if samples == 0 { 0.0 } else { (sum / samples as f64).sqrt() };
            OutputStats {
                feature: feature.clone(),
                rmse: mean_square(errors.mapv(|e| e * e).sum()),
                max_abs_error: errors.iter().fold(0.0, |acc: f64, e| acc.max(e.abs())),
                rms_truth: mean_square(truth.mapv(|t| t * t).sum()),
            }
        })
        .collect();
    Ok(PostProcessReport {
        role,
        dataset: dataset.id().to_string(),
        samples,
        outputs,
    })
}

/// Report location for a dataset under `dir`.
#[must_use]
pub fn report_path(dir: &Path, role: Role, dataset: &str) -> PathBuf {
    dir.join(format!("{role}_{dataset}.json"))
}

/// Evaluates every dataset concurrently and writes one JSON report each
/// under `dir`. Every dataset is attempted; failures are collected.
pub fn post_process_all(
    predictor: &ScalePredictor,
    request: &FeatureRequest,
    datasets: &[(Role, Arc<dyn Dataset>)],
    dir: &Path,
    telemetry: Option<&RansuqTelemetry>,
) -> Result<Vec<PostProcessReport>, AggregateError<PostProcessError>> {
    let results = thread::scope(|scope| {
        let handles: Vec<_> = datasets
            .iter()
            .map(|(role, dataset)| {
                scope.spawn(move || -> Result<PostProcessReport, PostProcessError> {
                    let report = evaluate(predictor, request, *role, dataset.as_ref())?;
                    let path = report_path(dir, *role, dataset.id());
                    let body = serde_json::to_vec_pretty(&report)?;
                    fs::create_dir_all(dir)
                        .and_then(|()| fs::write(&path, body))
                        .map_err(|source| PostProcessError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    telemetry::log(
                        telemetry,
                        LogLevel::Info,
                        "postprocess.report.written",
                        json!({ "dataset": dataset.id(), "role": role, "path": path }),
                    );
                    Ok(report)
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(datasets)
            .map(|(handle, (_, dataset))| {
                let result = handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                (dataset.id().to_string(), result)
            })
            .collect::<Vec<_>>()
    });
    collect_all(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::FileDataset,
        trainer::{
            model::{LinearModel, Model, Trainable},
            scaler::Scaler,
        },
    };
    use ransuq_dataloader::CsvFormat;
    use tempfile::tempdir;

    fn doubling() -> ScalePredictor {
        let mut model = LinearModel::new(1, 1);
        model.set_parameters(&[2.0, 0.0]);
        ScalePredictor::new(Model::Linear(model), Scaler::identity(1), Scaler::identity(1)).unwrap()
    }

    #[test]
    fn reports_errors_per_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.csv");
        fs::write(&path, "x,y\n1,2\n2,4\n3,9\n").unwrap();
        let dataset = FileDataset::new("d", Arc::new(CsvFormat::default()), &path);
        let request = FeatureRequest::new(vec!["x".into()], vec!["y".into()]);
        let report = evaluate(&doubling(), &request, Role::Testing, &dataset).unwrap();
        assert_eq!(report.samples, 3);
        let stats = &report.outputs[0];
        assert_eq!(stats.max_abs_error, 3.0);
        assert!((stats.rmse - 3.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn writes_reports_and_collects_failures() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.csv");
        fs::write(&good, "x,y\n1,2\n").unwrap();
        let datasets: Vec<(Role, Arc<dyn Dataset>)> = vec![
            (Role::Training, Arc::new(FileDataset::new("good", Arc::new(CsvFormat::default()), &good))),
            (
                Role::Testing,
                Arc::new(FileDataset::new("gone", Arc::new(CsvFormat::default()), dir.path().join("gone.csv"))),
            ),
        ];
        let request = FeatureRequest::new(vec!["x".into()], vec!["y".into()]);
        let out = dir.path().join("postprocess");
        let err = post_process_all(&doubling(), &request, &datasets, &out, None).unwrap_err();
        assert_eq!(err.ids().collect::<Vec<_>>(), vec!["gone"]);
        let written: PostProcessReport =
            serde_json::from_slice(&fs::read(report_path(&out, Role::Training, "good")).unwrap()).unwrap();
        assert_eq!(written.outputs[0].rmse, 0.0);
    }
}
