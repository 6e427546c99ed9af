use std::{fmt, sync::Arc, thread, time::Instant};

use indexmap::IndexSet;
use ndarray::{s, Array1, Array2, Axis};
use ransuq_dataloader::plan_features;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    dataset::{Dataset, DatasetError},
    error::{collect_all, AggregateError},
    telemetry::{self, RansuqTelemetry},
};

type WeightFn = dyn Fn(&[f64]) -> f64 + Send + Sync;

/// Named map from a row of weight features to a sample weight.
#[derive(Clone)]
pub struct WeightFunction {
    name: String,
    func: Arc<WeightFn>,
}

impl WeightFunction {
    /// Wraps `func` under `name`.
    pub fn new(name: impl Into<String>, func: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the weight of one row.
    #[must_use]
    pub fn apply(&self, row: &[f64]) -> f64 {
        (self.func)(row)
    }
}

impl fmt::Debug for WeightFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Which features to load and how rows are weighted.
#[derive(Debug, Clone, Default)]
pub struct FeatureRequest {
    /// Model inputs.
    pub inputs: Vec<String>,
    /// Model outputs.
    pub outputs: Vec<String>,
    /// Features fed to the weight function.
    pub weight_features: Vec<String>,
    /// Weight function; present exactly when `weight_features` is non-empty.
    pub weight_function: Option<WeightFunction>,
}

impl FeatureRequest {
    /// Unweighted request.
    #[must_use]
    pub fn new(inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            inputs,
            outputs,
            ..Self::default()
        }
    }

    /// Adds sample weighting.
    #[must_use]
    pub fn with_weights(mut self, features: Vec<String>, function: WeightFunction) -> Self {
        self.weight_features = features;
        self.weight_function = Some(function);
        self
    }

    /// Checks that weight features and weight function come together.
    pub fn validate(&self) -> Result<(), LoadDataError> {
        match (&self.weight_function, self.weight_features.is_empty()) {
            (None, false) => Err(LoadDataError::WeightFunctionMissing {
                features: self.weight_features.clone(),
            }),
            (Some(function), true) => Err(LoadDataError::WeightFeaturesMissing {
                function: function.name().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Every requested feature once, in first-occurrence order.
    #[must_use]
    pub fn union(&self) -> IndexSet<String> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.weight_features)
            .cloned()
            .collect()
    }
}

/// Matrices sliced out of one or more datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedData {
    /// One column per input feature.
    pub inputs: Array2<f64>,
    /// One column per output feature.
    pub outputs: Array2<f64>,
    /// One weight per row, when the request is weighted.
    pub weights: Option<Array1<f64>>,
}

impl LoadedData {
    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    /// True when no rows were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// Failures while loading model data.
#[derive(Debug, Error)]
pub enum LoadDataError {
    /// Weight features were named without a weight function.
    #[error("weight features {features:?} given without a weight function")]
    WeightFunctionMissing {
        /// The orphaned features.
        features: Vec<String>,
    },
    /// A weight function was given without any weight features.
    #[error("weight function {function} given without weight features")]
    WeightFeaturesMissing {
        /// Weight function name.
        function: String,
    },
    /// No datasets to load from.
    #[error("no datasets to load")]
    NoDatasets,
    /// A single dataset failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// One or more of several concurrently loaded datasets failed.
    #[error("loading failed: {0}")]
    Aggregate(#[from] AggregateError<DatasetError>),
}

/// Loads inputs, outputs and weights from `dataset`, reading the feature union once.
pub fn load_data(dataset: &dyn Dataset, request: &FeatureRequest) -> Result<LoadedData, LoadDataError> {
    request.validate()?;
    Ok(load_validated(dataset, request)?)
}

/// Raw columns the dataset's format reads to serve `request`.
fn raw_columns(dataset: &dyn Dataset, request: &FeatureRequest) -> Vec<String> {
    let features: Vec<String> = request.union().into_iter().collect();
    plan_features(dataset.format(), &features)
        .map(|plan| plan.raw_names().to_vec())
        .unwrap_or_default()
}

fn load_validated(dataset: &dyn Dataset, request: &FeatureRequest) -> Result<LoadedData, DatasetError> {
    let union = request.union();
    let all: Vec<String> = union.iter().cloned().collect();
    let table = dataset.load(&all)?;
    let slice = |names: &[String]| {
        let columns: Vec<usize> = names
            .iter()
            .filter_map(|name| union.get_index_of(name))
            .collect();
        assert_eq!(columns.len(), names.len(), "feature missing from load union");
        table.select(Axis(1), &columns)
    };
    let inputs = slice(&request.inputs);
    let outputs = slice(&request.outputs);
    let weights = request.weight_function.as_ref().map(|function| {
        let raw = slice(&request.weight_features);
        raw.rows()
            .into_iter()
            .map(|row| function.apply(&row.to_vec()))
            .collect::<Array1<f64>>()
    });
    Ok(LoadedData {
        inputs,
        outputs,
        weights,
    })
}

/// Loads every dataset concurrently, one thread each, and stacks the rows in
/// the order `datasets` is given.
///
/// All loads run to completion before any failure is reported; the error then
/// lists every dataset that failed.
pub fn load_training_data(
    datasets: &[Arc<dyn Dataset>],
    request: &FeatureRequest,
    telemetry: Option<&RansuqTelemetry>,
) -> Result<LoadedData, LoadDataError> {
    request.validate()?;
    if datasets.is_empty() {
        return Err(LoadDataError::NoDatasets);
    }
    let results = thread::scope(|scope| {
        let handles: Vec<_> = datasets
            .iter()
            .map(|dataset| {
                scope.spawn(move || {
                    let started = Instant::now();
                    let loaded = load_validated(dataset.as_ref(), request);
                    if let (Ok(data), Some(_)) = (&loaded, telemetry) {
                        telemetry::log(
                            telemetry,
                            LogLevel::Debug,
                            "load.dataset.loaded",
                            json!({
                                "dataset": dataset.id(),
                                "rows": data.len(),
                                "raw_columns": raw_columns(dataset.as_ref(), request),
                                "elapsed_ms": started.elapsed().as_millis(),
                            }),
                        );
                    }
                    loaded
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(datasets)
            .map(|(handle, dataset)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                (dataset.id().to_string(), result)
            })
            .collect::<Vec<_>>()
    });
    let parts = collect_all(results)?;
    Ok(concatenate(&parts, request))
}

fn concatenate(parts: &[LoadedData], request: &FeatureRequest) -> LoadedData {
    let rows: usize = parts.iter().map(LoadedData::len).sum();
    let mut inputs = Array2::zeros((rows, request.inputs.len()));
    let mut outputs = Array2::zeros((rows, request.outputs.len()));
    let mut weights = request.weight_function.as_ref().map(|_| Array1::zeros(rows));
    let mut offset = 0;
    for part in parts {
        let end = offset + part.len();
        inputs.slice_mut(s![offset..end, ..]).assign(&part.inputs);
        outputs.slice_mut(s![offset..end, ..]).assign(&part.outputs);
        if let (Some(all), Some(own)) = (weights.as_mut(), part.weights.as_ref()) {
            all.slice_mut(s![offset..end]).assign(own);
        }
        offset = end;
    }
    LoadedData {
        inputs,
        outputs,
        weights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::FileDataset;
    use ransuq_dataloader::{CsvFormat, FieldTransformer, Format};
    use std::{fs, path::Path, time::Duration};
    use tempfile::tempdir;

    #[derive(Debug)]
    struct Slow {
        inner: FileDataset,
        delay: Duration,
    }

    impl Dataset for Slow {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn format(&self) -> &dyn Format {
            self.inner.format()
        }

        fn source(&self) -> &Path {
            self.inner.source()
        }

        fn load(&self, features: &[String]) -> Result<Array2<f64>, DatasetError> {
            thread::sleep(self.delay);
            self.inner.load(features)
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn csv(dir: &Path, id: &str, body: &str) -> FileDataset {
        let path = dir.join(format!("{id}.csv"));
        fs::write(&path, body).unwrap();
        FileDataset::new(id, Arc::new(CsvFormat::default()), path)
    }

    #[test]
    fn slices_union_into_inputs_outputs_and_weights() {
        let dir = tempdir().unwrap();
        let dataset = csv(dir.path(), "a", "x,y,w\n1,10,2\n2,20,4\n");
        let request = FeatureRequest::new(names(&["x", "y"]), names(&["y"]))
            .with_weights(names(&["w"]), WeightFunction::new("double", |row| row[0] * 2.0));
        let data = load_data(&dataset, &request).unwrap();
        assert_eq!(data.inputs, ndarray::array![[1.0, 10.0], [2.0, 20.0]]);
        assert_eq!(data.outputs, ndarray::array![[10.0], [20.0]]);
        assert_eq!(data.weights.unwrap().to_vec(), vec![4.0, 8.0]);
        assert_eq!(request.union().len(), 3);
    }

    #[test]
    fn weight_features_and_function_must_pair() {
        let mut request = FeatureRequest::new(names(&["x"]), names(&["y"]));
        request.weight_features = names(&["w"]);
        assert!(matches!(
            request.validate(),
            Err(LoadDataError::WeightFunctionMissing { .. })
        ));
        let request = FeatureRequest {
            weight_function: Some(WeightFunction::new("unit", |_| 1.0)),
            ..FeatureRequest::new(names(&["x"]), names(&["y"]))
        };
        assert!(matches!(
            request.validate(),
            Err(LoadDataError::WeightFeaturesMissing { .. })
        ));
    }

    #[test]
    fn concatenation_follows_dataset_order_not_completion_order() {
        let dir = tempdir().unwrap();
        let first = csv(dir.path(), "first", "x,y\n1,2\n3,4\n5,6\n");
        let second = csv(dir.path(), "second", "x,y\n7,8\n");
        let request = FeatureRequest::new(names(&["x"]), names(&["y"]));
        let expected_first = load_data(&first, &request).unwrap();
        let expected_second = load_data(&second, &request).unwrap();
        let datasets: Vec<Arc<dyn Dataset>> = vec![
            Arc::new(Slow {
                inner: first,
                delay: Duration::from_millis(80),
            }),
            Arc::new(second),
        ];
        let data = load_training_data(&datasets, &request, None).unwrap();
        assert_eq!(data.len(), 4);
        assert_eq!(data.inputs.slice(s![0..3, ..]), expected_first.inputs);
        assert_eq!(data.outputs.slice(s![3..4, ..]), expected_second.outputs);
        assert!(data.weights.is_none());
    }

    #[test]
    fn weights_are_stacked_in_dataset_order() {
        let dir = tempdir().unwrap();
        let first = csv(dir.path(), "a", "x,y,w\n1,1,1\n2,2,2\n");
        let second = csv(dir.path(), "b", "x,y,w\n3,3,3\n");
        let request = FeatureRequest::new(names(&["x"]), names(&["y"]))
            .with_weights(names(&["w"]), WeightFunction::new("triple", |row| row[0] * 3.0));
        let datasets: Vec<Arc<dyn Dataset>> = vec![
            Arc::new(Slow {
                inner: first,
                delay: Duration::from_millis(80),
            }),
            Arc::new(second),
        ];
        let data = load_training_data(&datasets, &request, None).unwrap();
        assert_eq!(data.weights.unwrap().to_vec(), vec![3.0, 6.0, 9.0]);
        assert_eq!(data.inputs.column(0).to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn debug_log_lists_raw_columns_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plate.csv");
        fs::write(&path, "x,nu,nuhat\n1,1e-3,2e-3\n").unwrap();
        let format = CsvFormat::default().with_transformer("Chi", FieldTransformer::ratio("nuhat", "nu"));
        let datasets: Vec<Arc<dyn Dataset>> = vec![Arc::new(FileDataset::new("plate", Arc::new(format), path))];
        let log = dir.path().join("load.log");
        let telemetry = RansuqTelemetry::builder("loader")
            .log_path(&log)
            .min_level(LogLevel::Debug)
            .build()
            .unwrap();
        let request = FeatureRequest::new(names(&["Chi"]), names(&["x"]));
        load_training_data(&datasets, &request, Some(&telemetry)).unwrap();
        let records = shared_logging::read_records(&log).unwrap();
        let loaded = records.iter().find(|r| r.message == "load.dataset.loaded").unwrap();
        assert_eq!(loaded.metadata["raw_columns"], json!(["nuhat", "nu", "x"]));
    }

    #[test]
    fn every_failed_dataset_is_reported() {
        let dir = tempdir().unwrap();
        let good = csv(dir.path(), "good", "x,y\n1,2\n");
        let datasets: Vec<Arc<dyn Dataset>> = vec![
            Arc::new(FileDataset::new("gone", Arc::new(CsvFormat::default()), dir.path().join("gone.csv"))),
            Arc::new(good),
            Arc::new(csv(dir.path(), "bad", "x,z\n1,2\n")),
        ];
        let request = FeatureRequest::new(names(&["x"]), names(&["y"]));
        match load_training_data(&datasets, &request, None) {
            Err(LoadDataError::Aggregate(err)) => {
                assert_eq!(err.ids().collect::<Vec<_>>(), vec!["gone", "bad"]);
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
        assert!(matches!(
            load_training_data(&[], &request, None),
            Err(LoadDataError::NoDatasets)
        ));
    }
}
