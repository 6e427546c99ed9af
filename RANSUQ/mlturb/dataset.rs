use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use ndarray::Array2;
use ransuq_dataloader::{load_features, Format, LoadError};
use thiserror::Error;

use crate::scheduler::{JobFailure, SchedulerError};

/// A named, loadable table of feature values.
///
/// Optional capabilities are discovered through the `as_*` queries.
pub trait Dataset: Send + Sync + fmt::Debug {
    /// Dataset identifier.
    fn id(&self) -> &str;

    /// Format of the underlying file.
    fn format(&self) -> &dyn Format;

    /// File the data is read from.
    fn source(&self) -> &Path;

    /// Loads `features`, one column per feature in request order. Rows follow
    /// the file order, which for mesh data is the point id order.
    fn load(&self, features: &[String]) -> Result<Array2<f64>, DatasetError> {
        load_features(self.format(), self.source(), features).map_err(|source| {
            DatasetError::Load {
                id: self.id().to_string(),
                source,
            }
        })
    }

    /// Generation capability, if the data must be produced by a simulation first.
    fn as_generatable(&self) -> Option<&dyn Generatable> {
        None
    }

    /// Comparison capability, if a follow-on simulation can use a trained model.
    fn as_comparable(&self) -> Option<&dyn Comparable> {
        None
    }

    /// Dataset-specific postprocessing, if any.
    fn as_post_processor(&self) -> Option<&dyn PostProcessor> {
        None
    }
}

/// Something an external process must produce before it can be used.
pub trait Generatable: Send + Sync {
    /// Identifier used in logs and aggregate errors.
    fn id(&self) -> &str;

    /// True when the output already exists.
    fn is_generated(&self) -> bool;

    /// Runs the external process; may take a long time.
    fn run(&self) -> Result<(), DatasetError>;

    /// Postprocessing to run after `run`, if any.
    fn as_post_processor(&self) -> Option<&dyn PostProcessor> {
        None
    }
}

/// A dataset that can spawn a simulation driven by a trained predictor.
pub trait Comparable: Send + Sync {
    /// Prepares (but does not run) a simulation that uses the predictor at
    /// `model_path`, writing under `output`.
    fn spawn_comparison(
        &self,
        model_path: &Path,
        output: &Path,
        feature_set: &str,
    ) -> Result<Box<dyn Generatable>, DatasetError>;
}

/// Follow-up analysis of generated output.
pub trait PostProcessor: Send + Sync {
    /// Runs the analysis.
    fn post_process(&self) -> Result<(), DatasetError>;
}

/// Dataset-level failures.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Feature extraction failed.
    #[error("dataset {id}: {source}")]
    Load {
        /// Dataset identifier.
        id: String,
        /// Loader failure.
        #[source]
        source: LoadError,
    },
    /// The simulation job could not be scheduled.
    #[error("dataset {id}: scheduling failed: {source}")]
    Schedule {
        /// Dataset identifier.
        id: String,
        /// Scheduler failure.
        #[source]
        source: SchedulerError,
    },
    /// The simulation job ran and failed.
    #[error("dataset {id}: simulation failed: {source}")]
    Simulation {
        /// Dataset identifier.
        id: String,
        /// Job failure.
        #[source]
        source: JobFailure,
    },
    /// The simulation finished without producing its output file.
    #[error("dataset {id}: simulation finished but {path} was not written")]
    NotGenerated {
        /// Dataset identifier.
        id: String,
        /// Expected output.
        path: PathBuf,
    },
    /// Filesystem failure outside feature loading.
    #[error("dataset {id}: io error on {path}: {source}")]
    Io {
        /// Dataset identifier.
        id: String,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Two runs that should cover the same mesh have different point counts.
    #[error("dataset {id}: baseline has {baseline} points, comparison has {comparison}")]
    PointCountMismatch {
        /// Dataset identifier.
        id: String,
        /// Baseline rows.
        baseline: usize,
        /// Comparison rows.
        comparison: usize,
    },
    /// Report serialization failed.
    #[error("dataset {id}: {source}")]
    Json {
        /// Dataset identifier.
        id: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Data already on disk.
#[derive(Debug, Clone)]
pub struct FileDataset {
    id: String,
    format: Arc<dyn Format>,
    path: PathBuf,
}

impl FileDataset {
    /// Creates a dataset reading `path` with `format`.
    pub fn new(id: impl Into<String>, format: Arc<dyn Format>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            format,
            path: path.into(),
        }
    }
}

impl Dataset for FileDataset {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> &dyn Format {
        self.format.as_ref()
    }

    fn source(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ransuq_dataloader::{CsvFormat, FieldTransformer};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn file_dataset_loads_in_request_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flat.csv");
        fs::write(&path, "x,y,nu,nuhat\n1.0,2.0,1e-3,2e-3\n3.0,4.0,1.5e-3,2.5e-3\n").unwrap();
        let format = CsvFormat::default().with_transformer("Chi", FieldTransformer::ratio("nuhat", "nu"));
        let dataset = FileDataset::new("flat", Arc::new(format), &path);
        let m = dataset
            .load(&["y".to_string(), "Chi".to_string()])
            .unwrap();
        assert_eq!(m.dim(), (2, 2));
        assert_eq!(m[[1, 0]], 4.0);
        assert!((m[[0, 1]] - 2.0).abs() < 1e-12);
        assert!(dataset.as_generatable().is_none());
        assert!(dataset.as_comparable().is_none());
    }

    #[test]
    fn load_errors_name_the_dataset() {
        let dataset = FileDataset::new("ghost", Arc::new(CsvFormat::default()), "/nonexistent/ghost.csv");
        let err = dataset.load(&["x".to_string()]).unwrap_err();
        assert!(err.to_string().starts_with("dataset ghost:"));
    }
}
