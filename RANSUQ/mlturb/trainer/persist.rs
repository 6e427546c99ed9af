use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::{Array2, ArrayView2};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{model::Model, scaler::Scaler};

/// Stored round-trip checks per predictor file.
pub const ROUND_TRIP_CHECKS: usize = 5;
/// Relative tolerance when replaying checks on load.
pub const ROUND_TRIP_TOLERANCE: f64 = 1e-13;

const FILE_VERSION: u32 = 1;

/// A fitted model bundled with the scaling it was trained under.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePredictor {
    model: Model,
    input_scaler: Scaler,
    output_scaler: Scaler,
}

/// An input that was evaluated at save time and the output it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTripCheck {
    /// Unscaled input row.
    pub input: Vec<f64>,
    /// Unscaled prediction.
    pub output: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PredictorFile {
    version: u32,
    model: Model,
    input_scaler: Scaler,
    output_scaler: Scaler,
    checks: Vec<RoundTripCheck>,
}

/// Predictor persistence failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("predictor file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Malformed document.
    #[error("predictor file {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Unsupported document version.
    #[error("predictor file {path}: unsupported version {version}")]
    Version {
        /// File involved.
        path: PathBuf,
        /// Version found.
        version: u32,
    },
    /// Model and scalers disagree on a width.
    #[error("{part} expects width {expected}, found {found}")]
    Dimension {
        /// Mismatched component.
        part: &'static str,
        /// Width the model implies.
        expected: usize,
        /// Width the component has.
        found: usize,
    },
    /// The reconstructed predictor does not reproduce a stored check.
    #[error("predictor mismatch on check {check}, output {column}: stored {expected:e}, got {found:e}")]
    PredictorMismatch {
        /// Check index.
        check: usize,
        /// Output column.
        column: usize,
        /// Value saved with the file.
        expected: f64,
        /// Value the reloaded predictor produced.
        found: f64,
    },
}

impl ScalePredictor {
    /// Bundles a model with its scalers.
    pub fn new(model: Model, input_scaler: Scaler, output_scaler: Scaler) -> Result<Self, PersistError> {
        check_dim("input scaler", model.input_dim(), input_scaler.dim())?;
        check_dim("output scaler", model.output_dim(), output_scaler.dim())?;
        Ok(Self {
            model,
            input_scaler,
            output_scaler,
        })
    }

    /// Fitted model.
    #[must_use]
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// Input scaler.
    #[must_use]
    pub const fn input_scaler(&self) -> &Scaler {
        &self.input_scaler
    }

    /// Output scaler.
    #[must_use]
    pub const fn output_scaler(&self) -> &Scaler {
        &self.output_scaler
    }

    /// Input width.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.model.input_dim()
    }

    /// Output width.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.model.output_dim()
    }

    /// Predicts unscaled outputs for unscaled `inputs`.
    ///
    /// # Panics
    /// Panics when `inputs` does not have [`ScalePredictor::input_dim`] columns.
    #[must_use]
    pub fn predict(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut scaled = inputs.to_owned();
        self.input_scaler.scale(&mut scaled);
        let mut outputs = self.model.predict(scaled.view());
        self.output_scaler.unscale(&mut outputs);
        outputs
    }

    /// Predicts a single row.
    #[must_use]
    pub fn predict_row(&self, input: &[f64]) -> Vec<f64> {
        let mut scaled = input.to_vec();
        self.input_scaler.scale_row(&mut scaled);
        let row = ArrayView2::from_shape((1, scaled.len()), &scaled);
        let mut output = row.map_or_else(|_| Vec::new(), |row| self.model.predict(row).into_raw_vec());
        self.output_scaler.unscale_row(&mut output);
        output
    }

    /// Writes the predictor with freshly drawn round-trip checks.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        self.save_with_rng(path, &mut SmallRng::from_entropy())
    }

    /// Writes the predictor, drawing check inputs from `rng`.
    ///
    /// Check inputs are uniform in [-1, 1] in scaled input space, so they sit inside
    /// the range the model was trained on.
    pub fn save_with_rng(&self, path: impl AsRef<Path>, rng: &mut SmallRng) -> Result<(), PersistError> {
        let path = path.as_ref();
        let checks = (0..ROUND_TRIP_CHECKS)
            .map(|_| {
                let mut input: Vec<f64> = (0..self.input_dim()).map(|_| rng.gen_range(-1.0..=1.0)).collect();
                self.input_scaler.unscale_row(&mut input);
                let output = self.predict_row(&input);
                RoundTripCheck { input, output }
            })
            .collect();
        let file = PredictorFile {
            version: FILE_VERSION,
            model: self.model.clone(),
            input_scaler: self.input_scaler.clone(),
            output_scaler: self.output_scaler.clone(),
            checks,
        };
        let body = serde_json::to_vec_pretty(&file).map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, body).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a predictor and replays its stored checks.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        let body = fs::read(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PredictorFile = serde_json::from_slice(&body).map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if file.version != FILE_VERSION {
            return Err(PersistError::Version {
                path: path.to_path_buf(),
                version: file.version,
            });
        }
        let predictor = Self::new(file.model, file.input_scaler, file.output_scaler)?;
        for (index, check) in file.checks.iter().enumerate() {
            check_dim("round-trip check input", predictor.input_dim(), check.input.len())?;
            check_dim("round-trip check output", predictor.output_dim(), check.output.len())?;
            let found = predictor.predict_row(&check.input);
            for (column, (&expected, &got)) in check.output.iter().zip(&found).enumerate() {
                if !within_tolerance(expected, got) {
                    return Err(PersistError::PredictorMismatch {
                        check: index,
                        column,
                        expected,
                        found: got,
                    });
                }
            }
        }
        Ok(predictor)
    }
}

fn check_dim(part: &'static str, expected: usize, found: usize) -> Result<(), PersistError> {
    if expected == found {
        Ok(())
    } else {
        Err(PersistError::Dimension { part, expected, found })
    }
}

/// Relative comparison; values below one in magnitude compare absolutely.
fn within_tolerance(expected: f64, found: f64) -> bool {
    (expected - found).abs() <= ROUND_TRIP_TOLERANCE * expected.abs().max(found.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::{
        model::{FeedForwardNet, Trainable},
        scaler::ScalerKind,
    };
    use ndarray::array;
    use tempfile::tempdir;

    fn predictor() -> ScalePredictor {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut net = FeedForwardNet::new(2, &[4], 1);
        net.randomize(&mut rng);
        let inputs = array![[1.0, 200.0], [3.0, 50.0], [-2.0, 75.0]];
        let outputs = array![[1e-6], [4e-6], [-3e-6]];
        ScalePredictor::new(
            Model::Network(net),
            Scaler::fit(ScalerKind::Normal, inputs.view()),
            Scaler::fit(ScalerKind::Range, outputs.view()),
        )
        .unwrap()
    }

    #[test]
    fn reloaded_predictor_matches_on_unseen_inputs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model/predictor.json");
        let original = predictor();
        original.save(&path).unwrap();
        let reloaded = ScalePredictor::load(&path).unwrap();
        let mut rng = SmallRng::seed_from_u64(99);
        let unseen = Array2::from_shape_fn((50, 2), |_| rng.gen_range(-500.0..500.0));
        let a = original.predict(unseen.view());
        let b = reloaded.predict(unseen.view());
        for (x, y) in a.iter().zip(&b) {
            assert!(within_tolerance(*x, *y), "{x} vs {y}");
        }
        assert_eq!(reloaded, original);
    }

    #[test]
    fn tampered_file_is_a_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("predictor.json");
        predictor().save(&path).unwrap();
        let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let shift = &mut doc["output_scaler"]["shift"][0];
        *shift = serde_json::json!(shift.as_f64().unwrap() + 1.0);
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(
            ScalePredictor::load(&path),
            Err(PersistError::PredictorMismatch { .. })
        ));
    }

    #[test]
    fn scaler_width_must_match_model() {
        let net = FeedForwardNet::new(2, &[3], 1);
        let err = ScalePredictor::new(Model::Network(net), Scaler::identity(3), Scaler::identity(1)).unwrap_err();
        assert!(matches!(err, PersistError::Dimension { expected: 2, found: 3, .. }));
    }
}
