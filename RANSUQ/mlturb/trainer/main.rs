//! Predictor training: input/output scaling, closed-form or iterative fitting,
//! and the persisted scale-aware predictor.

/// Models and the trainable contract.
pub mod model;
/// Gradient-based optimiser.
pub mod optimize;
/// Predictor persistence with round-trip verification.
pub mod persist;
/// Per-column scalers.
pub mod scaler;

use std::time::Instant;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::SmallRng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::telemetry::{self, RansuqTelemetry};
use model::{FeedForwardNet, LinearModel, Trainable};
use optimize::{minimize, Convergence, OptimizeError, StopReason};
use persist::{PersistError, ScalePredictor};
use scaler::{Scaled, Scaler, ScalerKind};

/// Model family to fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    /// Affine least squares.
    Linear,
    /// Feed-forward network with tanh hidden layers of the given widths.
    Network {
        /// Hidden layer widths.
        hidden: Vec<usize>,
    },
}

impl Algorithm {
    fn build(&self, inputs: usize, outputs: usize) -> Box<dyn Trainable> {
        match self {
            Self::Linear => Box::new(LinearModel::new(inputs, outputs)),
            Self::Network { hidden } => Box::new(FeedForwardNet::new(inputs, hidden, outputs)),
        }
    }
}

/// Data term of the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// Weighted mean of half the squared residuals.
    #[default]
    SquaredError,
}

impl Loss {
    /// Loss value and its gradient with respect to the predictions.
    fn evaluate(
        self,
        predictions: &Array2<f64>,
        targets: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> (f64, Array2<f64>) {
        match self {
            Self::SquaredError => {
                let residual = predictions - &targets;
                let mut weighted = residual.clone();
                let mut total = residual.nrows() as f64;
                if let Some(w) = weights {
                    total = w.sum();
                    for (mut row, &wi) in weighted.axis_iter_mut(Axis(0)).zip(w) {
                        row *= wi;
                    }
                }
                let value = (&weighted * &residual).sum() / (2.0 * total);
                (value, weighted / total)
            }
        }
    }
}

/// Penalty on the non-bias parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regularizer {
    /// No penalty.
    #[default]
    None,
    /// Half the squared norm times `strength`.
    L2 {
        /// Penalty weight.
        strength: f64,
    },
}

impl Regularizer {
    const fn strength(self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::L2 { strength } => strength,
        }
    }
}

/// Everything that determines how a predictor is fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Model family.
    pub algorithm: Algorithm,
    /// Data loss.
    #[serde(default)]
    pub loss: Loss,
    /// Parameter penalty.
    #[serde(default)]
    pub regularizer: Regularizer,
    /// Input scaling.
    #[serde(default)]
    pub input_scaler: ScalerKind,
    /// Output scaling.
    #[serde(default)]
    pub output_scaler: ScalerKind,
    /// Stopping criteria for iterative fitting.
    #[serde(default)]
    pub convergence: Convergence,
}

impl TrainerConfig {
    /// Config with default loss, regularizer, scalers and convergence.
    #[must_use]
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            loss: Loss::default(),
            regularizer: Regularizer::default(),
            input_scaler: ScalerKind::default(),
            output_scaler: ScalerKind::default(),
            convergence: Convergence::default(),
        }
    }
}

/// Summary of one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDiagnostics {
    /// Model family name.
    pub algorithm: String,
    /// Training rows.
    pub samples: usize,
    /// Final objective in scaled space.
    pub objective: f64,
    /// Objective evaluations.
    pub evaluations: usize,
    /// Why fitting stopped.
    pub stop: StopReason,
    /// Elapsed seconds.
    pub wall_time_secs: f64,
}

/// Training failures.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// Nothing to train on.
    #[error("no training samples")]
    NoSamples,
    /// The closed-form system has no unique solution.
    #[error("linear system is singular at column {column}")]
    SingularSystem {
        /// Elimination column with a vanishing pivot.
        column: usize,
    },
    /// Sample weights must have a positive, finite sum.
    #[error("sample weights sum to {sum}")]
    InvalidWeights {
        /// Sum of the supplied weights.
        sum: f64,
    },
    /// The optimiser failed.
    #[error("training failed: {0}")]
    TrainingError(#[from] OptimizeError),
    /// The trained model does not expose a persistable predictor.
    #[error("{algorithm} does not provide a persistable predictor")]
    PredictorCastError {
        /// Model family name.
        algorithm: String,
    },
    /// The predictor could not be assembled.
    #[error(transparent)]
    Predictor(#[from] PersistError),
}

/// Fits scale-aware predictors.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainerConfig,
    telemetry: Option<RansuqTelemetry>,
}

impl Trainer {
    /// Creates a trainer.
    #[must_use]
    pub const fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RansuqTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Training configuration.
    #[must_use]
    pub const fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Fits the configured algorithm.
    ///
    /// `inputs` and `outputs` are scaled in place while fitting and restored
    /// before returning, on success and on error.
    pub fn train(
        &self,
        inputs: &mut Array2<f64>,
        outputs: &mut Array2<f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<(ScalePredictor, TrainingDiagnostics), TrainerError> {
        let model = self.config.algorithm.build(inputs.ncols(), outputs.ncols());
        self.train_model(model, inputs, outputs, weights)
    }

    /// Fits a caller-supplied model.
    ///
    /// # Panics
    /// Panics when row counts or model widths disagree with the data.
    pub fn train_model(
        &self,
        mut model: Box<dyn Trainable>,
        inputs: &mut Array2<f64>,
        outputs: &mut Array2<f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<(ScalePredictor, TrainingDiagnostics), TrainerError> {
        let samples = inputs.nrows();
        if samples == 0 {
            return Err(TrainerError::NoSamples);
        }
        assert_eq!(outputs.nrows(), samples, "input/output row counts differ");
        if let Some(w) = weights {
            assert_eq!(w.len(), samples, "weight count differs from row count");
            let sum = w.sum();
            if !(sum.is_finite() && sum > 0.0) {
                return Err(TrainerError::InvalidWeights { sum });
            }
        }
        assert_eq!(model.input_dim(), inputs.ncols(), "model input width");
        assert_eq!(model.output_dim(), outputs.ncols(), "model output width");

        let started = Instant::now();
        let input_scaler = Scaler::fit(self.config.input_scaler, inputs.view());
        let output_scaler = Scaler::fit(self.config.output_scaler, outputs.view());
        let ridge = self.config.regularizer.strength();
        let loss = self.config.loss;
        let (objective, evaluations, stop) = {
            let x = Scaled::new(inputs, &input_scaler);
            let y = Scaled::new(outputs, &output_scaler);
            let closed_form = match loss {
                Loss::SquaredError => model.linear_solve(x.view(), y.view(), weights, ridge),
            };
            if let Some(solved) = closed_form {
                solved?;
                let (value, _) = evaluate(model.as_ref(), loss, x.view(), y.view(), weights, ridge);
                (value, 1, StopReason::ClosedForm)
            } else {
                let mut rng = self
                    .config
                    .convergence
                    .seed
                    .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
                model.randomize(&mut rng);
                let start = model.parameters();
                let minimum = minimize(
                    |params| {
                        model.set_parameters(params);
                        evaluate(model.as_ref(), loss, x.view(), y.view(), weights, ridge)
                    },
                    start,
                    &self.config.convergence,
                )?;
                model.set_parameters(&minimum.params);
                (minimum.objective, minimum.evaluations, minimum.stop)
            }
        };

        let algorithm = model.name().to_string();
        let fitted = model
            .into_predictor()
            .ok_or_else(|| TrainerError::PredictorCastError {
                algorithm: algorithm.clone(),
            })?;
        let predictor = ScalePredictor::new(fitted, input_scaler, output_scaler)?;
        let diagnostics = TrainingDiagnostics {
            algorithm,
            samples,
            objective,
            evaluations,
            stop,
            wall_time_secs: started.elapsed().as_secs_f64(),
        };
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "trainer.finished",
            json!(diagnostics),
        );
        Ok((predictor, diagnostics))
    }
}

fn evaluate(
    model: &dyn Trainable,
    loss: Loss,
    inputs: ArrayView2<'_, f64>,
    targets: ArrayView2<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
    ridge: f64,
) -> (f64, Vec<f64>) {
    let predictions = model.predict(inputs);
    let (mut value, output_grad) = loss.evaluate(&predictions, targets, weights);
    let mut grad = model.backprop(inputs, output_grad.view());
    if ridge > 0.0 {
        let params = model.parameters();
        for ((g, p), penalized) in grad.iter_mut().zip(&params).zip(model.penalized()) {
            if penalized {
                *g += ridge * p;
                value += 0.5 * ridge * p * p;
            }
        }
    }
    (value, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::Model;
    use ndarray::{array, Array1};
    use rand::Rng;
    use tempfile::tempdir;

    fn plane(rows: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let inputs = Array2::from_shape_fn((rows, 2), |(_, c)| rng.gen_range(-2.0..2.0) * (1.0 + 99.0 * c as f64));
        let outputs = inputs
            .map_axis(Axis(1), |row| 4.0 * row[0] - 0.02 * row[1] + 7.0)
            .insert_axis(Axis(1));
        (inputs, outputs)
    }

    fn quick(seed: u64, max_evaluations: usize) -> Convergence {
        Convergence {
            objective_tol: 0.0,
            gradient_tol: 1e-10,
            max_evaluations,
            seed: Some(seed),
        }
    }

    #[test]
    fn linear_fit_is_closed_form_and_restores_data() {
        let (mut inputs, mut outputs) = plane(30, 1);
        let (inputs_before, outputs_before) = (inputs.clone(), outputs.clone());
        let trainer = Trainer::new(TrainerConfig::new(Algorithm::Linear));
        let (predictor, diagnostics) = trainer.train(&mut inputs, &mut outputs, None).unwrap();
        assert_eq!(diagnostics.stop, StopReason::ClosedForm);
        assert!(diagnostics.objective < 1e-20);
        for (a, b) in inputs.iter().zip(&inputs_before) {
            assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
        }
        for (a, b) in outputs.iter().zip(&outputs_before) {
            assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
        }
        let predicted = predictor.predict(array![[1.0, 50.0]].view());
        assert!((predicted[[0, 0]] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_ignore_rows() {
        let mut inputs = array![[0.0], [1.0], [2.0], [3.0]];
        let mut outputs = array![[1.0], [3.0], [5.0], [100.0]];
        let weights: Array1<f64> = array![1.0, 1.0, 1.0, 0.0];
        let mut config = TrainerConfig::new(Algorithm::Linear);
        config.input_scaler = ScalerKind::Identity;
        config.output_scaler = ScalerKind::Identity;
        let (predictor, _) = Trainer::new(config)
            .train(&mut inputs, &mut outputs, Some(weights.view()))
            .unwrap();
        assert!((predictor.predict_row(&[3.0])[0] - 7.0).abs() < 1e-10);
    }

    #[test]
    fn network_fit_reduces_objective() {
        let (mut inputs, mut outputs) = plane(40, 2);
        let mut config = TrainerConfig::new(Algorithm::Network { hidden: vec![6] });
        config.convergence = quick(3, 3000);
        let (predictor, diagnostics) = Trainer::new(config)
            .train(&mut inputs, &mut outputs, None)
            .unwrap();
        assert!(diagnostics.evaluations <= 3000);
        // A constant predictor scores 0.5 in normalised output space.
        assert!(diagnostics.objective < 0.25, "{}", diagnostics.objective);
        assert!(matches!(predictor.model(), Model::Network(_)));
    }

    #[test]
    fn trained_predictor_round_trips_through_disk() {
        let (mut inputs, mut outputs) = plane(25, 4);
        let mut config = TrainerConfig::new(Algorithm::Network { hidden: vec![5, 5] });
        config.convergence = quick(5, 200);
        let (predictor, _) = Trainer::new(config)
            .train(&mut inputs, &mut outputs, None)
            .unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("predictor.json");
        predictor.save(&path).unwrap();
        let reloaded = ScalePredictor::load(&path).unwrap();
        let mut rng = SmallRng::seed_from_u64(8);
        let unseen = Array2::from_shape_fn((20, 2), |_| rng.gen_range(-300.0..300.0));
        let (a, b) = (predictor.predict(unseen.view()), reloaded.predict(unseen.view()));
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() <= 1e-13 * x.abs().max(1.0));
        }
    }

    #[test]
    fn ridge_shrinks_weights() {
        let (mut inputs, mut outputs) = plane(30, 6);
        let mut config = TrainerConfig::new(Algorithm::Linear);
        let (plain, _) = Trainer::new(config.clone())
            .train(&mut inputs, &mut outputs, None)
            .unwrap();
        config.regularizer = Regularizer::L2 { strength: 10.0 };
        let (ridge, _) = Trainer::new(config)
            .train(&mut inputs, &mut outputs, None)
            .unwrap();
        let slope = |p: &ScalePredictor| p.predict_row(&[1.0, 0.0])[0] - p.predict_row(&[0.0, 0.0])[0];
        assert!(slope(&ridge).abs() < slope(&plain).abs());
    }

    struct Opaque(LinearModel);

    impl Trainable for Opaque {
        fn name(&self) -> &str {
            "opaque"
        }
        fn input_dim(&self) -> usize {
            self.0.input_dim()
        }
        fn output_dim(&self) -> usize {
            self.0.output_dim()
        }
        fn parameters(&self) -> Vec<f64> {
            self.0.parameters()
        }
        fn set_parameters(&mut self, params: &[f64]) {
            self.0.set_parameters(params);
        }
        fn penalized(&self) -> Vec<bool> {
            self.0.penalized()
        }
        fn randomize(&mut self, rng: &mut SmallRng) {
            self.0.randomize(rng);
        }
        fn predict(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
            self.0.predict(inputs)
        }
        fn backprop(&self, inputs: ArrayView2<'_, f64>, output_grad: ArrayView2<'_, f64>) -> Vec<f64> {
            self.0.backprop(inputs, output_grad)
        }
        fn into_predictor(self: Box<Self>) -> Option<Model> {
            None
        }
    }

    #[test]
    fn models_without_predictor_are_rejected() {
        let (mut inputs, mut outputs) = plane(10, 7);
        let mut config = TrainerConfig::new(Algorithm::Linear);
        config.convergence = quick(1, 50);
        let err = Trainer::new(config)
            .train_model(Box::new(Opaque(LinearModel::new(2, 1))), &mut inputs, &mut outputs, None)
            .unwrap_err();
        assert!(matches!(err, TrainerError::PredictorCastError { .. }));
    }

    #[test]
    fn empty_data_is_rejected() {
        let mut inputs = Array2::<f64>::zeros((0, 2));
        let mut outputs = Array2::<f64>::zeros((0, 1));
        let err = Trainer::new(TrainerConfig::new(Algorithm::Linear))
            .train(&mut inputs, &mut outputs, None)
            .unwrap_err();
        assert!(matches!(err, TrainerError::NoSamples));
    }

    #[test]
    fn weights_without_mass_are_rejected() {
        let (mut inputs, mut outputs) = plane(6, 8);
        let before = inputs.clone();
        let trainer = Trainer::new(TrainerConfig::new(Algorithm::Linear));
        let zero = Array1::<f64>::zeros(6);
        let err = trainer.train(&mut inputs, &mut outputs, Some(zero.view())).unwrap_err();
        assert!(matches!(err, TrainerError::InvalidWeights { sum } if sum == 0.0));
        let cancelling = array![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        assert!(matches!(
            trainer.train(&mut inputs, &mut outputs, Some(cancelling.view())),
            Err(TrainerError::InvalidWeights { .. })
        ));
        assert_eq!(inputs, before);
    }
}
