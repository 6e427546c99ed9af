use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::SmallRng, Rng};
use serde::{Deserialize, Serialize};

use super::TrainerError;

/// Layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Hyperbolic tangent.
    Tanh,
    /// Identity.
    Linear,
}

/// Dense layer, `activation(x . weights + bias)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    weights: Array2<f64>,
    bias: Array1<f64>,
    activation: Activation,
}

impl Layer {
    /// Zero-initialised layer.
    #[must_use]
    pub fn new(inputs: usize, outputs: usize, activation: Activation) -> Self {
        Self {
            weights: Array2::zeros((inputs, outputs)),
            bias: Array1::zeros(outputs),
            activation,
        }
    }

    fn forward(&self, input: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = input.dot(&self.weights) + &self.bias;
        if self.activation == Activation::Tanh {
            out.mapv_inplace(f64::tanh);
        }
        out
    }

    fn randomize(&mut self, rng: &mut SmallRng) {
        let (fan_in, fan_out) = self.weights.dim();
        let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
        self.weights.mapv_inplace(|_| rng.gen_range(-bound..bound));
        self.bias.fill(0.0);
    }
}

fn flatten(layers: &[Layer]) -> Vec<f64> {
    layers
        .iter()
        .flat_map(|layer| layer.weights.iter().chain(layer.bias.iter()).copied())
        .collect()
}

fn assign(layers: &mut [Layer], params: &[f64]) {
    let expected: usize = layers.iter().map(|l| l.weights.len() + l.bias.len()).sum();
    assert_eq!(params.len(), expected, "parameter vector length");
    let mut values = params.iter().copied();
    for layer in layers {
        for (slot, value) in layer.weights.iter_mut().chain(layer.bias.iter_mut()).zip(&mut values) {
            *slot = value;
        }
    }
}

fn penalized(layers: &[Layer]) -> Vec<bool> {
    layers
        .iter()
        .flat_map(|layer| {
            std::iter::repeat(true)
                .take(layer.weights.len())
                .chain(std::iter::repeat(false).take(layer.bias.len()))
        })
        .collect()
}

fn forward(layers: &[Layer], input: ArrayView2<'_, f64>) -> Array2<f64> {
    layers
        .iter()
        .fold(input.to_owned(), |acc, layer| layer.forward(acc.view()))
}

/// Gradient of `sum(output_grad * prediction)` with respect to every parameter.
fn backprop(layers: &[Layer], input: ArrayView2<'_, f64>, output_grad: ArrayView2<'_, f64>) -> Vec<f64> {
    let mut activations = vec![input.to_owned()];
    for layer in layers {
        let next = layer.forward(activations[activations.len() - 1].view());
        activations.push(next);
    }
    let mut grads: Vec<(Array2<f64>, Array1<f64>)> = Vec::with_capacity(layers.len());
    let mut delta = output_grad.to_owned();
    for (idx, layer) in layers.iter().enumerate().rev() {
        if layer.activation == Activation::Tanh {
            delta = delta * activations[idx + 1].mapv(|a| 1.0 - a * a);
        }
        grads.push((activations[idx].t().dot(&delta), delta.sum_axis(Axis(0))));
        if idx > 0 {
            delta = delta.dot(&layer.weights.t());
        }
    }
    grads
        .iter()
        .rev()
        .flat_map(|(w, b)| w.iter().chain(b.iter()).copied())
        .collect()
}

/// A regression model the trainer can fit.
///
/// Parameters are exposed as one flat vector so the optimiser stays
/// model-agnostic.
pub trait Trainable: Send {
    /// Algorithm name for logs.
    fn name(&self) -> &str;

    /// Input width.
    fn input_dim(&self) -> usize;

    /// Output width.
    fn output_dim(&self) -> usize;

    /// Current parameters.
    fn parameters(&self) -> Vec<f64>;

    /// Replaces every parameter.
    fn set_parameters(&mut self, params: &[f64]);

    /// Which parameters the regularizer applies to.
    fn penalized(&self) -> Vec<bool>;

    /// Draws fresh initial parameters.
    fn randomize(&mut self, rng: &mut SmallRng);

    /// Evaluates the model on each row of `inputs`.
    fn predict(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64>;

    /// Gradient of `sum(output_grad * predict(inputs))` with respect to the parameters.
    fn backprop(&self, inputs: ArrayView2<'_, f64>, output_grad: ArrayView2<'_, f64>) -> Vec<f64>;

    /// Fits the weighted squared error plus `ridge` times half the squared
    /// penalized parameters in closed form. `None` when the model has no such
    /// solution.
    fn linear_solve(
        &mut self,
        _inputs: ArrayView2<'_, f64>,
        _outputs: ArrayView2<'_, f64>,
        _weights: Option<ArrayView1<'_, f64>>,
        _ridge: f64,
    ) -> Option<Result<(), TrainerError>> {
        None
    }

    /// Converts the fitted model into a persistable predictor.
    fn into_predictor(self: Box<Self>) -> Option<Model>;
}

/// Affine least-squares model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    layer: Layer,
}

impl LinearModel {
    /// Zero-initialised model.
    #[must_use]
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            layer: Layer::new(inputs, outputs, Activation::Linear),
        }
    }
}

impl Trainable for LinearModel {
    fn name(&self) -> &str {
        "linear"
    }

    fn input_dim(&self) -> usize {
        self.layer.weights.nrows()
    }

    fn output_dim(&self) -> usize {
        self.layer.weights.ncols()
    }

    fn parameters(&self) -> Vec<f64> {
        flatten(std::slice::from_ref(&self.layer))
    }

    fn set_parameters(&mut self, params: &[f64]) {
        assign(std::slice::from_mut(&mut self.layer), params);
    }

    fn penalized(&self) -> Vec<bool> {
        penalized(std::slice::from_ref(&self.layer))
    }

    fn randomize(&mut self, rng: &mut SmallRng) {
        self.layer.weights.mapv_inplace(|_| rng.gen_range(-0.05..0.05));
        self.layer.bias.mapv_inplace(|_| rng.gen_range(-0.05..0.05));
    }

    fn predict(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
        self.layer.forward(inputs)
    }

    fn backprop(&self, inputs: ArrayView2<'_, f64>, output_grad: ArrayView2<'_, f64>) -> Vec<f64> {
        backprop(std::slice::from_ref(&self.layer), inputs, output_grad)
    }

    fn linear_solve(
        &mut self,
        inputs: ArrayView2<'_, f64>,
        outputs: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
        ridge: f64,
    ) -> Option<Result<(), TrainerError>> {
        let (rows, dim) = inputs.dim();
        let mut design = Array2::ones((rows, dim + 1));
        design.slice_mut(s![.., ..dim]).assign(&inputs);
        let mut weighted = design.clone();
        let mut total = rows as f64;
        if let Some(w) = weights {
            total = w.sum();
            for (mut row, &wi) in weighted.rows_mut().into_iter().zip(w) {
                row *= wi;
            }
        }
        let mut normal = weighted.t().dot(&design) / total;
        for idx in 0..dim {
            normal[[idx, idx]] += ridge;
        }
        let rhs = weighted.t().dot(&outputs) / total;
        Some(gaussian_solve(normal, rhs).map(|beta| {
            self.layer.weights.assign(&beta.slice(s![..dim, ..]));
            self.layer.bias.assign(&beta.row(dim));
        }))
    }

    fn into_predictor(self: Box<Self>) -> Option<Model> {
        Some(Model::Linear(*self))
    }
}

/// Solves `a x = b` for every column of `b` with partial pivoting.
fn gaussian_solve(mut a: Array2<f64>, mut b: Array2<f64>) -> Result<Array2<f64>, TrainerError> {
    let n = a.nrows();
    let scale = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(f64::MIN_POSITIVE);
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() <= 1e-12 * scale {
            return Err(TrainerError::SingularSystem { column: col });
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
            }
            for k in 0..b.ncols() {
                b.swap([pivot, k], [col, k]);
            }
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            for k in 0..b.ncols() {
                b[[row, k]] -= factor * b[[col, k]];
            }
        }
    }
    for col in (0..n).rev() {
        for k in 0..b.ncols() {
            let tail: f64 = (col + 1..n).map(|j| a[[col, j]] * b[[j, k]]).sum();
            b[[col, k]] = (b[[col, k]] - tail) / a[[col, col]];
        }
    }
    Ok(b)
}

/// Feed-forward network with tanh hidden layers and a linear output layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardNet {
    layers: Vec<Layer>,
}

impl FeedForwardNet {
    /// Zero-initialised network with the given hidden widths.
    #[must_use]
    pub fn new(inputs: usize, hidden: &[usize], outputs: usize) -> Self {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut width = inputs;
        for &next in hidden {
            layers.push(Layer::new(width, next, Activation::Tanh));
            width = next;
        }
        layers.push(Layer::new(width, outputs, Activation::Linear));
        Self { layers }
    }
}

impl Trainable for FeedForwardNet {
    fn name(&self) -> &str {
        "network"
    }

    fn input_dim(&self) -> usize {
        self.layers[0].weights.nrows()
    }

    fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].weights.ncols()
    }

    fn parameters(&self) -> Vec<f64> {
        flatten(&self.layers)
    }

    fn set_parameters(&mut self, params: &[f64]) {
        assign(&mut self.layers, params);
    }

    fn penalized(&self) -> Vec<bool> {
        penalized(&self.layers)
    }

    fn randomize(&mut self, rng: &mut SmallRng) {
        for layer in &mut self.layers {
            layer.randomize(rng);
        }
    }

    fn predict(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
        forward(&self.layers, inputs)
    }

    fn backprop(&self, inputs: ArrayView2<'_, f64>, output_grad: ArrayView2<'_, f64>) -> Vec<f64> {
        backprop(&self.layers, inputs, output_grad)
    }

    fn into_predictor(self: Box<Self>) -> Option<Model> {
        Some(Model::Network(*self))
    }
}

/// A fitted model as persisted in predictor files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Model {
    /// Affine model.
    Linear(LinearModel),
    /// Feed-forward network.
    Network(FeedForwardNet),
}

impl Model {
    /// Evaluates the model on each row of `inputs` (scaled space).
    #[must_use]
    pub fn predict(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
        match self {
            Self::Linear(model) => model.predict(inputs),
            Self::Network(model) => model.predict(inputs),
        }
    }

    /// Input width.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        match self {
            Self::Linear(model) => model.input_dim(),
            Self::Network(model) => model.input_dim(),
        }
    }

    /// Output width.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        match self {
            Self::Linear(model) => model.output_dim(),
            Self::Network(model) => model.output_dim(),
        }
    }
}
