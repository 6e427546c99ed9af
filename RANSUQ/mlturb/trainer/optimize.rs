use serde::{Deserialize, Serialize};
use thiserror::Error;

const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-20;
const MAX_STEP: f64 = 1e6;

/// Stopping criteria for iterative training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    /// Stop once an accepted step improves the objective by less than this.
    pub objective_tol: f64,
    /// Stop once the largest gradient component is below this.
    pub gradient_tol: f64,
    /// Objective/gradient evaluation budget.
    pub max_evaluations: usize,
    /// Seed for initial parameters and round-trip checks; entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for Convergence {
    fn default() -> Self {
        Self {
            objective_tol: 1e-10,
            gradient_tol: 1e-8,
            max_evaluations: 20_000,
            seed: None,
        }
    }
}

/// Why training stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Solved directly, no iterations.
    ClosedForm,
    /// Objective improvement fell below tolerance.
    ObjectiveTolerance,
    /// Gradient fell below tolerance.
    GradientTolerance,
    /// Evaluation budget spent.
    MaxEvaluations,
    /// No step length decreased the objective.
    LineSearchStalled,
}

/// Result of [`minimize`].
#[derive(Debug, Clone)]
pub struct Minimum {
    /// Best parameters found.
    pub params: Vec<f64>,
    /// Objective at `params`.
    pub objective: f64,
    /// Evaluations used.
    pub evaluations: usize,
    /// Stop reason.
    pub stop: StopReason,
}

/// Optimizer failures.
#[derive(Debug, Error, PartialEq)]
pub enum OptimizeError {
    /// The starting point has a NaN or infinite objective or gradient.
    #[error("objective is not finite at the initial parameters")]
    NonFiniteStart,
    /// The evaluation budget is zero.
    #[error("evaluation budget is zero")]
    NoBudget,
}

fn inf_norm(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// Gradient descent with Armijo backtracking.
///
/// `objective` returns the value and gradient at a point. The step length
/// doubles after each accepted step and halves on each rejected trial.
pub fn minimize(
    mut objective: impl FnMut(&[f64]) -> (f64, Vec<f64>),
    start: Vec<f64>,
    convergence: &Convergence,
) -> Result<Minimum, OptimizeError> {
    if convergence.max_evaluations == 0 {
        return Err(OptimizeError::NoBudget);
    }
    let mut params = start;
    let (mut value, mut grad) = objective(&params);
    let mut evaluations = 1;
    if !value.is_finite() || grad.iter().any(|g| !g.is_finite()) {
        return Err(OptimizeError::NonFiniteStart);
    }
    let mut step = 1.0;
    let stop = loop {
        if inf_norm(&grad) <= convergence.gradient_tol {
            break StopReason::GradientTolerance;
        }
        let slope: f64 = grad.iter().map(|g| g * g).sum();
        let accepted = loop {
            if evaluations >= convergence.max_evaluations {
                break None;
            }
            if step < MIN_STEP {
                break None;
            }
            let trial: Vec<f64> = params.iter().zip(&grad).map(|(p, g)| p - step * g).collect();
            let (trial_value, trial_grad) = objective(&trial);
            evaluations += 1;
            if trial_value.is_finite() && trial_value <= value - ARMIJO * step * slope {
                break Some((trial, trial_value, trial_grad));
            }
            step *= 0.5;
        };
        let Some((trial, trial_value, trial_grad)) = accepted else {
            break if evaluations >= convergence.max_evaluations {
                StopReason::MaxEvaluations
            } else {
                StopReason::LineSearchStalled
            };
        };
        let improvement = value - trial_value;
        params = trial;
        value = trial_value;
        grad = trial_grad;
        if improvement <= convergence.objective_tol {
            break StopReason::ObjectiveTolerance;
        }
        if evaluations >= convergence.max_evaluations {
            break StopReason::MaxEvaluations;
        }
        step = (step * 2.0).min(MAX_STEP);
    };
    Ok(Minimum {
        params,
        objective: value,
        evaluations,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bowl(x: &[f64]) -> (f64, Vec<f64>) {
        let value = (x[0] - 3.0).powi(2) + 10.0 * (x[1] + 1.0).powi(2);
        (value, vec![2.0 * (x[0] - 3.0), 20.0 * (x[1] + 1.0)])
    }

    #[test]
    fn finds_quadratic_minimum() {
        let convergence = Convergence {
            objective_tol: 0.0,
            gradient_tol: 1e-9,
            max_evaluations: 10_000,
            seed: None,
        };
        let min = minimize(bowl, vec![0.0, 0.0], &convergence).unwrap();
        assert_eq!(min.stop, StopReason::GradientTolerance);
        assert!((min.params[0] - 3.0).abs() < 1e-8);
        assert!((min.params[1] + 1.0).abs() < 1e-8);
    }

    #[test]
    fn respects_evaluation_budget() {
        let convergence = Convergence {
            objective_tol: 0.0,
            gradient_tol: 0.0,
            max_evaluations: 40,
            seed: None,
        };
        let min = minimize(bowl, vec![100.0, 100.0], &convergence).unwrap();
        assert_eq!(min.stop, StopReason::MaxEvaluations);
        assert_eq!(min.evaluations, 40);
        assert!(min.objective < bowl(&[100.0, 100.0]).0);
    }

    #[test]
    fn rejects_non_finite_start() {
        let err = minimize(|_| (f64::NAN, vec![0.0]), vec![0.0], &Convergence::default()).unwrap_err();
        assert_eq!(err, OptimizeError::NonFiniteStart);
    }
}
