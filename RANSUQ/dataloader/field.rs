use std::{fmt, sync::Arc};

use thiserror::Error;

type TransformFn = dyn Fn(&[f64]) -> Result<f64, TransformError> + Send + Sync;

/// Maps one or more raw columns onto a single logical feature.
///
/// Cloning is cheap; the raw names and the transform are shared.
#[derive(Clone)]
pub struct FieldTransformer {
    raw_names: Arc<[String]>,
    transform: Arc<TransformFn>,
}

impl FieldTransformer {
    /// Creates a transformer over `raw_names`.
    ///
    /// # Panics
    /// Panics when `raw_names` is empty; every feature reads at least one column.
    pub fn new<I, S, F>(raw_names: I, transform: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[f64]) -> Result<f64, TransformError> + Send + Sync + 'static,
    {
        let raw_names: Arc<[String]> = raw_names.into_iter().map(Into::into).collect();
        assert!(
            !raw_names.is_empty(),
            "field transformer needs at least one raw column"
        );
        Self {
            raw_names,
            transform: Arc::new(transform),
        }
    }

    /// Passes a single raw column through unchanged.
    pub fn identity(raw: impl Into<String>) -> Self {
        Self::new([raw.into()], |values| Ok(values[0]))
    }

    /// Divides `numerator` by `denominator` (e.g. momentum over density).
    pub fn ratio(numerator: impl Into<String>, denominator: impl Into<String>) -> Self {
        let numerator = numerator.into();
        let denominator = denominator.into();
        let label = denominator.clone();
        Self::new([numerator, denominator], move |values| {
            if values[1] == 0.0 {
                return Err(TransformError::DivisionByZero {
                    denominator: label.clone(),
                });
            }
            Ok(values[0] / values[1])
        })
    }

    /// Raw columns consumed, in the order the transform expects them.
    #[must_use]
    pub fn raw_names(&self) -> &[String] {
        &self.raw_names
    }

    /// Applies the transform to one row's raw values.
    pub fn apply(&self, inputs: &[f64]) -> Result<f64, TransformError> {
        if inputs.len() != self.raw_names.len() {
            return Err(TransformError::MalformedRow {
                expected: self.raw_names.len(),
                found: inputs.len(),
            });
        }
        (self.transform)(inputs)
    }
}

impl fmt::Debug for FieldTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldTransformer")
            .field("raw_names", &self.raw_names)
            .finish_non_exhaustive()
    }
}

/// Failures raised while combining raw values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// Input vector length disagrees with the transformer's raw columns.
    #[error("malformed row: expected {expected} raw values, found {found}")]
    MalformedRow {
        /// Raw columns the transformer declares.
        expected: usize,
        /// Values supplied.
        found: usize,
    },
    /// A ratio denominator was exactly zero.
    #[error("division by zero in column {denominator}")]
    DivisionByZero {
        /// Raw column used as denominator.
        denominator: String,
    },
}
