use std::ops::{Deref, DerefMut};

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Scaling strategy fitted per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    /// No scaling.
    Identity,
    /// Zero mean, unit variance.
    #[default]
    Normal,
    /// Maps the observed range to [-1, 1].
    Range,
}

/// Per-column affine transform, `scaled = (value - shift) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    #[serde(rename = "type")]
    kind: ScalerKind,
    shift: Vec<f64>,
    scale: Vec<f64>,
}

impl Scaler {
    /// Scaler that leaves `dim` columns untouched.
    #[must_use]
    pub fn identity(dim: usize) -> Self {
        Self {
            kind: ScalerKind::Identity,
            shift: vec![0.0; dim],
            scale: vec![1.0; dim],
        }
    }

    /// Fits a scaler of `kind` to the columns of `data`.
    ///
    /// Constant columns keep unit scale; an empty matrix fits the identity.
    #[must_use]
    pub fn fit(kind: ScalerKind, data: ArrayView2<'_, f64>) -> Self {
        let dim = data.ncols();
        if data.nrows() == 0 {
            return Self::identity(dim);
        }
        let (shift, scale): (Vec<f64>, Vec<f64>) = match kind {
            ScalerKind::Identity => return Self::identity(dim),
            ScalerKind::Normal => data
                .axis_iter(Axis(1))
                .map(|column| {
                    let mean = column.mean().unwrap_or(0.0);
                    let std = column.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0).sqrt();
                    (mean, std)
                })
                .unzip(),
            ScalerKind::Range => data
                .axis_iter(Axis(1))
                .map(|column| {
                    let (lo, hi) = column
                        .iter()
                        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                    ((lo + hi) / 2.0, (hi - lo) / 2.0)
                })
                .unzip(),
        };
        let scale = scale
            .into_iter()
            .map(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 })
            .collect();
        Self { kind, shift, scale }
    }

    /// Strategy the scaler was fitted with.
    #[must_use]
    pub const fn kind(&self) -> ScalerKind {
        self.kind
    }

    /// Number of columns.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.shift.len()
    }

    /// Scales one row in place.
    pub fn scale_row(&self, row: &mut [f64]) {
        for ((value, shift), scale) in row.iter_mut().zip(&self.shift).zip(&self.scale) {
            *value = (*value - shift) / scale;
        }
    }

    /// Inverts [`Scaler::scale_row`].
    pub fn unscale_row(&self, row: &mut [f64]) {
        for ((value, shift), scale) in row.iter_mut().zip(&self.shift).zip(&self.scale) {
            *value = *value * scale + shift;
        }
    }

    /// Scales every row of `data` in place.
    ///
    /// # Panics
    /// Panics when the column count differs from the fitted dimension.
    pub fn scale(&self, data: &mut Array2<f64>) {
        self.apply(data, Self::scale_row);
    }

    /// Unscales every row of `data` in place.
    ///
    /// # Panics
    /// Panics when the column count differs from the fitted dimension.
    pub fn unscale(&self, data: &mut Array2<f64>) {
        self.apply(data, Self::unscale_row);
    }

    fn apply(&self, data: &mut Array2<f64>, op: fn(&Self, &mut [f64])) {
        assert_eq!(data.ncols(), self.dim(), "scaler fitted on a different column count");
        for mut row in data.rows_mut() {
            let mut buffer = row.to_vec();
            op(self, &mut buffer);
            row.iter_mut().zip(buffer).for_each(|(dst, src)| *dst = src);
        }
    }
}

/// Scales a matrix in place and unscales it again when dropped.
pub struct Scaled<'a> {
    data: &'a mut Array2<f64>,
    scaler: &'a Scaler,
}

impl<'a> Scaled<'a> {
    /// Scales `data` with `scaler` for the lifetime of the guard.
    pub fn new(data: &'a mut Array2<f64>, scaler: &'a Scaler) -> Self {
        scaler.scale(data);
        Self { data, scaler }
    }
}

impl Deref for Scaled<'_> {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl DerefMut for Scaled<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.data
    }
}

impl Drop for Scaled<'_> {
    fn drop(&mut self) {
        self.scaler.unscale(&mut *self.data);
    }
}
