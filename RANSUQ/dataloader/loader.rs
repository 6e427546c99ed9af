use std::path::Path;

use indexmap::IndexSet;
use ndarray::Array2;
use thiserror::Error;

use crate::{
    field::{FieldTransformer, TransformError},
    format::{Format, FormatError},
};

/// The deduplicated raw columns behind a feature request.
#[derive(Debug, Clone)]
pub struct RawPlan {
    raw_names: Vec<String>,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone)]
struct Binding {
    feature: String,
    transformer: FieldTransformer,
    /// Position of each of the transformer's raw names in `raw_names`.
    columns: Vec<usize>,
}

impl RawPlan {
    /// Raw columns to read, in first-discovery order.
    #[must_use]
    pub fn raw_names(&self) -> &[String] {
        &self.raw_names
    }

    /// Applies every transformer to the raw matrix read for this plan.
    pub fn materialize(&self, raw: &Array2<f64>) -> Result<Array2<f64>, LoadError> {
        assert_eq!(
            raw.ncols(),
            self.raw_names.len(),
            "raw matrix width must match the plan"
        );
        let mut out = Array2::zeros((raw.nrows(), self.bindings.len()));
        let mut scratch = Vec::new();
        for (row_idx, (raw_row, mut out_row)) in raw.rows().into_iter().zip(out.rows_mut()).enumerate() {
            for (binding, slot) in self.bindings.iter().zip(out_row.iter_mut()) {
                scratch.clear();
                scratch.extend(binding.columns.iter().map(|&col| raw_row[col]));
                *slot = binding
                    .transformer
                    .apply(&scratch)
                    .map_err(|source| LoadError::MalformedRow {
                        feature: binding.feature.clone(),
                        row: row_idx,
                        source,
                    })?;
            }
        }
        Ok(out)
    }
}

/// Resolves `features` against `format` and computes the raw column union.
pub fn plan_features(format: &dyn Format, features: &[String]) -> Result<RawPlan, LoadError> {
    let mut raw_names: IndexSet<String> = IndexSet::new();
    let mut bindings = Vec::with_capacity(features.len());
    for feature in features {
        let transformer = format
            .resolve(feature)
            .ok_or_else(|| LoadError::UnknownFeature {
                feature: feature.clone(),
                format: format.name().to_string(),
            })?;
        let columns = transformer
            .raw_names()
            .iter()
            .map(|raw| raw_names.insert_full(raw.clone()).0)
            .collect();
        bindings.push(Binding {
            feature: feature.clone(),
            transformer,
            columns,
        });
    }
    Ok(RawPlan {
        raw_names: raw_names.into_iter().collect(),
        bindings,
    })
}

/// Loads `features` from `source`: each raw column is read once, then every
/// feature's transform runs over its slice of the row.
///
/// The returned matrix has one row per data line and one column per feature,
/// in request order.
pub fn load_features(
    format: &dyn Format,
    source: &Path,
    features: &[String],
) -> Result<Array2<f64>, LoadError> {
    let plan = plan_features(format, features)?;
    let raw = format.read_raw_columns(plan.raw_names(), source)?;
    if raw.ncols() != plan.raw_names().len() {
        return Err(LoadError::RawWidth {
            expected: plan.raw_names().len(),
            found: raw.ncols(),
        });
    }
    plan.materialize(&raw)
}

/// Errors raised while materializing features.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No transformer exists for the requested feature.
    #[error("unknown feature {feature} for format {format}")]
    UnknownFeature {
        /// Requested feature.
        feature: String,
        /// Format consulted.
        format: String,
    },
    /// Reading raw columns failed.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// The format returned a different number of raw columns than requested.
    #[error("format returned {found} raw columns, expected {expected}")]
    RawWidth {
        /// Requested raw columns.
        expected: usize,
        /// Returned raw columns.
        found: usize,
    },
    /// A transform rejected a row.
    #[error("feature {feature}, row {row}: {source}")]
    MalformedRow {
        /// Feature being computed.
        feature: String,
        /// Zero-based data row.
        row: usize,
        /// Transform failure.
        #[source]
        source: TransformError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CsvFormat;
    use ndarray::array;
    use parking_lot::Mutex;
    use std::{fs, path::PathBuf};
    use tempfile::tempdir;

    fn scenario_csv(dir: &Path) -> PathBuf {
        let path = dir.join("flat.csv");
        fs::write(&path, "\"x\",\"y\",\"nu\",\"nuhat\"\n1.0,2.0,1e-3,2e-3\n3.0,4.0,1.5e-3,2.5e-3\n")
            .unwrap();
        path
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn loads_plain_columns() {
        let dir = tempdir().unwrap();
        let path = scenario_csv(dir.path());
        let m = load_features(&CsvFormat::default(), &path, &names(&["x", "y"])).unwrap();
        assert_eq!(m, array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn ratio_feature_divides_by_second_column() {
        let dir = tempdir().unwrap();
        let path = scenario_csv(dir.path());
        let format =
            CsvFormat::default().with_transformer("Chi", FieldTransformer::ratio("nuhat", "nu"));
        let m = load_features(&format, &path, &names(&["Chi"])).unwrap();
        assert!((m[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((m[[1, 0]] - 2.5 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn repeated_loads_are_identical() {
        let dir = tempdir().unwrap();
        let path = scenario_csv(dir.path());
        let format =
            CsvFormat::default().with_transformer("Chi", FieldTransformer::ratio("nuhat", "nu"));
        let features = names(&["Chi", "x", "nuhat"]);
        let first = load_features(&format, &path, &features).unwrap();
        let second = load_features(&format, &path, &features).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn column_values_do_not_depend_on_companions() {
        let dir = tempdir().unwrap();
        let path = scenario_csv(dir.path());
        let format =
            CsvFormat::default().with_transformer("Chi", FieldTransformer::ratio("nuhat", "nu"));
        let alone = load_features(&format, &path, &names(&["Chi"])).unwrap();
        let shared = load_features(&format, &path, &names(&["nuhat", "Chi", "nu"])).unwrap();
        assert_eq!(alone.column(0), shared.column(1));
    }

    /// Records every raw column requested from it.
    #[derive(Debug, Default)]
    struct RecordingFormat {
        reads: Mutex<Vec<String>>,
    }

    impl Format for RecordingFormat {
        fn name(&self) -> &str {
            "recording"
        }

        fn resolve(&self, feature: &str) -> Option<FieldTransformer> {
            match feature {
                "A" => Some(FieldTransformer::identity("shared")),
                "B" => Some(FieldTransformer::new(["shared", "other"], |v| Ok(v[0] + v[1]))),
                "C" => Some(FieldTransformer::ratio("other", "shared")),
                _ => None,
            }
        }

        fn read_raw_columns(
            &self,
            names: &[String],
            _source: &Path,
        ) -> Result<Array2<f64>, FormatError> {
            self.reads.lock().extend(names.iter().cloned());
            let row: Vec<f64> = names
                .iter()
                .map(|n| if n == "shared" { 2.0 } else { 10.0 })
                .collect();
            Ok(Array2::from_shape_vec((1, names.len()), row).unwrap())
        }
    }

    #[test]
    fn shared_raw_column_is_read_once() {
        let format = RecordingFormat::default();
        let m = load_features(&format, Path::new("unused"), &names(&["A", "B", "C"])).unwrap();
        assert_eq!(m, array![[2.0, 12.0, 5.0]]);
        assert_eq!(*format.reads.lock(), names(&["shared", "other"]));
    }

    #[test]
    fn unknown_feature_fails_before_reading() {
        let format = RecordingFormat::default();
        let err = load_features(&format, Path::new("unused"), &names(&["A", "Z"])).unwrap_err();
        assert!(matches!(err, LoadError::UnknownFeature { ref feature, .. } if feature == "Z"));
        assert!(format.reads.lock().is_empty());
    }

    #[test]
    fn malformed_cell_surfaces_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "x,y\n1.0,abc\n").unwrap();
        let err = load_features(&CsvFormat::default(), &path, &names(&["y"])).unwrap_err();
        assert!(matches!(err, LoadError::Format(FormatError::ParseError { .. })));
    }
}
