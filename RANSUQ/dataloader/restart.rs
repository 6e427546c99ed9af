use std::{fs, path::Path};

use indexmap::IndexMap;
use ndarray::{Array2, ArrayView2};

use crate::{
    field::{FieldTransformer, TransformError},
    format::{
        read_columns, read_source, split_row, split_table, AppendableFormat, Format, FormatError,
        TableLayout,
    },
};

/// Wall distance above which a vanishing dimensional term overrides its nondimensional form.
pub const WALL_DISTANCE_THRESHOLD: f64 = 1e-4;
/// Magnitude below which a dimensional source term counts as underflowed.
pub const DIMENSIONAL_UNDERFLOW: f64 = 1e-10;

const LAYOUT: TableLayout = TableLayout {
    header_delimiter: ',',
    row_delimiter: '\t',
};

const DENSITY: &str = "Conservative_1";
const X_MOMENTUM: &str = "Conservative_2";
const Y_MOMENTUM: &str = "Conservative_3";
const NU_HAT: &str = "Conservative_5";
const LAM_VISC: &str = "Laminar_Viscosity";
const WALL_DIST: &str = "Wall_Distance";

/// Restart file written by the flow solver: comma-delimited quoted header,
/// tab-delimited data rows, one row per mesh point ordered by `PointID`.
#[derive(Debug, Clone)]
pub struct RestartFormat {
    dictionary: IndexMap<String, FieldTransformer>,
}

impl Default for RestartFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartFormat {
    /// Builds the feature dictionary.
    #[must_use]
    pub fn new() -> Self {
        let mut dictionary = IndexMap::new();
        let identities = [
            ("PointID", "PointID"),
            ("XLoc", "x"),
            ("YLoc", "y"),
            ("Density", DENSITY),
            ("NuHat", NU_HAT),
            ("Pressure", "Pressure"),
            ("LamVisc", LAM_VISC),
            ("WallDistance", WALL_DIST),
            ("DUDX", "DUDX"),
            ("DUDY", "DUDY"),
            ("DVDX", "DVDX"),
            ("DVDY", "DVDY"),
            ("DNuHatDX", "DNuHatDX"),
            ("DNuHatDY", "DNuHatDY"),
            ("Production", "Production"),
            ("Destruction", "Destruction"),
            ("CrossProduction", "CrossProduction"),
            ("Source", "Source"),
            ("NondimProduction", "Nondim_Production"),
            ("NondimDestruction", "Nondim_Destruction"),
            ("NondimCrossProduction", "Nondim_CrossProduction"),
            ("NondimSource", "Nondim_Source"),
        ];
        for (logical, raw) in identities {
            dictionary.insert(logical.to_string(), FieldTransformer::identity(raw));
        }

        dictionary.insert("UVel".into(), FieldTransformer::ratio(X_MOMENTUM, DENSITY));
        dictionary.insert("VVel".into(), FieldTransformer::ratio(Y_MOMENTUM, DENSITY));
        dictionary.insert(
            "KinematicViscosity".into(),
            FieldTransformer::ratio(LAM_VISC, DENSITY),
        );
        dictionary.insert(
            "Chi".into(),
            FieldTransformer::new([NU_HAT, DENSITY, LAM_VISC], |v| {
                nonzero(v[2], LAM_VISC).map(|mu| v[0] * v[1] / mu)
            }),
        );
        dictionary.insert(
            "Vorticity".into(),
            FieldTransformer::new(["DVDX", "DUDY"], |v| Ok((v[0] - v[1]).abs())),
        );
        dictionary.insert(
            "OmegaNondim".into(),
            FieldTransformer::new(["DVDX", "DUDY", WALL_DIST, NU_HAT, LAM_VISC, DENSITY], |v| {
                let viscosity = total_viscosity(v[3], v[4], v[5])?;
                Ok((v[0] - v[1]).abs() * v[2] * v[2] / viscosity)
            }),
        );
        dictionary.insert(
            "NuHatGradNorm".into(),
            FieldTransformer::new(["DNuHatDX", "DNuHatDY"], |v| Ok(v[0].hypot(v[1]))),
        );
        dictionary.insert(
            "NuHatGradNormNondim".into(),
            FieldTransformer::new(
                ["DNuHatDX", "DNuHatDY", WALL_DIST, NU_HAT, LAM_VISC, DENSITY],
                |v| {
                    let viscosity = total_viscosity(v[3], v[4], v[5])?;
                    Ok(v[0].hypot(v[1]) * v[2] / viscosity)
                },
            ),
        );
        for term in ["Production", "Destruction", "CrossProduction", "Source"] {
            dictionary.insert(format!("Nondim{term}Mod"), thresholded(term));
        }
        Self { dictionary }
    }

    /// Logical features this format can produce.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.dictionary.keys().map(String::as_str)
    }
}

fn nonzero(value: f64, column: &str) -> Result<f64, TransformError> {
    if value == 0.0 {
        Err(TransformError::DivisionByZero {
            denominator: column.to_string(),
        })
    } else {
        Ok(value)
    }
}

/// `nu_hat + mu / rho`, the viscosity scale used to nondimensionalize.
fn total_viscosity(nu_hat: f64, mu: f64, rho: f64) -> Result<f64, TransformError> {
    let nu = mu / nonzero(rho, DENSITY)?;
    nonzero(nu_hat + nu, "NuHat+KinematicViscosity")
}

// Reads [Nondim_<term>, <term>, Wall_Distance].
fn thresholded(term: &str) -> FieldTransformer {
    FieldTransformer::new([format!("Nondim_{term}"), term.to_string(), WALL_DIST.into()], |v| {
        let (nondim, dimensional, distance) = (v[0], v[1], v[2]);
        if distance > WALL_DISTANCE_THRESHOLD && dimensional.abs() < DIMENSIONAL_UNDERFLOW {
            Ok(dimensional)
        } else {
            Ok(nondim)
        }
    })
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.trim_matches('"'))
}

impl Format for RestartFormat {
    fn name(&self) -> &str {
        "restart"
    }

    fn resolve(&self, feature: &str) -> Option<FieldTransformer> {
        self.dictionary.get(feature).cloned()
    }

    fn read_raw_columns(&self, names: &[String], source: &Path) -> Result<Array2<f64>, FormatError> {
        read_columns(source, LAYOUT, names)
    }

    fn as_appendable(&self) -> Option<&dyn AppendableFormat> {
        Some(self)
    }
}

impl AppendableFormat for RestartFormat {
    fn append_columns(
        &self,
        source: &Path,
        dest: &Path,
        names: &[String],
        values: ArrayView2<'_, f64>,
    ) -> Result<(), FormatError> {
        if values.ncols() != names.len() {
            return Err(FormatError::ColumnCountMismatch {
                expected: names.len(),
                found: values.ncols(),
            });
        }
        let contents = read_source(source)?;
        let table = split_table(&contents, LAYOUT, source)?;
        if table.rows.len() != values.nrows() {
            return Err(FormatError::RowCountMismatch {
                expected: table.rows.len(),
                found: values.nrows(),
            });
        }

        let header: Vec<String> = table
            .header
            .iter()
            .chain(names)
            .map(|name| quote(name))
            .collect();
        let mut out = header.join(",");
        out.push('\n');
        let width = table.header.len();
        for (&(line_no, line), extra) in table.rows.iter().zip(values.rows()) {
            let cells = split_row(line, LAYOUT.row_delimiter, width).map_err(|found| {
                FormatError::RowWidthMismatch {
                    path: source.to_path_buf(),
                    line: line_no,
                    expected: width,
                    found,
                }
            })?;
            let appended = extra.iter().map(|value| format!("{value:e}"));
            let row: Vec<String> = cells
                .into_iter()
                .map(str::to_string)
                .chain(appended)
                .collect();
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| FormatError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(dest, out).map_err(|source| FormatError::Io {
            path: dest.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn write_restart(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("restart_flow.dat");
        let header = [
            "PointID",
            "x",
            "Conservative_1",
            "Conservative_2",
            "Conservative_5",
            "Laminar_Viscosity",
            "Wall_Distance",
            "Production",
            "Nondim_Production",
        ]
        .map(|name| format!("\"{name}\""))
        .join(",");
        let rows = [
            "0\t0.5\t2.0\t4.0\t3e-5\t2e-5\t1e-3\t5e-11\t0.25",
            "1\t0.7\t1.0\t3.0\t1e-5\t1e-5\t1e-6\t5e-11\t0.5",
        ];
        fs::write(&path, format!("{header}\n{}\n", rows.join("\n"))).unwrap();
        path
    }

    fn eval(format: &RestartFormat, feature: &str, path: &Path) -> Vec<f64> {
        let transformer = format.resolve(feature).unwrap();
        let raw = format
            .read_raw_columns(transformer.raw_names(), path)
            .unwrap();
        raw.rows()
            .into_iter()
            .map(|row| transformer.apply(row.as_slice().unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn velocity_is_momentum_over_density() {
        let dir = tempdir().unwrap();
        let path = write_restart(dir.path());
        let format = RestartFormat::new();
        assert_eq!(eval(&format, "UVel", &path), vec![2.0, 3.0]);
        let chi = eval(&format, "Chi", &path);
        assert!((chi[0] - 3.0).abs() < 1e-12);
        assert!((chi[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn production_mod_switches_on_threshold() {
        let dir = tempdir().unwrap();
        let path = write_restart(dir.path());
        let values = eval(&RestartFormat::new(), "NondimProductionMod", &path);
        // First point is away from the wall with an underflowed term.
        assert_eq!(values, vec![5e-11, 0.5]);
    }

    #[test]
    fn unknown_feature_is_absent() {
        assert!(RestartFormat::new().resolve("Bogus").is_none());
        assert!(RestartFormat::new().features().any(|f| f == "OmegaNondim"));
    }

    #[test]
    fn appends_quoted_columns() {
        let dir = tempdir().unwrap();
        let path = write_restart(dir.path());
        let dest = dir.path().join("out/augmented.dat");
        let format = RestartFormat::new();
        format
            .as_appendable()
            .unwrap()
            .append_columns(&path, &dest, &["ML_Source".into()], array![[1.5], [-2.0]].view())
            .unwrap();
        let written = fs::read_to_string(&dest).unwrap();
        let header = written.lines().next().unwrap();
        assert!(header.starts_with("\"PointID\",\"x\""));
        assert!(header.ends_with(",\"ML_Source\""));
        let ml = format
            .read_raw_columns(&["ML_Source".into(), "x".into()], &dest)
            .unwrap();
        assert_eq!(ml, array![[1.5, 0.5], [-2.0, 0.7]]);
    }

    #[test]
    fn append_rejects_row_count_mismatch() {
        let dir = tempdir().unwrap();
        let path = write_restart(dir.path());
        let err = RestartFormat::new()
            .append_columns(&path, &dir.path().join("o.dat"), &["A".into()], array![[1.0]].view())
            .unwrap_err();
        assert!(matches!(err, FormatError::RowCountMismatch { expected: 2, found: 1 }));
    }
}
