use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use ndarray::{Array2, ArrayView2, ShapeError};
use thiserror::Error;

use crate::field::FieldTransformer;

/// A source-file convention: knows its logical features and how to read raw columns.
pub trait Format: Send + Sync + fmt::Debug {
    /// Short label used in diagnostics.
    fn name(&self) -> &str;

    /// Looks up the transformer producing `feature`.
    fn resolve(&self, feature: &str) -> Option<FieldTransformer>;

    /// Reads the named raw columns from `source`, one row per data line,
    /// columns in the order of `names`.
    fn read_raw_columns(&self, names: &[String], source: &Path) -> Result<Array2<f64>, FormatError>;

    /// Returns the append capability when the format supports rewriting files.
    fn as_appendable(&self) -> Option<&dyn AppendableFormat> {
        None
    }
}

/// Formats that can re-serialize a source file with extra computed columns.
pub trait AppendableFormat: Format {
    /// Writes `source` to `dest` with `names` appended to the header and the
    /// matching column of `values` appended to every data row.
    fn append_columns(
        &self,
        source: &Path,
        dest: &Path,
        names: &[String],
        values: ArrayView2<'_, f64>,
    ) -> Result<(), FormatError>;
}

/// Errors raised while reading or writing formatted files.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Filesystem failure.
    #[error("io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File has no header line.
    #[error("{path} is empty")]
    EmptyFile {
        /// File involved.
        path: PathBuf,
    },
    /// Requested raw column is absent from the header.
    #[error("field {field} not found in header of {path}")]
    MissingField {
        /// Raw column requested.
        field: String,
        /// File involved.
        path: PathBuf,
    },
    /// A data row has a different number of cells than the header.
    #[error("{path}:{line}: expected {expected} columns, found {found}")]
    RowWidthMismatch {
        /// File involved.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Header width.
        expected: usize,
        /// Cells found on the line.
        found: usize,
    },
    /// A cell failed to parse as a number.
    #[error("{path}:{line}: column {column} value {value:?} is not a number")]
    ParseError {
        /// File involved.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Raw column name.
        column: String,
        /// Offending text.
        value: String,
    },
    /// Appended values do not line up with the file's rows.
    #[error("cannot append {found} rows to a file with {expected} rows")]
    RowCountMismatch {
        /// Rows in the source file.
        expected: usize,
        /// Rows supplied.
        found: usize,
    },
    /// Appended values do not line up with the new column names.
    #[error("cannot append {found} value columns under {expected} names")]
    ColumnCountMismatch {
        /// Names supplied.
        expected: usize,
        /// Value columns supplied.
        found: usize,
    },
    /// Matrix assembly failed.
    #[error("matrix shape error: {0}")]
    Shape(#[from] ShapeError),
}

/// Delimiters used by a delimited text table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Delimiter between header names.
    pub header_delimiter: char,
    /// Delimiter between data cells; whitespace splitting is the fallback.
    pub row_delimiter: char,
}

/// Header and data lines of a delimited table.
#[derive(Debug)]
pub(crate) struct Table<'a> {
    pub(crate) header: Vec<String>,
    /// `(one-based line number, line)` for every non-blank data line.
    pub(crate) rows: Vec<(usize, &'a str)>,
}

pub(crate) fn read_source(path: &Path) -> Result<String, FormatError> {
    fs::read_to_string(path).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn split_table<'a>(
    contents: &'a str,
    layout: TableLayout,
    path: &Path,
) -> Result<Table<'a>, FormatError> {
    let mut lines = contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim_end()))
        .filter(|(_, line)| !line.trim().is_empty());
    let (_, header_line) = lines.next().ok_or_else(|| FormatError::EmptyFile {
        path: path.to_path_buf(),
    })?;
    Ok(Table {
        header: parse_header(header_line, layout.header_delimiter),
        rows: lines.collect(),
    })
}

/// Quoted headers are never split on whitespace.
fn parse_header(line: &str, delimiter: char) -> Vec<String> {
    let cells: Vec<&str> = if line.contains(delimiter) || line.contains('"') {
        line.split(delimiter).collect()
    } else {
        line.split_whitespace().collect()
    };
    cells
        .into_iter()
        .map(|cell| cell.trim().trim_matches('"').to_string())
        .collect()
}

/// Splits a data line into exactly `width` cells, retrying on whitespace.
pub(crate) fn split_row(line: &str, delimiter: char, width: usize) -> Result<Vec<&str>, usize> {
    let cells: Vec<&str> = line.split(delimiter).map(str::trim).collect();
    if cells.len() == width {
        return Ok(cells);
    }
    let fallback: Vec<&str> = line.split_whitespace().collect();
    if fallback.len() == width {
        Ok(fallback)
    } else {
        Err(cells.len())
    }
}

/// Reads `names` out of a delimited table at `path`.
pub(crate) fn read_columns(
    path: &Path,
    layout: TableLayout,
    names: &[String],
) -> Result<Array2<f64>, FormatError> {
    let contents = read_source(path)?;
    let table = split_table(&contents, layout, path)?;
    let indices = names
        .iter()
        .map(|name| {
            table
                .header
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| FormatError::MissingField {
                    field: name.clone(),
                    path: path.to_path_buf(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let width = table.header.len();
    let mut data = Vec::with_capacity(table.rows.len() * names.len());
    for &(line_no, line) in &table.rows {
        let cells = split_row(line, layout.row_delimiter, width).map_err(|found| {
            FormatError::RowWidthMismatch {
                path: path.to_path_buf(),
                line: line_no,
                expected: width,
                found,
            }
        })?;
        for (&idx, name) in indices.iter().zip(names) {
            let cell = cells[idx];
            let value = cell
                .parse::<f64>()
                .map_err(|_| FormatError::ParseError {
                    path: path.to_path_buf(),
                    line: line_no,
                    column: name.clone(),
                    value: cell.to_string(),
                })?;
            data.push(value);
        }
    }
    Ok(Array2::from_shape_vec((table.rows.len(), names.len()), data)?)
}
