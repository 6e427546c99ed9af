use std::path::Path;

use indexmap::IndexMap;
use ndarray::Array2;

use crate::{
    field::FieldTransformer,
    format::{read_columns, Format, FormatError, TableLayout},
};

/// Delimited text with a header line naming the raw columns.
///
/// Any header column is available as a feature of the same name; the fieldmap
/// adds renamed and derived features on top.
#[derive(Debug, Clone)]
pub struct CsvFormat {
    delimiter: char,
    fieldmap: IndexMap<String, FieldTransformer>,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self::new(',')
    }
}

impl CsvFormat {
    /// Creates a format splitting rows on `delimiter`.
    #[must_use]
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            fieldmap: IndexMap::new(),
        }
    }

    /// Exposes header column `raw` under the logical name `logical`.
    #[must_use]
    pub fn with_fieldmap(self, logical: impl Into<String>, raw: impl Into<String>) -> Self {
        self.with_transformer(logical, FieldTransformer::identity(raw))
    }

    /// Registers a derived logical feature.
    #[must_use]
    pub fn with_transformer(
        mut self,
        logical: impl Into<String>,
        transformer: FieldTransformer,
    ) -> Self {
        self.fieldmap.insert(logical.into(), transformer);
        self
    }

    const fn layout(&self) -> TableLayout {
        TableLayout {
            header_delimiter: self.delimiter,
            row_delimiter: self.delimiter,
        }
    }
}

impl Format for CsvFormat {
    fn name(&self) -> &str {
        "csv"
    }

    fn resolve(&self, feature: &str) -> Option<FieldTransformer> {
        Some(
            self.fieldmap
                .get(feature)
                .cloned()
                .unwrap_or_else(|| FieldTransformer::identity(feature)),
        )
    }

    fn read_raw_columns(&self, names: &[String], source: &Path) -> Result<Array2<f64>, FormatError> {
        read_columns(source, self.layout(), names)
    }
}
