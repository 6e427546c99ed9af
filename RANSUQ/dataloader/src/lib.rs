#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Field mapping layer: logical feature names resolved against heterogeneous on-disk formats.

/// Raw-column to logical-feature transformers.
#[path = "../field.rs"]
pub mod field;

/// Format capability traits and shared table parsing.
#[path = "../format.rs"]
pub mod format;

/// Naive CSV-with-header format.
#[path = "../csv_format.rs"]
pub mod csv_format;

/// Flow-solver restart file format.
#[path = "../restart.rs"]
pub mod restart;

/// Feature extraction over a format.
#[path = "../loader.rs"]
pub mod loader;

pub use csv_format::CsvFormat;
pub use field::{FieldTransformer, TransformError};
pub use format::{AppendableFormat, Format, FormatError};
pub use loader::{load_features, plan_features, LoadError, RawPlan};
pub use restart::RestartFormat;
