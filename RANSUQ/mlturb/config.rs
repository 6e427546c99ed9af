use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::IndexMap;
use ransuq_dataloader::{CsvFormat, FieldTransformer, RestartFormat};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    dataset::{Dataset, FileDataset},
    scheduler::Scheduler,
    simulation::{SimulationDataset, SimulationJob},
};

/// Run configuration document: where results go, which datasets exist and
/// how they are grouped.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root under which save paths are built.
    pub results_root: PathBuf,
    /// Core budget for simulations; host parallelism when absent.
    pub cores: Option<usize>,
    /// Declared datasets by name, in document order.
    pub datasets: IndexMap<String, DatasetConfig>,
    /// Named groups of datasets.
    pub collections: IndexMap<String, Vec<String>>,
}

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading run config {path}: {source}")]
    Io {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML for this schema.
    #[error("parsing run config {path}: {source}")]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// Two datasets share a name.
    #[error("dataset {name} is declared more than once")]
    DuplicateDataset {
        /// Repeated name.
        name: String,
    },
    /// A collection has no members.
    #[error("collection {name} is empty")]
    EmptyCollection {
        /// Collection name.
        name: String,
    },
    /// A collection names an undeclared dataset.
    #[error("collection {collection} references unknown dataset {dataset}")]
    UnknownDataset {
        /// Collection name.
        collection: String,
        /// Missing dataset.
        dataset: String,
    },
    /// A core count of zero.
    #[error("{context}: core count must be at least 1")]
    ZeroCores {
        /// Where the count appeared.
        context: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunConfigSerde {
    results_root: PathBuf,
    #[serde(default)]
    data_root: Option<PathBuf>,
    #[serde(default)]
    cores: Option<usize>,
    #[serde(default)]
    datasets: Vec<DatasetConfig>,
    #[serde(default)]
    collections: IndexMap<String, Vec<String>>,
}

/// One declared dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Dataset name.
    pub name: String,
    /// Source kind and its settings.
    #[serde(flatten)]
    pub kind: DatasetKind,
}

/// Supported dataset sources.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatasetKind {
    /// Delimited text with a header row.
    Csv(CsvDatasetConfig),
    /// Existing solver restart file.
    Restart(RestartDatasetConfig),
    /// Restart file produced by running the solver.
    Simulation(SimulationDatasetConfig),
}

/// CSV dataset settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CsvDatasetConfig {
    /// Data file.
    pub path: PathBuf,
    /// Field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Logical name to header column.
    #[serde(default)]
    pub fieldmap: IndexMap<String, String>,
    /// Logical name to `[numerator, denominator]` header columns.
    #[serde(default)]
    pub ratios: IndexMap<String, [String; 2]>,
}

/// Restart dataset settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestartDatasetConfig {
    /// Restart file.
    pub path: PathBuf,
}

/// Simulation dataset settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationDatasetConfig {
    /// Restart file the solver writes.
    pub restart: PathBuf,
    /// Solver invocation.
    pub simulation: SimulationConfig,
}

/// Solver invocation as written in the config.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Executable.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; the restart file's directory when absent.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Cores the solver occupies.
    #[serde(default = "default_cores")]
    pub cores: usize,
    /// Arguments for model-driven comparison runs.
    #[serde(default)]
    pub comparison_args: Option<Vec<String>>,
}

const fn default_delimiter() -> char {
    ','
}

const fn default_cores() -> usize {
    1
}

impl RunConfig {
    /// Loads and validates a TOML run config. Relative paths resolve against
    /// `data_root`, itself relative to the config file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_toml_str(&raw, &base).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses and validates a document whose relative paths resolve against `base`.
    pub fn from_toml_str(raw: &str, base: &Path) -> Result<Self, ConfigError> {
        let document: RunConfigSerde = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        if document.cores == Some(0) {
            return Err(ConfigError::ZeroCores {
                context: "cores".into(),
            });
        }
        let data_root = document
            .data_root
            .map_or_else(|| base.to_path_buf(), |root| join(base, &root));
        let mut datasets = IndexMap::with_capacity(document.datasets.len());
        for mut dataset in document.datasets {
            dataset.resolve_paths(&data_root);
            if let DatasetKind::Simulation(sim) = &dataset.kind {
                if sim.simulation.cores == 0 {
                    return Err(ConfigError::ZeroCores {
                        context: format!("dataset {}", dataset.name),
                    });
                }
            }
            let name = dataset.name.clone();
            if datasets.insert(name.clone(), dataset).is_some() {
                return Err(ConfigError::DuplicateDataset { name });
            }
        }
        for (name, members) in &document.collections {
            if members.is_empty() {
                return Err(ConfigError::EmptyCollection { name: name.clone() });
            }
            for member in members {
                if !datasets.contains_key(member) {
                    return Err(ConfigError::UnknownDataset {
                        collection: name.clone(),
                        dataset: member.clone(),
                    });
                }
            }
        }
        Ok(Self {
            results_root: join(base, &document.results_root),
            cores: document.cores,
            datasets,
            collections: document.collections,
        })
    }

    /// Dataset names in a collection. A bare dataset name is a collection of one.
    #[must_use]
    pub fn members(&self, key: &str) -> Option<Vec<String>> {
        self.collections.get(key).cloned().or_else(|| {
            self.datasets
                .contains_key(key)
                .then(|| vec![key.to_string()])
        })
    }

    /// Collection names followed by dataset names, i.e. every valid collection key.
    #[must_use]
    pub fn collection_keys(&self) -> Vec<String> {
        self.collections
            .keys()
            .chain(self.datasets.keys().filter(|name| !self.collections.contains_key(*name)))
            .cloned()
            .collect()
    }
}

fn join(base: &Path, candidate: &Path) -> PathBuf {
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

impl DatasetConfig {
    fn resolve_paths(&mut self, root: &Path) {
        match &mut self.kind {
            DatasetKind::Csv(csv) => csv.path = join(root, &csv.path),
            DatasetKind::Restart(restart) => restart.path = join(root, &restart.path),
            DatasetKind::Simulation(sim) => {
                sim.restart = join(root, &sim.restart);
                if let Some(workdir) = &mut sim.simulation.workdir {
                    *workdir = join(root, workdir);
                }
            }
        }
    }

    /// Source file the dataset loads from.
    #[must_use]
    pub fn source(&self) -> &Path {
        match &self.kind {
            DatasetKind::Csv(csv) => &csv.path,
            DatasetKind::Restart(restart) => &restart.path,
            DatasetKind::Simulation(sim) => &sim.restart,
        }
    }

    /// Instantiates the dataset; simulations run on `scheduler`.
    #[must_use]
    pub fn build(&self, scheduler: &Scheduler) -> Arc<dyn Dataset> {
        match &self.kind {
            DatasetKind::Csv(csv) => {
                let mut format = CsvFormat::new(csv.delimiter);
                for (logical, raw) in &csv.fieldmap {
                    format = format.with_fieldmap(logical.clone(), raw.clone());
                }
                for (logical, [numerator, denominator]) in &csv.ratios {
                    format = format.with_transformer(
                        logical.clone(),
                        FieldTransformer::ratio(numerator.clone(), denominator.clone()),
                    );
                }
                Arc::new(FileDataset::new(&self.name, Arc::new(format), &csv.path))
            }
            DatasetKind::Restart(restart) => Arc::new(FileDataset::new(
                &self.name,
                Arc::new(RestartFormat::new()),
                &restart.path,
            )),
            DatasetKind::Simulation(sim) => {
                let workdir = sim.simulation.workdir.clone().unwrap_or_else(|| {
                    sim.restart
                        .parent()
                        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                });
                let job = SimulationJob {
                    program: sim.simulation.program.clone(),
                    args: sim.simulation.args.clone(),
                    workdir,
                    cores: sim.simulation.cores,
                };
                let dataset = SimulationDataset::new(&self.name, &sim.restart, job, scheduler.clone());
                Arc::new(match &sim.simulation.comparison_args {
                    Some(args) => dataset.with_comparison_args(args.clone()),
                    None => dataset,
                })
            }
        }
    }
}
