//! String-keyed catalogs resolved into run [`Settings`].

use std::{fmt, path::PathBuf, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::RunConfig,
    dataset::Dataset,
    load::{FeatureRequest, WeightFunction},
    scheduler::Scheduler,
    trainer::{optimize::Convergence, Algorithm, Regularizer, TrainerConfig},
};

/// File name of the persisted predictor inside a save path.
pub const PREDICTOR_FILE: &str = "predictor.json";

/// Named input/output features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    /// Model inputs.
    pub inputs: Vec<String>,
    /// Model outputs.
    pub outputs: Vec<String>,
}

/// Named sample weighting.
#[derive(Debug, Clone)]
pub struct WeightSet {
    /// Features read for the weight function.
    pub features: Vec<String>,
    /// Weight function; `None` for unweighted training.
    pub function: Option<WeightFunction>,
}

/// Named model family plus its penalty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlgorithmChoice {
    /// Model family.
    pub algorithm: Algorithm,
    /// Parameter penalty.
    pub regularizer: Regularizer,
}

/// The string keys selecting one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSelection {
    /// Training collection or dataset.
    pub training: String,
    /// Testing collection or dataset.
    pub testing: Option<String>,
    /// Feature set.
    pub features: String,
    /// Weight set.
    pub weights: String,
    /// Algorithm.
    pub algorithm: String,
    /// Convergence profile.
    pub convergence: String,
    /// Fixed optimizer seed overriding the profile's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl RunSelection {
    /// Selection with `none` weights, `net_2_layer` and `standard` convergence.
    #[must_use]
    pub fn new(training: impl Into<String>, features: impl Into<String>) -> Self {
        Self {
            training: training.into(),
            testing: None,
            features: features.into(),
            weights: "none".into(),
            algorithm: "net_2_layer".into(),
            convergence: "standard".into(),
            seed: None,
        }
    }
}

/// Everything one run needs, resolved from a [`RunSelection`].
#[derive(Clone)]
pub struct Settings {
    /// Datasets trained on.
    pub training: Vec<Arc<dyn Dataset>>,
    /// Datasets evaluated after training.
    pub testing: Vec<Arc<dyn Dataset>>,
    /// Features and weighting to load.
    pub request: FeatureRequest,
    /// Feature set key, passed to comparison simulations.
    pub feature_set: String,
    /// Deterministic result directory; also the predictor cache key.
    pub save_path: PathBuf,
    /// How the predictor is fitted.
    pub trainer: TrainerConfig,
    /// Keys this was resolved from.
    pub selection: RunSelection,
}

impl Settings {
    /// Location of the persisted predictor.
    #[must_use]
    pub fn predictor_path(&self) -> PathBuf {
        self.save_path.join(PREDICTOR_FILE)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |sets: &[Arc<dyn Dataset>]| sets.iter().map(|d| d.id().to_string()).collect::<Vec<_>>();
        f.debug_struct("Settings")
            .field("training", &ids(&self.training))
            .field("testing", &ids(&self.testing))
            .field("request", &self.request)
            .field("save_path", &self.save_path)
            .field("trainer", &self.trainer)
            .finish_non_exhaustive()
    }
}

/// Registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A key not present in its catalog.
    #[error("unknown {kind} {key:?}; valid options: {}", .valid.join(", "))]
    UnknownOption {
        /// Catalog name.
        kind: &'static str,
        /// Requested key.
        key: String,
        /// Every valid key.
        valid: Vec<String>,
    },
}

/// Every valid key per catalog.
#[derive(Debug, Clone, Serialize)]
pub struct OptionsListing {
    /// Feature sets.
    pub features: Vec<String>,
    /// Weight sets.
    pub weights: Vec<String>,
    /// Algorithms.
    pub algorithms: Vec<String>,
    /// Convergence profiles.
    pub convergence: Vec<String>,
    /// Collections and datasets.
    pub datasets: Vec<String>,
}

/// Catalogs of named options plus the configured datasets.
#[derive(Debug, Clone)]
pub struct Registry {
    config: RunConfig,
    features: IndexMap<String, FeatureSet>,
    weights: IndexMap<String, WeightSet>,
    algorithms: IndexMap<String, AlgorithmChoice>,
    convergence: IndexMap<String, Convergence>,
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

fn lookup<'a, T>(catalog: &'a IndexMap<String, T>, kind: &'static str, key: &str) -> Result<&'a T, RegistryError> {
    catalog.get(key).ok_or_else(|| RegistryError::UnknownOption {
        kind,
        key: key.to_string(),
        valid: catalog.keys().cloned().collect(),
    })
}

impl Registry {
    /// Registry with the built-in catalogs over `config`'s datasets.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        let mut registry = Self {
            config,
            features: IndexMap::new(),
            weights: IndexMap::new(),
            algorithms: IndexMap::new(),
            convergence: IndexMap::new(),
        };
        let nondim = |inputs: &[&str], output: &str| FeatureSet {
            inputs: strings(inputs),
            outputs: strings(&[output]),
        };
        registry.features.extend([
            (
                "nondim_production".to_string(),
                nondim(&["Chi", "OmegaNondim"], "NondimProductionMod"),
            ),
            (
                "nondim_destruction".to_string(),
                nondim(&["Chi", "OmegaNondim"], "NondimDestructionMod"),
            ),
            (
                "nondim_crossproduction".to_string(),
                nondim(&["Chi", "NuHatGradNormNondim"], "NondimCrossProductionMod"),
            ),
            (
                "nondim_source".to_string(),
                nondim(&["Chi", "OmegaNondim", "NuHatGradNormNondim"], "NondimSourceMod"),
            ),
            (
                "source".to_string(),
                nondim(
                    &["Chi", "Vorticity", "WallDistance", "NuHat", "KinematicViscosity", "NuHatGradNorm"],
                    "Source",
                ),
            ),
            ("flat_chi".to_string(), nondim(&["x", "y"], "Chi")),
        ]);
        registry.weights.extend([
            (
                "none".to_string(),
                WeightSet {
                    features: Vec::new(),
                    function: None,
                },
            ),
            (
                "nondim_production_magnitude".to_string(),
                WeightSet {
                    features: strings(&["NondimProductionMod"]),
                    function: Some(WeightFunction::new("nondim_production_magnitude", |row| {
                        1.0 + row[0].abs()
                    })),
                },
            ),
            (
                "inverse_wall_distance".to_string(),
                WeightSet {
                    features: strings(&["WallDistance"]),
                    function: Some(WeightFunction::new("inverse_wall_distance", |row| {
                        1.0 / row[0].max(1e-6)
                    })),
                },
            ),
        ]);
        let choice = |algorithm, regularizer| AlgorithmChoice {
            algorithm,
            regularizer,
        };
        registry.algorithms.extend([
            ("linear".to_string(), choice(Algorithm::Linear, Regularizer::None)),
            (
                "linear_ridge".to_string(),
                choice(Algorithm::Linear, Regularizer::L2 { strength: 1e-3 }),
            ),
            (
                "net_2_layer".to_string(),
                choice(Algorithm::Network { hidden: vec![12, 12] }, Regularizer::None),
            ),
            (
                "net_1_layer".to_string(),
                choice(Algorithm::Network { hidden: vec![20] }, Regularizer::None),
            ),
        ]);
        let profile = |objective_tol, gradient_tol, max_evaluations| Convergence {
            objective_tol,
            gradient_tol,
            max_evaluations,
            seed: None,
        };
        registry.convergence.extend([
            ("quick".to_string(), profile(1e-8, 1e-6, 500)),
            ("standard".to_string(), profile(1e-10, 1e-8, 20_000)),
            ("strict".to_string(), profile(1e-14, 1e-10, 200_000)),
        ]);
        registry
    }

    /// Underlying run configuration.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Looks up a feature set.
    pub fn feature_set(&self, key: &str) -> Result<&FeatureSet, RegistryError> {
        lookup(&self.features, "feature set", key)
    }

    /// Instantiates one configured dataset.
    pub fn dataset(&self, key: &str, scheduler: &Scheduler) -> Result<Arc<dyn Dataset>, RegistryError> {
        lookup(&self.config.datasets, "dataset", key).map(|config| config.build(scheduler))
    }

    /// Instantiates every dataset of a collection (or a single named dataset).
    pub fn collection(&self, key: &str, scheduler: &Scheduler) -> Result<Vec<Arc<dyn Dataset>>, RegistryError> {
        let members = self
            .config
            .members(key)
            .ok_or_else(|| RegistryError::UnknownOption {
                kind: "dataset collection",
                key: key.to_string(),
                valid: self.config.collection_keys(),
            })?;
        members
            .iter()
            .map(|name| self.dataset(name, scheduler))
            .collect()
    }

    /// Resolves every key of `selection`.
    pub fn settings(&self, selection: &RunSelection, scheduler: &Scheduler) -> Result<Settings, RegistryError> {
        let features = self.feature_set(&selection.features)?;
        let weights = lookup(&self.weights, "weight set", &selection.weights)?;
        let algorithm = lookup(&self.algorithms, "algorithm", &selection.algorithm)?;
        let convergence = lookup(&self.convergence, "convergence profile", &selection.convergence)?;
        let training = self.collection(&selection.training, scheduler)?;
        let testing = match &selection.testing {
            Some(key) => self.collection(key, scheduler)?,
            None => Vec::new(),
        };
        let save_path = self
            .config
            .results_root
            .join(&selection.features)
            .join(&selection.weights)
            .join(&selection.algorithm)
            .join(&selection.convergence)
            .join(&selection.training);
        let mut trainer = TrainerConfig::new(algorithm.algorithm.clone());
        trainer.regularizer = algorithm.regularizer;
        trainer.convergence = convergence.clone();
        if selection.seed.is_some() {
            trainer.convergence.seed = selection.seed;
        }
        Ok(Settings {
            training,
            testing,
            request: FeatureRequest {
                inputs: features.inputs.clone(),
                outputs: features.outputs.clone(),
                weight_features: weights.features.clone(),
                weight_function: weights.function.clone(),
            },
            feature_set: selection.features.clone(),
            save_path,
            trainer,
            selection: selection.clone(),
        })
    }

    /// Every valid key per catalog.
    #[must_use]
    pub fn options(&self) -> OptionsListing {
        OptionsListing {
            features: self.features.keys().cloned().collect(),
            weights: self.weights.keys().cloned().collect(),
            algorithms: self.algorithms.keys().cloned().collect(),
            convergence: self.convergence.keys().cloned().collect(),
            datasets: self.config.collection_keys(),
        }
    }
}
