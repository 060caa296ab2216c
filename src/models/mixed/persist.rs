//! Fitted-model snapshots and fit-or-load memoisation.
//!
//! A snapshot holds the specification, sampler settings, and raw chains. Restoring
//! recomputes the pooled posterior and diagnostics from those chains, so a restored
//! model behaves exactly like the fit it was taken from.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::density::MixedModelDensity;
use super::sampler::fit_model_with_thresholds;
use super::spec::ModelSpec;
use super::types::{FittedModel, ModelError};
use crate::inference::{Chain, ConvergenceThresholds, SamplerConfig, SamplingControl};
use crate::input::Dataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSnapshot {
    pub spec: ModelSpec,
    pub config: SamplerConfig,
    pub thresholds: ConvergenceThresholds,
    pub group_labels: Vec<String>,
    pub data_fingerprint: u64,
    pub chains: Vec<Chain>,
}

impl FitSnapshot {
    /// # Errors
    ///
    /// Returns `ModelError::Snapshot` if serialisation fails.
    pub fn to_json(&self) -> Result<String, ModelError> {
        encode(self)
    }

    /// # Errors
    ///
    /// Returns `ModelError::Snapshot` if `json` is not a valid snapshot.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        serde_json::from_str(json).map_err(|err| ModelError::Snapshot(err.to_string()))
    }

    /// Rebuild the fitted model against the dataset it was fitted on.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::SnapshotMismatch` if `dataset` differs from the fitted
    /// data, or `ModelError` if the stored specification no longer validates.
    pub fn restore(self, dataset: &Dataset) -> Result<FittedModel, ModelError> {
        if dataset.fingerprint() != self.data_fingerprint {
            return Err(ModelError::SnapshotMismatch(
                "dataset fingerprint differs".to_string(),
            ));
        }
        let density = MixedModelDensity::new(dataset, &self.spec)?;
        if density.layout().group_labels() != self.group_labels.as_slice() {
            return Err(ModelError::SnapshotMismatch(
                "group labels differ".to_string(),
            ));
        }
        let expected = density.layout().dim();
        if let Some(draw) = self
            .chains
            .iter()
            .flat_map(|chain| chain.draws.iter())
            .find(|draw| draw.len() != expected)
        {
            return Err(ModelError::SnapshotMismatch(format!(
                "stored draws have {} parameters; the model has {expected}",
                draw.len()
            )));
        }
        FittedModel::assemble(
            dataset,
            self.spec,
            self.config,
            self.thresholds,
            density,
            self.chains,
        )
    }
}

impl FittedModel {
    #[must_use]
    pub fn snapshot(&self) -> FitSnapshot {
        FitSnapshot {
            spec: self.spec().clone(),
            config: *self.config(),
            thresholds: *self.thresholds(),
            group_labels: self.layout().group_labels().to_vec(),
            data_fingerprint: self.data_fingerprint(),
            chains: self.chains().to_vec(),
        }
    }
}

/// Storage for serialised snapshots keyed by [`cache_key`].
pub trait FitCache {
    fn load(&self, key: u64) -> Option<String>;
    fn store(&mut self, key: u64, snapshot: String);
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFitCache {
    entries: HashMap<u64, String>,
}

impl MemoryFitCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FitCache for MemoryFitCache {
    fn load(&self, key: u64) -> Option<String> {
        self.entries.get(&key).cloned()
    }

    fn store(&mut self, key: u64, snapshot: String) {
        self.entries.insert(key, snapshot);
    }
}

/// Content hash of everything that determines a fit.
///
/// # Errors
///
/// Returns `ModelError::Snapshot` if the specification cannot be serialised.
pub fn cache_key(
    dataset: &Dataset,
    spec: &ModelSpec,
    config: &SamplerConfig,
    thresholds: &ConvergenceThresholds,
) -> Result<u64, ModelError> {
    let mut hasher = DefaultHasher::new();
    dataset.fingerprint().hash(&mut hasher);
    encode(spec)?.hash(&mut hasher);
    encode(config)?.hash(&mut hasher);
    encode(thresholds)?.hash(&mut hasher);
    Ok(hasher.finish())
}

fn encode<T: Serialize>(value: &T) -> Result<String, ModelError> {
    serde_json::to_string(value).map_err(|err| ModelError::Snapshot(err.to_string()))
}

/// Return the cached fit for these inputs, or fit and cache it.
///
/// Unreadable cache entries are refitted and overwritten.
///
/// # Errors
///
/// Returns `ModelError` if fitting fails or the snapshot cannot be serialised.
pub fn fit_or_load<C: FitCache + ?Sized>(
    cache: &mut C,
    dataset: &Dataset,
    spec: &ModelSpec,
    config: SamplerConfig,
    control: &SamplingControl,
) -> Result<FittedModel, ModelError> {
    let thresholds = ConvergenceThresholds::default();
    let key = cache_key(dataset, spec, &config, &thresholds)?;
    if let Some(json) = cache.load(key) {
        match FitSnapshot::from_json(&json).and_then(|snapshot| snapshot.restore(dataset)) {
            Ok(model) => {
                log::info!("model `{}` loaded from cache", spec.name());
                return Ok(model);
            }
            Err(err) => log::warn!("model `{}`: discarding cached fit: {err}", spec.name()),
        }
    }

    let model = fit_model_with_thresholds(dataset, spec, config, thresholds, control)?;
    cache.store(key, model.snapshot().to_json()?);
    Ok(model)
}
