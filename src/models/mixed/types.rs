//! Core public types for the mixed-model workflow.

use thiserror::Error;

use super::density::{MixedModelDensity, ParameterLayout};
use super::posterior::{ParameterSummary, PosteriorSampleSet};
use super::predictive::{
    PredictionData, PredictiveCheck, PredictiveOptions, PredictiveSampleSet, predictive_check,
    simulate_posterior_predictive,
};
use super::spec::{ModelSpec, SpecError};
use crate::inference::{
    Chain, ConvergenceSummary, ConvergenceThresholds, DiagnosticsError, InferenceError,
    SamplerConfig, Warning, divergence_warnings, summarize_convergence,
};
use crate::input::{Dataset, InputError};
use crate::loo::{LooError, LooOptions, LooResult, PointwiseLogLikelihood, psis_loo};

/// Errors returned by model specification, fitting, and post-processing.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error(transparent)]
    Loo(#[from] LooError),
    #[error("posterior draws are required")]
    EmptyPosterior,
    #[error("requested {requested} predictive draws; between 1 and {available} are available")]
    InvalidPredictiveDraws { requested: usize, available: usize },
    #[error("fit snapshot could not be serialised or parsed: {0}")]
    Snapshot(String),
    #[error("fit snapshot does not belong to this dataset: {0}")]
    SnapshotMismatch(String),
}

/// Sampler outcome and convergence diagnostics of one fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub model_name: String,
    pub num_chains: usize,
    pub draws_per_chain: usize,
    /// Adapted step size per chain.
    pub step_sizes: Vec<f64>,
    pub divergences: usize,
    /// `None` when chains are too short for split diagnostics.
    pub convergence: Option<ConvergenceSummary>,
    pub warnings: Vec<Warning>,
}

impl FitReport {
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.convergence
            .as_ref()
            .is_some_and(ConvergenceSummary::is_converged)
    }
}

/// A fitted model: specification, raw chains, pooled posterior, and diagnostics.
#[derive(Debug, Clone)]
pub struct FittedModel {
    spec: ModelSpec,
    config: SamplerConfig,
    thresholds: ConvergenceThresholds,
    density: MixedModelDensity,
    training: PredictionData,
    data_fingerprint: u64,
    chains: Vec<Chain>,
    posterior: PosteriorSampleSet,
    report: FitReport,
}

impl FittedModel {
    /// Pool chains and compute diagnostics.
    pub(crate) fn assemble(
        dataset: &Dataset,
        spec: ModelSpec,
        config: SamplerConfig,
        thresholds: ConvergenceThresholds,
        density: MixedModelDensity,
        chains: Vec<Chain>,
    ) -> Result<Self, ModelError> {
        let names = density.layout().names();
        let convergence =
            match summarize_convergence(&chains, &names, thresholds, config.max_tree_depth) {
                Ok(summary) => Some(summary),
                Err(DiagnosticsError::InsufficientDraws { minimum, found }) => {
                    log::warn!(
                        "model `{}`: {found} draws per chain is below the {minimum} needed for convergence diagnostics",
                        spec.name()
                    );
                    None
                }
                Err(err) => return Err(err.into()),
            };

        let posterior = PosteriorSampleSet::from_chains(&chains, names);
        let report = FitReport {
            model_name: spec.name().to_string(),
            num_chains: chains.len(),
            draws_per_chain: posterior.draws_per_chain(),
            step_sizes: chains
                .iter()
                .map(|chain| chain.adaptation.step_size)
                .collect(),
            divergences: chains.iter().map(Chain::divergences).sum(),
            warnings: convergence.as_ref().map_or_else(
                || divergence_warnings(&chains),
                |summary| summary.warnings.clone(),
            ),
            convergence,
        };

        Ok(Self {
            spec,
            config,
            thresholds,
            density,
            training: PredictionData::from_dataset(dataset),
            data_fingerprint: dataset.fingerprint(),
            chains,
            posterior,
            report,
        })
    }

    #[must_use]
    pub const fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    #[must_use]
    pub const fn config(&self) -> &SamplerConfig {
        &self.config
    }

    #[must_use]
    pub const fn thresholds(&self) -> &ConvergenceThresholds {
        &self.thresholds
    }

    #[must_use]
    pub const fn layout(&self) -> &ParameterLayout {
        self.density.layout()
    }

    #[must_use]
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    #[must_use]
    pub const fn posterior(&self) -> &PosteriorSampleSet {
        &self.posterior
    }

    #[must_use]
    pub const fn report(&self) -> &FitReport {
        &self.report
    }

    #[must_use]
    pub const fn data_fingerprint(&self) -> u64 {
        self.data_fingerprint
    }

    #[must_use]
    pub fn summary(&self) -> Vec<ParameterSummary> {
        self.posterior.summarize()
    }

    /// Pointwise log likelihood of the training data for every posterior draw.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` if the posterior is empty or a value is non-finite.
    pub fn log_likelihood_matrix(&self) -> Result<PointwiseLogLikelihood, ModelError> {
        if self.posterior.is_empty() {
            return Err(ModelError::EmptyPosterior);
        }
        let rows = self
            .posterior
            .draws()
            .iter()
            .map(|draw| self.density.pointwise_log_likelihood(draw))
            .collect::<Vec<_>>();
        Ok(PointwiseLogLikelihood::from_draws(&rows)?.with_data_fingerprint(self.data_fingerprint))
    }

    /// PSIS-LOO on the training data.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` if the log-likelihood matrix cannot be built or the
    /// options are invalid.
    pub fn loo(&self, options: &LooOptions) -> Result<LooResult, ModelError> {
        Ok(psis_loo(&self.log_likelihood_matrix()?, options)?)
    }

    /// Simulate responses for new or training rows.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` as [`simulate_posterior_predictive`].
    pub fn posterior_predictive(
        &self,
        data: &PredictionData,
        options: &PredictiveOptions,
    ) -> Result<PredictiveSampleSet, ModelError> {
        simulate_posterior_predictive(self.layout(), &self.posterior, data, options)
    }

    /// Posterior predictive check of a caller-supplied statistic on the training data.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` as [`simulate_posterior_predictive`].
    pub fn posterior_predictive_check<F>(
        &self,
        options: &PredictiveOptions,
        statistic: F,
    ) -> Result<PredictiveCheck, ModelError>
    where
        F: Fn(&[f64]) -> f64,
    {
        let replicated = self.posterior_predictive(&self.training, options)?;
        Ok(predictive_check(
            self.density.response(),
            &replicated,
            statistic,
        ))
    }
}
