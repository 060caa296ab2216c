//! Fitting entry points: validate, build the log posterior, run chains.

use super::density::MixedModelDensity;
use super::spec::ModelSpec;
use super::types::{FittedModel, ModelError};
use crate::inference::{ConvergenceThresholds, SamplerConfig, SamplingControl, sample_chains};
use crate::input::Dataset;

/// Fit `spec` to `dataset` with default convergence thresholds.
///
/// # Errors
///
/// Returns `ModelError` if the configuration or specification is invalid, or if
/// any chain fails, is cancelled, or times out.
pub fn fit_model(
    dataset: &Dataset,
    spec: &ModelSpec,
    config: SamplerConfig,
    control: &SamplingControl,
) -> Result<FittedModel, ModelError> {
    fit_model_with_thresholds(
        dataset,
        spec,
        config,
        ConvergenceThresholds::default(),
        control,
    )
}

/// Fit `spec` to `dataset`, judging convergence against `thresholds`.
///
/// # Errors
///
/// Returns `ModelError` if the configuration or specification is invalid, or if
/// any chain fails, is cancelled, or times out.
pub fn fit_model_with_thresholds(
    dataset: &Dataset,
    spec: &ModelSpec,
    config: SamplerConfig,
    thresholds: ConvergenceThresholds,
    control: &SamplingControl,
) -> Result<FittedModel, ModelError> {
    config.validate()?;
    let density = MixedModelDensity::new(dataset, spec)?;
    let initial = density.initial_position();
    log::info!(
        "fitting model `{}`: {} parameters, {} observations, {} chains x ({} warmup + {} sampling)",
        spec.name(),
        initial.len(),
        dataset.n_obs(),
        config.num_chains,
        config.warmup_iterations,
        config.sampling_iterations
    );

    let chains = sample_chains(&density, &initial, config, control)?;
    let model =
        FittedModel::assemble(dataset, spec.clone(), config, thresholds, density, chains)?;

    let report = model.report();
    for warning in &report.warnings {
        log::warn!("model `{}`: {warning}", spec.name());
    }
    log::info!(
        "model `{}` fitted: {} draws, {} divergences, max R-hat {}",
        spec.name(),
        model.posterior().len(),
        report.divergences,
        report
            .convergence
            .as_ref()
            .and_then(|summary| summary.max_rhat)
            .map_or_else(|| "n/a".to_string(), |rhat| format!("{rhat:.3}"))
    );
    Ok(model)
}
