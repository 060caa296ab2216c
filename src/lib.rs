#![forbid(unsafe_code)]

//! # `hierarchical_models`
//!
//! Bayesian hierarchical Gaussian regression with a single grouping factor:
//! model specification with weakly informative default priors, NUTS sampling
//! across independent chains, convergence diagnostics, posterior predictive
//! simulation, and PSIS-LOO model comparison.
//!
//! The sampler, diagnostics, and LOO machinery are generic and can be reused for
//! other targets implementing [`inference::LogDensity`].

pub mod inference;
pub mod input;
pub mod loo;
pub mod models;
pub mod utils;

pub use inference::{
    CancellationToken, Chain, ConvergenceSummary, ConvergenceThresholds, DiagnosticsError,
    InferenceError, LogDensity, ParameterDiagnostics, SamplerConfig, SamplingControl, Warning,
    sample_chains, summarize_convergence,
};
pub use input::{Dataset, GroupIndex, InputError};
pub use loo::{
    LooError, LooOptions, LooResult, ParetoKCategory, ParetoKCounts, PointwiseLogLikelihood,
    psis_loo,
};
pub mod comparison {
    pub use crate::models::comparison::*;
}

pub use models::comparison::{
    ComparisonError, ComparisonRow, ComparisonTable, PointwiseDifference, compare_models,
    pointwise_elpd_difference, render_comparison_table,
};

pub use models::mixed::{
    FitCache, FitReport, FitSnapshot, FittedModel, MemoryFitCache, ModelError, ModelSpec,
    ParameterClass, ParameterLayout, ParameterSummary, PosteriorSampleSet, PredictionData,
    PredictiveCheck, PredictiveOptions, PredictiveSampleSet, Prior, RandomStructure, SpecError,
    Term, fit_model, fit_model_with_thresholds, fit_or_load, predictive_check,
    render_posterior_summary, simulate_posterior_predictive,
};
