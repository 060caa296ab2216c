//! Gaussian mixed-effects regression with a single grouping factor.
//!
//! Three structures are supported: pooled (fixed effects only), varying
//! intercept, and correlated varying intercept and slope. Models are described
//! with [`ModelSpec`], fitted with NUTS via [`fit_model`], and evaluated through
//! the returned [`FittedModel`] (posterior summaries, posterior predictive
//! simulation, PSIS-LOO).

pub mod density;
pub mod likelihood;
pub mod persist;
pub mod posterior;
pub mod predictive;
pub mod priors;
pub mod sampler;
pub mod spec;
pub mod types;

pub use density::{MixedModelDensity, ParameterLayout};
pub use persist::{FitCache, FitSnapshot, MemoryFitCache, cache_key, fit_or_load};
pub use posterior::{ParameterSummary, PosteriorRow, PosteriorSampleSet, render_posterior_summary};
pub use predictive::{
    PredictionData, PredictiveCheck, PredictiveOptions, PredictiveSampleSet, predictive_check,
    simulate_posterior_predictive,
};
pub use priors::{Prior, Support};
pub use sampler::{fit_model, fit_model_with_thresholds};
pub use spec::{ModelSpec, ParameterClass, RandomStructure, SpecError, Term, TermKind};
pub use types::{FitReport, FittedModel, ModelError};
