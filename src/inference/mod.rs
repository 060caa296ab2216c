//! Reusable inference and MCMC utility types.
//!
//! The sampler is generic over [`LogDensity`]: any target that can report its
//! dimension, its log density with gradient on the unconstrained scale, and a
//! map back to the constrained scale can be sampled with [`sample_chains`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod adapt;
pub mod chain;
pub mod control;
pub mod diagnostics;
pub mod hamiltonian;
pub mod nuts;

pub use chain::{AdaptationInfo, Chain, DrawStats, sample_chains};
pub use control::{CancellationToken, SamplingControl};
pub use diagnostics::{
    ConvergenceSummary, ConvergenceThresholds, DiagnosticsError, ParameterDiagnostics, Warning,
    autocorrelation, divergence_warnings, ebfmi, effective_sample_size, split_rhat,
    summarize_convergence, tail_effective_sample_size,
};

/// Errors for sampler configuration and execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("warmup and sampling iterations must both be positive")]
    InvalidIterations,
    #[error("at least one chain is required")]
    InvalidChainCount,
    #[error("target acceptance probability must lie in (0, 1); found {0}")]
    InvalidTargetAcceptance(f64),
    #[error("maximum tree depth must be in 1..=30; found {0}")]
    InvalidTreeDepth(usize),
    #[error("multi-chain seed stride must be positive")]
    InvalidSeedStride,
    #[error("initial jitter must be finite and non-negative; found {0}")]
    InvalidJitter(f64),
    #[error("chain {chain}: log density or gradient is non-finite at every initial point tried")]
    NonFiniteDensity { chain: usize },
    #[error("initial point has dimension {found}; target expects {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("sampling was cancelled")]
    Cancelled,
    #[error("sampling exceeded its wall-clock budget")]
    TimedOut,
    #[error("chain worker panicked")]
    WorkerPanicked,
}

/// NUTS schedule and tuning targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub warmup_iterations: usize,
    pub sampling_iterations: usize,
    pub num_chains: usize,
    pub target_accept_probability: f64,
    pub max_tree_depth: usize,
    pub seed: u64,
    /// Chain `c` is seeded with `seed + c * seed_stride`.
    pub seed_stride: u64,
    /// Half-width of the uniform jitter added to the initial point of each chain.
    pub init_jitter: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 1_000,
            sampling_iterations: 1_000,
            num_chains: 4,
            target_accept_probability: 0.8,
            max_tree_depth: 10,
            seed: 42,
            seed_stride: 10_000,
            init_jitter: 0.5,
        }
    }
}

impl SamplerConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub fn validate(self) -> Result<(), InferenceError> {
        if self.warmup_iterations == 0 || self.sampling_iterations == 0 {
            return Err(InferenceError::InvalidIterations);
        }
        if self.num_chains == 0 {
            return Err(InferenceError::InvalidChainCount);
        }
        if !(self.target_accept_probability > 0.0 && self.target_accept_probability < 1.0) {
            return Err(InferenceError::InvalidTargetAcceptance(
                self.target_accept_probability,
            ));
        }
        if self.max_tree_depth == 0 || self.max_tree_depth > 30 {
            return Err(InferenceError::InvalidTreeDepth(self.max_tree_depth));
        }
        if self.num_chains > 1 && self.seed_stride == 0 {
            return Err(InferenceError::InvalidSeedStride);
        }
        if !(self.init_jitter.is_finite() && self.init_jitter >= 0.0) {
            return Err(InferenceError::InvalidJitter(self.init_jitter));
        }
        Ok(())
    }

    /// Deterministic seed for one chain.
    #[must_use]
    pub fn chain_seed(self, chain_index: usize) -> u64 {
        let index_u64 = u64::try_from(chain_index).unwrap_or(u64::MAX);
        self.seed
            .wrapping_add(index_u64.saturating_mul(self.seed_stride))
    }

    /// Total retained draws across all chains.
    #[must_use]
    pub const fn retained_draws(self) -> usize {
        self.sampling_iterations * self.num_chains
    }
}

/// A differentiable log density on an unconstrained parameter vector.
pub trait LogDensity: Sync {
    /// Number of unconstrained parameters.
    fn dim(&self) -> usize;

    /// Log density at `position`, writing its gradient into `gradient`.
    ///
    /// Returns a non-finite value when the density cannot be evaluated.
    fn log_density_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> f64;

    /// Map an unconstrained position to the constrained values that are stored per draw.
    fn constrain(&self, position: &[f64]) -> Vec<f64> {
        position.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_zero_iterations() {
        let config = SamplerConfig {
            sampling_iterations: 0,
            ..SamplerConfig::default()
        };
        assert_eq!(config.validate(), Err(InferenceError::InvalidIterations));
    }

    #[test]
    fn config_validation_rejects_zero_chains() {
        let config = SamplerConfig {
            num_chains: 0,
            ..SamplerConfig::default()
        };
        assert_eq!(config.validate(), Err(InferenceError::InvalidChainCount));
    }

    #[test]
    fn config_validation_rejects_target_outside_unit_interval() {
        for target in [0.0, 1.0, f64::NAN] {
            let config = SamplerConfig {
                target_accept_probability: target,
                ..SamplerConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(InferenceError::InvalidTargetAcceptance(_))
            ));
        }
    }

    #[test]
    fn chain_seeds_follow_stride() {
        let config = SamplerConfig {
            seed: 5,
            seed_stride: 100,
            ..SamplerConfig::default()
        };
        assert_eq!(config.chain_seed(0), 5);
        assert_eq!(config.chain_seed(3), 305);
        assert!(config.validate().is_ok());
    }
}
