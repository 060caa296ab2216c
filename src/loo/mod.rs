//! # Leave-one-out cross-validation
//!
//! Approximate LOO via Pareto-smoothed importance sampling over a pointwise
//! log-likelihood matrix. Each observation is smoothed independently, so the
//! work is split across scoped threads for larger datasets.

pub mod psis;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::Warning;
use crate::utils::{log_sum_exp, mean, sample_variance, usize_to_f64};

pub use psis::{SmoothedWeights, gpd_fit, psis_smooth, tail_length};

const PARALLEL_MIN_OBSERVATIONS: usize = 64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LooError {
    #[error("log-likelihood matrix has no observations or no draws")]
    Empty,
    #[error("draw {draw} has {found} observations, expected {expected}")]
    Ragged {
        draw: usize,
        expected: usize,
        found: usize,
    },
    #[error("log-likelihood is not finite for observation {observation}, draw {draw}")]
    NonFinite { observation: usize, draw: usize },
    #[error("Pareto k thresholds must satisfy 0 < good ({good}) < bad ({bad})")]
    InvalidThresholds { good: f64, bad: f64 },
    #[error("LOO worker thread panicked")]
    WorkerPanicked,
}

/// Log-likelihood of every observation under every posterior draw.
///
/// Stored observation-major so each observation's draws are contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointwiseLogLikelihood {
    n_obs: usize,
    n_draws: usize,
    values: Vec<f64>,
    data_fingerprint: Option<u64>,
}

impl PointwiseLogLikelihood {
    /// Build from draw-major rows (`rows[draw][observation]`).
    ///
    /// # Errors
    ///
    /// Returns `LooError` if the matrix is empty, ragged, or holds non-finite values.
    pub fn from_draws(rows: &[Vec<f64>]) -> Result<Self, LooError> {
        let n_draws = rows.len();
        let n_obs = rows.first().map_or(0, Vec::len);
        if n_draws == 0 || n_obs == 0 {
            return Err(LooError::Empty);
        }

        let mut values = vec![0.0; n_obs * n_draws];
        for (draw, row) in rows.iter().enumerate() {
            if row.len() != n_obs {
                return Err(LooError::Ragged {
                    draw,
                    expected: n_obs,
                    found: row.len(),
                });
            }
            for (observation, value) in row.iter().enumerate() {
                if !value.is_finite() {
                    return Err(LooError::NonFinite { observation, draw });
                }
                values[observation * n_draws + draw] = *value;
            }
        }

        Ok(Self {
            n_obs,
            n_draws,
            values,
            data_fingerprint: None,
        })
    }

    /// Tag the matrix with the fingerprint of the dataset it was computed on.
    #[must_use]
    pub const fn with_data_fingerprint(mut self, fingerprint: u64) -> Self {
        self.data_fingerprint = Some(fingerprint);
        self
    }

    #[must_use]
    pub const fn n_obs(&self) -> usize {
        self.n_obs
    }

    #[must_use]
    pub const fn n_draws(&self) -> usize {
        self.n_draws
    }

    #[must_use]
    pub const fn data_fingerprint(&self) -> Option<u64> {
        self.data_fingerprint
    }

    /// Log-likelihood of one observation across all draws.
    #[must_use]
    pub fn observation(&self, index: usize) -> &[f64] {
        &self.values[index * self.n_draws..(index + 1) * self.n_draws]
    }
}

/// Pareto k thresholds and parallelism switch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LooOptions {
    /// Below this k the importance sampling estimate is reliable.
    pub good_k_threshold: f64,
    /// At or above this k the estimate is unreliable.
    pub bad_k_threshold: f64,
    pub parallel: bool,
}

impl Default for LooOptions {
    fn default() -> Self {
        Self {
            good_k_threshold: 0.5,
            bad_k_threshold: 0.7,
            parallel: true,
        }
    }
}

impl LooOptions {
    /// # Errors
    ///
    /// Returns `LooError::InvalidThresholds` unless `0 < good < bad`.
    pub fn validate(&self) -> Result<(), LooError> {
        let valid = self.good_k_threshold > 0.0
            && self.good_k_threshold < self.bad_k_threshold
            && self.bad_k_threshold.is_finite();
        if valid {
            Ok(())
        } else {
            Err(LooError::InvalidThresholds {
                good: self.good_k_threshold,
                bad: self.bad_k_threshold,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParetoKCategory {
    Good,
    Ok,
    Bad,
}

impl ParetoKCategory {
    #[must_use]
    pub fn classify(k: f64, options: &LooOptions) -> Self {
        if k < options.good_k_threshold {
            Self::Good
        } else if k < options.bad_k_threshold {
            Self::Ok
        } else {
            Self::Bad
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParetoKCounts {
    pub good: usize,
    pub ok: usize,
    pub bad: usize,
}

/// PSIS-LOO estimate with pointwise contributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooResult {
    pub pointwise_elpd: Vec<f64>,
    pub pointwise_p_loo: Vec<f64>,
    pub pareto_k: Vec<f64>,
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub se_p_loo: f64,
    /// `-2 * elpd_loo`.
    pub looic: f64,
    pub se_looic: f64,
    pub k_counts: ParetoKCounts,
    pub n_draws: usize,
    pub warnings: Vec<Warning>,
    pub data_fingerprint: Option<u64>,
}

impl LooResult {
    #[must_use]
    pub const fn n_obs(&self) -> usize {
        self.pointwise_elpd.len()
    }

    /// Indices of observations whose k is at or above `bad_k_threshold`.
    #[must_use]
    pub fn unreliable_observations(&self, options: &LooOptions) -> Vec<usize> {
        self.pareto_k
            .iter()
            .enumerate()
            .filter(|(_, k)| ParetoKCategory::classify(**k, options) == ParetoKCategory::Bad)
            .map(|(index, _)| index)
            .collect()
    }
}

struct PointwiseEstimate {
    elpd: f64,
    p_loo: f64,
    pareto_k: f64,
}

fn estimate_observation(log_lik: &[f64]) -> PointwiseEstimate {
    let log_ratios = log_lik.iter().map(|value| -value).collect::<Vec<_>>();
    let smoothed = psis_smooth(&log_ratios);
    let weighted = smoothed
        .log_weights
        .iter()
        .zip(log_lik)
        .map(|(weight, value)| weight + value)
        .collect::<Vec<_>>();
    let elpd = log_sum_exp(&weighted);
    let lpd = log_sum_exp(log_lik) - usize_to_f64(log_lik.len()).ln();
    PointwiseEstimate {
        elpd,
        p_loo: lpd - elpd,
        pareto_k: smoothed.pareto_k,
    }
}

fn estimate_all(
    log_lik: &PointwiseLogLikelihood,
    parallel: bool,
) -> Result<Vec<PointwiseEstimate>, LooError> {
    let n_obs = log_lik.n_obs();
    let threads = std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .min(n_obs);
    let use_parallel = parallel && threads > 1 && n_obs >= PARALLEL_MIN_OBSERVATIONS;
    if !use_parallel {
        return Ok((0..n_obs)
            .map(|index| estimate_observation(log_lik.observation(index)))
            .collect());
    }

    let chunk_size = n_obs.div_ceil(threads).max(1);
    std::thread::scope(|scope| {
        let handles = (0..n_obs)
            .step_by(chunk_size)
            .map(|chunk_start| {
                let chunk_end = (chunk_start + chunk_size).min(n_obs);
                scope.spawn(move || {
                    (chunk_start..chunk_end)
                        .map(|index| estimate_observation(log_lik.observation(index)))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut estimates = Vec::with_capacity(n_obs);
        for handle in handles {
            let chunk = handle.join().map_err(|_| LooError::WorkerPanicked)?;
            estimates.extend(chunk);
        }
        Ok(estimates)
    })
}

/// Standard error of a total over `values`: `sqrt(n * var)`.
fn total_standard_error(values: &[f64]) -> f64 {
    let n = usize_to_f64(values.len());
    (n * sample_variance(values, mean(values))).sqrt()
}

/// Compute PSIS-LOO from a pointwise log-likelihood matrix.
///
/// # Errors
///
/// Returns `LooError::InvalidThresholds` for bad options or `WorkerPanicked` if a
/// worker thread fails.
pub fn psis_loo(
    log_lik: &PointwiseLogLikelihood,
    options: &LooOptions,
) -> Result<LooResult, LooError> {
    options.validate()?;
    let estimates = estimate_all(log_lik, options.parallel)?;

    let pointwise_elpd = estimates.iter().map(|e| e.elpd).collect::<Vec<_>>();
    let pointwise_p_loo = estimates.iter().map(|e| e.p_loo).collect::<Vec<_>>();
    let pareto_k = estimates.iter().map(|e| e.pareto_k).collect::<Vec<_>>();

    let mut k_counts = ParetoKCounts::default();
    let mut warnings = Vec::new();
    for (observation, k) in pareto_k.iter().enumerate() {
        match ParetoKCategory::classify(*k, options) {
            ParetoKCategory::Good => k_counts.good += 1,
            ParetoKCategory::Ok => k_counts.ok += 1,
            ParetoKCategory::Bad => {
                k_counts.bad += 1;
                warnings.push(Warning::UnreliableLooEstimate {
                    observation,
                    pareto_k: *k,
                });
            }
        }
    }

    let elpd_loo = pointwise_elpd.iter().sum::<f64>();
    let se_elpd_loo = total_standard_error(&pointwise_elpd);
    let p_loo = pointwise_p_loo.iter().sum::<f64>();

    if k_counts.bad > 0 {
        log::warn!(
            "{} of {} observations have Pareto k >= {}; LOO estimate may be unreliable",
            k_counts.bad,
            log_lik.n_obs(),
            options.bad_k_threshold
        );
    }
    log::info!(
        "PSIS-LOO over {} observations and {} draws: elpd_loo {elpd_loo:.2} (se {se_elpd_loo:.2}), p_loo {p_loo:.2}",
        log_lik.n_obs(),
        log_lik.n_draws()
    );

    Ok(LooResult {
        se_p_loo: total_standard_error(&pointwise_p_loo),
        looic: -2.0 * elpd_loo,
        se_looic: 2.0 * se_elpd_loo,
        pointwise_elpd,
        pointwise_p_loo,
        pareto_k,
        elpd_loo,
        se_elpd_loo,
        p_loo,
        k_counts,
        n_draws: log_lik.n_draws(),
        warnings,
        data_fingerprint: log_lik.data_fingerprint(),
    })
}
