//! Single-chain NUTS runs and the multi-chain driver.
//!
//! Each chain owns its RNG (seeded `seed + chain_index * seed_stride`), adapts
//! during warmup, then records constrained draws with per-draw statistics.
//! Chains run on scoped threads and share only the read-only target.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};

use super::adapt::{WindowedAdaptation, find_reasonable_step_size};
use super::control::SamplingControl;
use super::hamiltonian::PhasePoint;
use super::nuts::transition;
use super::{InferenceError, LogDensity, SamplerConfig};

const MAX_INIT_ATTEMPTS: usize = 100;

/// Sampler statistics recorded for one retained draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawStats {
    pub step_size: f64,
    pub tree_depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    pub accept_stat: f64,
    pub energy: f64,
    pub log_density: f64,
}

/// Warmup outcome frozen for the sampling phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationInfo {
    pub step_size: f64,
    pub inverse_metric: Vec<f64>,
}

/// Post-warmup draws of one chain. Immutable once sampling completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub chain_id: usize,
    pub seed: u64,
    /// Constrained parameter vectors, one per retained iteration.
    pub draws: Vec<Vec<f64>>,
    pub stats: Vec<DrawStats>,
    pub adaptation: AdaptationInfo,
}

impl Chain {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Trace of one parameter across the chain.
    #[must_use]
    pub fn parameter(&self, index: usize) -> Vec<f64> {
        self.draws.iter().map(|draw| draw[index]).collect()
    }

    #[must_use]
    pub fn divergences(&self) -> usize {
        self.stats.iter().filter(|stats| stats.divergent).count()
    }

    #[must_use]
    pub fn energies(&self) -> Vec<f64> {
        self.stats.iter().map(|stats| stats.energy).collect()
    }
}

/// Run one chain from `initial` (unconstrained scale).
///
/// # Errors
///
/// Returns `InferenceError::NonFiniteDensity` if no finite starting point is found,
/// `Cancelled`/`TimedOut` if the control asks to stop, or `DimensionMismatch` if
/// `initial` does not match the target.
pub fn run_chain<T: LogDensity + ?Sized>(
    target: &T,
    initial: &[f64],
    config: SamplerConfig,
    chain_id: usize,
    control: &SamplingControl,
) -> Result<Chain, InferenceError> {
    let dim = target.dim();
    if initial.len() != dim {
        return Err(InferenceError::DimensionMismatch {
            expected: dim,
            found: initial.len(),
        });
    }

    let seed = config.chain_seed(chain_id);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut point = initial_point(target, initial, config.init_jitter, chain_id, &mut rng)?;

    let unit_metric = vec![1.0; dim];
    let step_size = find_reasonable_step_size(target, &point, 1.0, &unit_metric, &mut rng);
    let mut adaptation = WindowedAdaptation::new(
        dim,
        config.warmup_iterations,
        config.target_accept_probability,
        step_size,
    );

    for _ in 0..config.warmup_iterations {
        control.check()?;
        let step = transition(
            target,
            &point,
            adaptation.step_size(),
            adaptation.inverse_metric(),
            config.max_tree_depth,
            &mut rng,
        );
        point = step.point;
        if adaptation.update(&point.position, step.accept_stat) {
            let restarted = find_reasonable_step_size(
                target,
                &point,
                adaptation.step_size(),
                adaptation.inverse_metric(),
                &mut rng,
            );
            adaptation.restart_step_size(restarted);
        }
    }

    let info = AdaptationInfo {
        step_size: adaptation.final_step_size(),
        inverse_metric: adaptation.inverse_metric().to_vec(),
    };
    log::debug!(
        "chain {chain_id}: adapted step size {:.4e}, metric range [{:.3e}, {:.3e}]",
        info.step_size,
        info.inverse_metric
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min),
        info.inverse_metric
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max),
    );

    let mut draws = Vec::with_capacity(config.sampling_iterations);
    let mut stats = Vec::with_capacity(config.sampling_iterations);
    for _ in 0..config.sampling_iterations {
        control.check()?;
        let step = transition(
            target,
            &point,
            info.step_size,
            &info.inverse_metric,
            config.max_tree_depth,
            &mut rng,
        );
        draws.push(target.constrain(&step.point.position));
        stats.push(DrawStats {
            step_size: info.step_size,
            tree_depth: step.tree_depth,
            n_leapfrog: step.n_leapfrog,
            divergent: step.divergent,
            accept_stat: step.accept_stat,
            energy: step.energy,
            log_density: step.point.log_density,
        });
        point = step.point;
    }

    let chain = Chain {
        chain_id,
        seed,
        draws,
        stats,
        adaptation: info,
    };
    let divergences = chain.divergences();
    if divergences > 0 {
        log::warn!(
            "chain {chain_id}: {divergences} of {} post-warmup transitions diverged",
            chain.len()
        );
    }
    Ok(chain)
}

fn initial_point<T: LogDensity + ?Sized>(
    target: &T,
    initial: &[f64],
    jitter: f64,
    chain_id: usize,
    rng: &mut StdRng,
) -> Result<PhasePoint, InferenceError> {
    let attempts = if jitter > 0.0 { MAX_INIT_ATTEMPTS } else { 1 };
    for _ in 0..attempts {
        let position = initial
            .iter()
            .map(|value| {
                if jitter > 0.0 {
                    value + rng.random_range(-jitter..jitter)
                } else {
                    *value
                }
            })
            .collect();
        let point = PhasePoint::new(target, position);
        if point.is_finite() {
            return Ok(point);
        }
    }
    Err(InferenceError::NonFiniteDensity { chain: chain_id })
}

/// Run `config.num_chains` independent chains in parallel.
///
/// Chains are returned in index order. If any chain fails, is cancelled, or times
/// out, all draws are discarded and the first error (by chain index) is returned.
///
/// # Errors
///
/// Returns `InferenceError` if the configuration is invalid or any chain fails.
pub fn sample_chains<T: LogDensity + ?Sized>(
    target: &T,
    initial: &[f64],
    config: SamplerConfig,
    control: &SamplingControl,
) -> Result<Vec<Chain>, InferenceError> {
    config.validate()?;

    let results = std::thread::scope(|scope| {
        let handles = (0..config.num_chains)
            .map(|chain_id| {
                scope.spawn(move || run_chain(target, initial, config, chain_id, control))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| InferenceError::WorkerPanicked)
                    .and_then(|result| result)
            })
            .collect::<Vec<_>>()
    });

    results.into_iter().collect()
}
