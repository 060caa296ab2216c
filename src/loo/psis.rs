//! Pareto-smoothed importance sampling.
//!
//! The largest `M = ceil(min(0.2 S, 3 √S))` log ratios are replaced by expected
//! order statistics of a generalised Pareto distribution fitted to the tail
//! exceedances with the Zhang–Stephens empirical-Bayes estimator. Smoothed
//! weights are truncated at the largest raw weight and self-normalised.

use crate::utils::{log_sum_exp, usize_to_f64};

const MIN_TAIL_LENGTH: usize = 5;
const GRID_MIN_POINTS: usize = 30;
const SHAPE_PRIOR: f64 = 3.0;
const WIP_PRIOR_SIZE: f64 = 10.0;
const WIP_PRIOR_SHAPE: f64 = 0.5;

/// Smoothed, normalised log weights and the fitted tail shape.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedWeights {
    /// Log weights summing (in probability space) to one.
    pub log_weights: Vec<f64>,
    pub pareto_k: f64,
}

/// Number of draws treated as the tail for `draws` importance ratios.
#[must_use]
pub fn tail_length(draws: usize) -> usize {
    let s = usize_to_f64(draws);
    let length = (0.2 * s).min(3.0 * s.sqrt()).ceil();
    num_traits::ToPrimitive::to_usize(&length).unwrap_or(0)
}

/// Pareto-smooth a vector of raw log importance ratios.
///
/// With fewer than five tail draws no fit is attempted and `pareto_k` is `+inf`.
/// A constant tail is left as is with `pareto_k = 0`.
#[must_use]
pub fn psis_smooth(log_ratios: &[f64]) -> SmoothedWeights {
    let draws = log_ratios.len();
    let max_ratio = log_ratios
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let mut log_weights = log_ratios
        .iter()
        .map(|ratio| ratio - max_ratio)
        .collect::<Vec<_>>();

    let tail = tail_length(draws);
    let mut pareto_k = f64::INFINITY;
    if tail >= MIN_TAIL_LENGTH && tail < draws {
        let mut order = (0..draws).collect::<Vec<_>>();
        order.sort_by(|a, b| log_weights[*a].total_cmp(&log_weights[*b]));
        let tail_ids = &order[draws - tail..];
        let cutoff = log_weights[order[draws - tail - 1]];
        let tail_values = tail_ids
            .iter()
            .map(|id| log_weights[*id])
            .collect::<Vec<_>>();

        let spread = tail_values[tail - 1] - tail_values[0];
        if spread.abs() < f64::EPSILON / 100.0 {
            pareto_k = 0.0;
        } else {
            let exp_cutoff = cutoff.exp();
            let exceedances = tail_values
                .iter()
                .map(|value| value.exp() - exp_cutoff)
                .collect::<Vec<_>>();
            let (k, sigma) = gpd_fit(&exceedances);
            pareto_k = k;
            if k.is_finite() {
                for (rank, id) in tail_ids.iter().enumerate() {
                    let p = (usize_to_f64(rank) + 0.5) / usize_to_f64(tail);
                    log_weights[*id] = (gpd_quantile(p, k, sigma) + exp_cutoff).ln();
                }
            }
        }
    }

    for weight in &mut log_weights {
        if *weight > 0.0 {
            *weight = 0.0;
        }
    }
    let normalizer = log_sum_exp(&log_weights);
    for weight in &mut log_weights {
        *weight -= normalizer;
    }

    SmoothedWeights {
        log_weights,
        pareto_k,
    }
}

/// Fit a generalised Pareto distribution to ascending, non-negative exceedances.
///
/// Returns `(k, sigma)` with the shape shrunk towards 0.5 by a weak prior worth
/// ten observations. `k` is `+inf` when the fit breaks down.
#[must_use]
pub fn gpd_fit(sorted_exceedances: &[f64]) -> (f64, f64) {
    let n = sorted_exceedances.len();
    if n == 0 {
        return (f64::INFINITY, f64::NAN);
    }
    let n_f64 = usize_to_f64(n);
    let grid_points = GRID_MIN_POINTS
        + num_traits::ToPrimitive::to_usize(&n_f64.sqrt().floor()).unwrap_or(0);
    let quartile_index = num_traits::ToPrimitive::to_usize(&(n_f64 / 4.0 + 0.5).floor())
        .unwrap_or(1)
        .clamp(1, n)
        - 1;
    let x_star = sorted_exceedances[quartile_index];
    let x_max = sorted_exceedances[n - 1];
    let grid_f64 = usize_to_f64(grid_points);

    let thetas = (1..=grid_points)
        .map(|j| {
            1.0 / x_max
                + (1.0 - (grid_f64 / (usize_to_f64(j) - 0.5)).sqrt()) / SHAPE_PRIOR / x_star
        })
        .collect::<Vec<_>>();
    let profile = thetas
        .iter()
        .map(|theta| n_f64 * profile_log_likelihood(*theta, sorted_exceedances))
        .collect::<Vec<_>>();
    let normalizer = log_sum_exp(&profile);
    let theta_hat = thetas
        .iter()
        .zip(&profile)
        .map(|(theta, log_lik)| theta * (log_lik - normalizer).exp())
        .sum::<f64>();

    let k = sorted_exceedances
        .iter()
        .map(|x| (-theta_hat * x).ln_1p())
        .sum::<f64>()
        / n_f64;
    let sigma = -k / theta_hat;
    let k = k.mul_add(n_f64, WIP_PRIOR_SIZE * WIP_PRIOR_SHAPE) / (n_f64 + WIP_PRIOR_SIZE);
    if k.is_nan() {
        (f64::INFINITY, sigma)
    } else {
        (k, sigma)
    }
}

/// Per-observation profile log likelihood of the GPD at `theta`.
fn profile_log_likelihood(theta: f64, exceedances: &[f64]) -> f64 {
    let k = exceedances
        .iter()
        .map(|x| (-theta * x).ln_1p())
        .sum::<f64>()
        / usize_to_f64(exceedances.len());
    (-theta / k).ln() - k - 1.0
}

/// GPD quantile function.
fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if k.abs() < 1.0e-12 {
        return -sigma * (-p).ln_1p();
    }
    sigma * (-k * (-p).ln_1p()).exp_m1() / k
}
