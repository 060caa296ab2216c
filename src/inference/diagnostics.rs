//! Convergence diagnostics computed from raw chains.
//!
//! - split-R-hat (each chain halved, so a single chain still yields two sequences),
//! - bulk ESS on rank-normalised split chains (variogram autocorrelation with
//!   Geyer's initial monotone sequence),
//! - tail ESS from 5% / 95% quantile indicator chains,
//! - lagged autocorrelation, E-BFMI, divergence and tree-depth counts.
//!
//! Violations become [`Warning`]s; nothing here fails a fit.

use std::fmt;

use serde::{Deserialize, Serialize};
use statrs::function::erf::erf_inv;
use thiserror::Error;

use super::chain::Chain;
use crate::utils::{percentile, sample_variance, usize_to_f64};

/// Errors for malformed diagnostic inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("at least one chain is required")]
    NoChains,
    #[error("each chain must retain at least {minimum} draws; minimum found {found}")]
    InsufficientDraws { minimum: usize, found: usize },
    #[error("parameter dimensions differ across chains or names")]
    InconsistentDimensions,
}

/// Non-fatal issues attached to fits and LOO results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Warning {
    SamplingDivergence {
        chain: usize,
        count: usize,
    },
    ConvergenceWarning {
        parameter: String,
        rhat: f64,
        ess_bulk: f64,
    },
    TreeDepthSaturation {
        chain: usize,
        count: usize,
    },
    LowEbfmi {
        chain: usize,
        ebfmi: f64,
    },
    UnreliableLooEstimate {
        observation: usize,
        pareto_k: f64,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SamplingDivergence { chain, count } => {
                write!(f, "chain {chain}: {count} divergent transitions")
            }
            Self::ConvergenceWarning {
                parameter,
                rhat,
                ess_bulk,
            } => write!(
                f,
                "{parameter}: R-hat {rhat:.3}, bulk ESS {ess_bulk:.0} outside thresholds"
            ),
            Self::TreeDepthSaturation { chain, count } => {
                write!(f, "chain {chain}: {count} transitions hit the maximum tree depth")
            }
            Self::LowEbfmi { chain, ebfmi } => write!(f, "chain {chain}: E-BFMI {ebfmi:.3}"),
            Self::UnreliableLooEstimate {
                observation,
                pareto_k,
            } => write!(f, "observation {observation}: Pareto k {pareto_k:.2}"),
        }
    }
}

/// Thresholds that turn diagnostics into warnings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceThresholds {
    pub max_rhat: f64,
    /// Bulk ESS must reach this many draws per chain.
    pub min_ess_per_chain: f64,
    pub max_lag: usize,
    pub min_ebfmi: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            max_rhat: 1.01,
            min_ess_per_chain: 400.0,
            max_lag: 20,
            min_ebfmi: 0.3,
        }
    }
}

/// Diagnostics for one scalar parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDiagnostics {
    pub name: String,
    pub rhat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    /// Chain-averaged autocorrelation at lags `1..=max_lag`.
    pub autocorrelation: Vec<f64>,
}

/// Run-level convergence report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSummary {
    pub chain_count: usize,
    pub draws_per_chain_used: usize,
    pub parameters: Vec<ParameterDiagnostics>,
    pub divergences: usize,
    pub divergence_rate: f64,
    pub max_tree_depth_hits: usize,
    pub ebfmi: Vec<f64>,
    pub max_rhat: Option<f64>,
    pub min_ess_bulk: Option<f64>,
    pub warnings: Vec<Warning>,
}

impl ConvergenceSummary {
    /// No divergences and every parameter within the R-hat and ESS thresholds.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.divergences == 0
            && !self
                .warnings
                .iter()
                .any(|warning| matches!(warning, Warning::ConvergenceWarning { .. }))
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterDiagnostics> {
        self.parameters.iter().find(|param| param.name == name)
    }
}

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let mut numerator = 0.0;
    let mut denominator = 0.0;

    for value in series {
        let centered = value - mean;
        denominator += centered * centered;
    }

    if denominator <= 0.0 {
        return 0.0;
    }

    for idx in 0..n {
        numerator += (series[idx] - mean) * (series[idx + lag] - mean);
    }

    numerator / denominator
}

/// Autocorrelation at lags `1..=max_lag`, averaged over chains.
#[must_use]
pub fn autocorrelation_function(chains: &[Vec<f64>], max_lag: usize) -> Vec<f64> {
    if chains.is_empty() {
        return vec![0.0; max_lag];
    }
    (1..=max_lag)
        .map(|lag| {
            chains
                .iter()
                .map(|chain| autocorrelation(chain, lag))
                .sum::<f64>()
                / usize_to_f64(chains.len())
        })
        .collect()
}

/// Split-R-hat over chains truncated to a common even length.
///
/// # Errors
///
/// Returns `DiagnosticsError` if there are no chains or fewer than four draws per chain.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, DiagnosticsError> {
    let halves = split_halves(chains)?;
    Ok(rhat_of_sequences(&halves))
}

/// Bulk effective sample size over all chains.
///
/// # Errors
///
/// Returns `DiagnosticsError` if there are no chains or fewer than four draws per chain.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> Result<f64, DiagnosticsError> {
    let halves = split_halves(chains)?;
    Ok(ess_of_sequences(&rank_normalize(&halves)))
}

/// Tail effective sample size: the smaller ESS of the 5% and 95% indicator chains.
///
/// # Errors
///
/// Returns `DiagnosticsError` if there are no chains or fewer than four draws per chain.
pub fn tail_effective_sample_size(chains: &[Vec<f64>]) -> Result<f64, DiagnosticsError> {
    let halves = split_halves(chains)?;
    let mut pooled = halves.iter().flatten().copied().collect::<Vec<_>>();
    pooled.sort_by(f64::total_cmp);
    let lower_cut = percentile(&pooled, 0.05);
    let upper_cut = percentile(&pooled, 0.95);

    let indicator = |keep: &dyn Fn(f64) -> bool| {
        halves
            .iter()
            .map(|half| {
                half.iter()
                    .map(|value| if keep(*value) { 1.0 } else { 0.0 })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    };
    let lower = indicator(&|value| value <= lower_cut);
    let upper = indicator(&|value| value >= upper_cut);
    Ok(ess_of_sequences(&lower).min(ess_of_sequences(&upper)))
}

/// Energy Bayesian fraction of missing information for one chain.
#[must_use]
pub fn ebfmi(energies: &[f64]) -> f64 {
    if energies.len() < 2 {
        return f64::NAN;
    }
    let mean = energies.iter().sum::<f64>() / usize_to_f64(energies.len());
    let denominator = energies
        .iter()
        .map(|energy| (energy - mean) * (energy - mean))
        .sum::<f64>();
    if denominator <= 0.0 {
        return f64::NAN;
    }
    let numerator = energies
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) * (pair[1] - pair[0]))
        .sum::<f64>();
    numerator / denominator
}

/// One `SamplingDivergence` warning per chain with divergent transitions.
#[must_use]
pub fn divergence_warnings(chains: &[Chain]) -> Vec<Warning> {
    chains
        .iter()
        .filter(|chain| chain.divergences() > 0)
        .map(|chain| Warning::SamplingDivergence {
            chain: chain.chain_id,
            count: chain.divergences(),
        })
        .collect()
}

/// Summarize convergence for every stored parameter of a set of chains.
///
/// # Errors
///
/// Returns `DiagnosticsError` if chains are missing, too short, or disagree with `names`.
pub fn summarize_convergence(
    chains: &[Chain],
    names: &[String],
    thresholds: ConvergenceThresholds,
    max_tree_depth: usize,
) -> Result<ConvergenceSummary, DiagnosticsError> {
    if chains.is_empty() {
        return Err(DiagnosticsError::NoChains);
    }
    let min_draws = chains.iter().map(Chain::len).min().unwrap_or(0);
    let draws_per_chain_used = min_draws - (min_draws % 2);
    if draws_per_chain_used < 4 {
        return Err(DiagnosticsError::InsufficientDraws {
            minimum: 4,
            found: draws_per_chain_used,
        });
    }
    if chains
        .iter()
        .flat_map(|chain| chain.draws.iter())
        .any(|draw| draw.len() != names.len())
    {
        return Err(DiagnosticsError::InconsistentDimensions);
    }

    let mut warnings = Vec::new();
    let min_ess = thresholds.min_ess_per_chain * usize_to_f64(chains.len());

    let mut parameters = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        let traces = chains
            .iter()
            .map(|chain| {
                chain
                    .draws
                    .iter()
                    .take(draws_per_chain_used)
                    .map(|draw| draw[index])
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let rhat = split_rhat(&traces)?;
        let ess_bulk = effective_sample_size(&traces)?;
        let ess_tail = tail_effective_sample_size(&traces)?;
        if !(rhat <= thresholds.max_rhat && ess_bulk >= min_ess) {
            log::warn!(
                "{name}: split R-hat {rhat:.4}, bulk ESS {ess_bulk:.1} (wanted <= {:.3}, >= {min_ess:.0})",
                thresholds.max_rhat
            );
            warnings.push(Warning::ConvergenceWarning {
                parameter: name.clone(),
                rhat,
                ess_bulk,
            });
        }
        parameters.push(ParameterDiagnostics {
            name: name.clone(),
            rhat,
            ess_bulk,
            ess_tail,
            autocorrelation: autocorrelation_function(&traces, thresholds.max_lag),
        });
    }

    let mut divergences = 0;
    let mut max_tree_depth_hits = 0;
    let mut ebfmi_values = Vec::with_capacity(chains.len());
    warnings.extend(divergence_warnings(chains));
    for chain in chains {
        divergences += chain.divergences();

        let saturated = chain
            .stats
            .iter()
            .filter(|stats| stats.tree_depth >= max_tree_depth)
            .count();
        if saturated > 0 {
            warnings.push(Warning::TreeDepthSaturation {
                chain: chain.chain_id,
                count: saturated,
            });
        }
        max_tree_depth_hits += saturated;

        let chain_ebfmi = ebfmi(&chain.energies());
        // Constant energies give NaN, which is reported rather than passed.
        if chain_ebfmi.is_nan() || chain_ebfmi < thresholds.min_ebfmi {
            log::warn!("chain {}: E-BFMI {chain_ebfmi:.3}", chain.chain_id);
            warnings.push(Warning::LowEbfmi {
                chain: chain.chain_id,
                ebfmi: chain_ebfmi,
            });
        }
        ebfmi_values.push(chain_ebfmi);
    }

    let total_draws: usize = chains.iter().map(Chain::len).sum();
    let max_rhat = parameters
        .iter()
        .map(|param| param.rhat)
        .max_by(f64::total_cmp);
    let min_ess_bulk = parameters
        .iter()
        .map(|param| param.ess_bulk)
        .min_by(f64::total_cmp);

    Ok(ConvergenceSummary {
        chain_count: chains.len(),
        draws_per_chain_used,
        parameters,
        divergences,
        divergence_rate: usize_to_f64(divergences) / usize_to_f64(total_draws.max(1)),
        max_tree_depth_hits,
        ebfmi: ebfmi_values,
        max_rhat,
        min_ess_bulk,
        warnings,
    })
}

fn split_halves(chains: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, DiagnosticsError> {
    if chains.is_empty() {
        return Err(DiagnosticsError::NoChains);
    }
    let min_draws = chains.iter().map(Vec::len).min().unwrap_or(0);
    let used = min_draws - (min_draws % 2);
    if used < 4 {
        return Err(DiagnosticsError::InsufficientDraws {
            minimum: 4,
            found: used,
        });
    }
    let half = used / 2;
    Ok(chains
        .iter()
        .flat_map(|chain| [chain[..half].to_vec(), chain[half..used].to_vec()])
        .collect())
}

fn rhat_of_sequences(sequences: &[Vec<f64>]) -> f64 {
    let Some((within, var_plus)) = variance_components(sequences) else {
        return 1.0;
    };
    (var_plus / within).sqrt().max(1.0)
}

/// Within-sequence variance and the pooled marginal variance estimate.
fn variance_components(sequences: &[Vec<f64>]) -> Option<(f64, f64)> {
    let m = sequences.len();
    let n = sequences.first().map_or(0, Vec::len);
    if m < 2 || n < 2 {
        return None;
    }

    let means = sequences
        .iter()
        .map(|sequence| sequence.iter().sum::<f64>() / usize_to_f64(n))
        .collect::<Vec<_>>();
    let within = sequences
        .iter()
        .zip(&means)
        .map(|(sequence, mean)| sample_variance(sequence, *mean))
        .sum::<f64>()
        / usize_to_f64(m);
    let mean_of_means = means.iter().sum::<f64>() / usize_to_f64(m);
    let between = usize_to_f64(n) * sample_variance(&means, mean_of_means);

    if !(within.is_finite() && within > 0.0 && between.is_finite()) {
        return None;
    }
    let n_f64 = usize_to_f64(n);
    let var_plus = ((n_f64 - 1.0) / n_f64).mul_add(within, between / n_f64);
    (var_plus.is_finite() && var_plus > 0.0).then_some((within, var_plus))
}

fn ess_of_sequences(sequences: &[Vec<f64>]) -> f64 {
    let m = sequences.len();
    let n = sequences.first().map_or(0, Vec::len);
    let total = usize_to_f64(m * n);
    let Some((_, var_plus)) = variance_components(sequences) else {
        return total;
    };

    // rho_t = 1 - V_t / (2 var_plus), V_t the mean squared lag-t difference
    let rho = |lag: usize| {
        let variogram = sequences
            .iter()
            .map(|sequence| {
                sequence
                    .windows(lag + 1)
                    .map(|window| {
                        let diff = window[lag] - window[0];
                        diff * diff
                    })
                    .sum::<f64>()
            })
            .sum::<f64>()
            / usize_to_f64(m * (n - lag));
        1.0 - variogram / (2.0 * var_plus)
    };

    let mut tau = -1.0;
    let mut previous_pair = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let even = if lag == 0 { 1.0 } else { rho(lag) };
        let pair = even + rho(lag + 1);
        if pair < 0.0 {
            break;
        }
        let pair = pair.min(previous_pair);
        tau += 2.0 * pair;
        previous_pair = pair;
        lag += 2;
    }

    let tau = tau.max(1.0 / total.log10().max(1.0));
    total / tau
}

/// Replace values by normal scores of their pooled ranks (ties share the average rank).
fn rank_normalize(sequences: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut flat = sequences
        .iter()
        .enumerate()
        .flat_map(|(seq, values)| {
            values
                .iter()
                .enumerate()
                .map(move |(pos, value)| (*value, seq, pos))
        })
        .collect::<Vec<_>>();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total = usize_to_f64(flat.len());
    let mut scores = sequences
        .iter()
        .map(|values| vec![0.0; values.len()])
        .collect::<Vec<_>>();
    let mut start = 0;
    while start < flat.len() {
        let mut end = start + 1;
        while end < flat.len() && flat[end].0 == flat[start].0 {
            end += 1;
        }
        let rank = 0.5 * (usize_to_f64(start + 1) + usize_to_f64(end));
        let probability = ((rank - 0.375) / (total + 0.25)).clamp(1.0e-12, 1.0 - 1.0e-12);
        let score = std::f64::consts::SQRT_2 * erf_inv(2.0f64.mul_add(probability, -1.0));
        for &(_, seq, pos) in &flat[start..end] {
            scores[seq][pos] = score;
        }
        start = end;
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::chain::{AdaptationInfo, DrawStats};
    use crate::utils::sample_standard_normal;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn iid_chain(seed: u64, n: usize, shift: f64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| sample_standard_normal(&mut rng) + shift)
            .collect()
    }

    fn ar1_chain(seed: u64, n: usize, phi: f64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = 0.0;
        (0..n)
            .map(|_| {
                state = phi * state + sample_standard_normal(&mut rng);
                state
            })
            .collect()
    }

    fn chain_from_trace(chain_id: usize, trace: &[f64]) -> Chain {
        Chain {
            chain_id,
            seed: 0,
            draws: trace.iter().map(|value| vec![*value]).collect(),
            stats: trace
                .iter()
                .map(|value| DrawStats {
                    step_size: 0.5,
                    tree_depth: 2,
                    n_leapfrog: 3,
                    divergent: false,
                    accept_stat: 0.8,
                    energy: value * value,
                    log_density: -0.5 * value * value,
                })
                .collect(),
            adaptation: AdaptationInfo {
                step_size: 0.5,
                inverse_metric: vec![1.0],
            },
        }
    }

    #[test]
    fn autocorrelation_is_zero_for_invalid_lag() {
        let values = [1.0, 2.0, 3.0];
        assert!((autocorrelation(&values, 3) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn split_rhat_approaches_one_for_stationary_chains() {
        let long = [iid_chain(1, 5_000, 0.0), iid_chain(2, 5_000, 0.0)];
        let long_rhat = split_rhat(&long).expect("rhat should compute");
        assert!(long_rhat >= 1.0);
        assert!(long_rhat < 1.005);
    }

    #[test]
    fn split_rhat_flags_separated_chains() {
        let chains = [iid_chain(1, 500, 0.0), iid_chain(2, 500, 5.0)];
        assert!(split_rhat(&chains).expect("rhat should compute") > 1.5);
    }

    #[test]
    fn single_chain_is_split_in_two() {
        let chain = [iid_chain(3, 400, 0.0)];
        let rhat = split_rhat(&chain).expect("single chain rhat should compute");
        assert!(rhat < 1.05);
        assert!(matches!(
            split_rhat(&[vec![1.0, 2.0, 3.0]]),
            Err(DiagnosticsError::InsufficientDraws { .. })
        ));
        assert_eq!(split_rhat(&[]), Err(DiagnosticsError::NoChains));
    }

    #[test]
    fn ess_separates_iid_from_correlated_draws() {
        let iid = [iid_chain(4, 1_000, 0.0), iid_chain(5, 1_000, 0.0)];
        let correlated = [ar1_chain(4, 1_000, 0.95), ar1_chain(5, 1_000, 0.95)];
        let iid_ess = effective_sample_size(&iid).expect("ess should compute");
        let correlated_ess = effective_sample_size(&correlated).expect("ess should compute");
        assert!(iid_ess > 1_400.0);
        assert!(correlated_ess < 300.0);
        let tail = tail_effective_sample_size(&iid).expect("tail ess should compute");
        assert!(tail > 800.0);
    }

    #[test]
    fn autocorrelation_function_decays_for_ar1() {
        let acf = autocorrelation_function(&[ar1_chain(8, 5_000, 0.5)], 20);
        assert_eq!(acf.len(), 20);
        assert!((acf[0] - 0.5).abs() < 0.05);
        assert!(acf[19].abs() < 0.1);
    }

    #[test]
    fn ebfmi_is_large_for_independent_energies() {
        let energies = iid_chain(9, 2_000, 10.0);
        assert!((ebfmi(&energies) - 2.0).abs() < 0.2);
        assert!(ebfmi(&ar1_chain(9, 2_000, 0.99)) < 0.3);
    }

    #[test]
    fn summary_reports_warnings_without_failing() {
        let good = vec![
            chain_from_trace(0, &iid_chain(10, 1_000, 0.0)),
            chain_from_trace(1, &iid_chain(11, 1_000, 0.0)),
        ];
        let names = vec!["theta".to_string()];
        let summary = summarize_convergence(&good, &names, ConvergenceThresholds::default(), 10)
            .expect("summary should compute");
        assert!(summary.is_converged());
        assert_eq!(summary.parameters[0].autocorrelation.len(), 20);

        let mut bad = vec![
            chain_from_trace(0, &iid_chain(10, 1_000, 0.0)),
            chain_from_trace(1, &iid_chain(11, 1_000, 4.0)),
        ];
        bad[1].stats[3].divergent = true;
        let summary = summarize_convergence(&bad, &names, ConvergenceThresholds::default(), 10)
            .expect("summary should compute");
        assert!(!summary.is_converged());
        assert_eq!(summary.divergences, 1);
        assert!(summary.warnings.contains(&Warning::SamplingDivergence { chain: 1, count: 1 }));
        assert!(summary.parameter("theta").is_some_and(|param| param.rhat > 1.1));
    }

    #[test]
    fn constant_energies_are_flagged_as_low_ebfmi() {
        let mut chains = vec![
            chain_from_trace(0, &iid_chain(13, 200, 0.0)),
            chain_from_trace(1, &iid_chain(14, 200, 0.0)),
        ];
        for stats in &mut chains[1].stats {
            stats.energy = 3.0;
        }
        assert!(ebfmi(&chains[1].energies()).is_nan());

        let names = vec!["theta".to_string()];
        let summary = summarize_convergence(&chains, &names, ConvergenceThresholds::default(), 10)
            .expect("summary should compute");
        assert!(summary.warnings.iter().any(|warning| matches!(
            warning,
            Warning::LowEbfmi { chain: 1, ebfmi } if ebfmi.is_nan()
        )));
        assert!(
            !summary
                .warnings
                .iter()
                .any(|warning| matches!(warning, Warning::LowEbfmi { chain: 0, .. }))
        );
    }

    #[test]
    fn divergence_warnings_count_per_chain() {
        let mut chains = vec![
            chain_from_trace(0, &iid_chain(15, 10, 0.0)),
            chain_from_trace(1, &iid_chain(16, 10, 0.0)),
        ];
        chains[1].stats[0].divergent = true;
        chains[1].stats[4].divergent = true;
        assert_eq!(
            divergence_warnings(&chains),
            vec![Warning::SamplingDivergence { chain: 1, count: 2 }]
        );
    }

    #[test]
    fn summary_checks_parameter_names() {
        let chains = vec![chain_from_trace(0, &iid_chain(12, 100, 0.0))];
        let names = vec!["a".to_string(), "b".to_string()];
        let result = summarize_convergence(&chains, &names, ConvergenceThresholds::default(), 10);
        assert_eq!(result, Err(DiagnosticsError::InconsistentDimensions));
    }
}
