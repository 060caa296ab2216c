//! Posterior predictive simulation and checks.

use std::collections::HashMap;

use faer::Mat;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};

use super::density::ParameterLayout;
use super::likelihood::{design_matrix, row_dot};
use super::posterior::PosteriorSampleSet;
use super::types::ModelError;
use crate::input::{Dataset, GroupIndex, InputError};
use crate::utils::{sample_standard_normal, usize_to_f64};

/// Covariate rows and group labels to simulate responses for.
#[derive(Debug, Clone)]
pub struct PredictionData {
    covariates: Mat<f64>,
    covariate_names: Vec<String>,
    group_labels: Vec<String>,
}

impl PredictionData {
    /// # Errors
    ///
    /// Returns `InputError` if there are no rows, column lengths differ, or values
    /// are non-finite.
    pub fn new<S: AsRef<str>>(
        covariates: Vec<(String, Vec<f64>)>,
        group_labels: &[S],
    ) -> Result<Self, InputError> {
        let n = group_labels.len();
        if n == 0 {
            return Err(InputError::Empty);
        }
        for (name, values) in &covariates {
            if values.len() != n {
                return Err(InputError::LengthMismatch {
                    what: format!("covariate `{name}`"),
                    expected: n,
                    found: values.len(),
                });
            }
            if let Some(row) = values.iter().position(|value| !value.is_finite()) {
                return Err(InputError::NonFiniteCovariate {
                    name: name.clone(),
                    row,
                });
            }
        }
        Ok(Self {
            covariates: Mat::from_fn(n, covariates.len(), |row, col| covariates[col].1[row]),
            covariate_names: covariates.into_iter().map(|(name, _)| name).collect(),
            group_labels: group_labels
                .iter()
                .map(|label| label.as_ref().to_string())
                .collect(),
        })
    }

    /// Training rows of a dataset.
    #[must_use]
    pub fn from_dataset(dataset: &Dataset) -> Self {
        let labels = dataset.groups().labels();
        Self {
            covariates: dataset.covariates().clone(),
            covariate_names: dataset.covariate_names().to_vec(),
            group_labels: dataset
                .groups()
                .codes()
                .iter()
                .map(|code| labels[*code].clone())
                .collect(),
        }
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.group_labels.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictiveOptions {
    /// Posterior draws to use, chosen uniformly without replacement; `None` uses all.
    pub draws: Option<usize>,
    pub seed: u64,
}

impl Default for PredictiveOptions {
    fn default() -> Self {
        Self {
            draws: None,
            seed: 20_240_601,
        }
    }
}

/// One simulated response vector per selected posterior draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveSampleSet {
    /// Indices into the posterior sample set, ascending.
    pub draw_indices: Vec<usize>,
    pub draws: Vec<Vec<f64>>,
}

impl PredictiveSampleSet {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Simulated values of one row across draws.
    #[must_use]
    pub fn row(&self, index: usize) -> Vec<f64> {
        self.draws.iter().map(|draw| draw[index]).collect()
    }
}

/// Observed statistic against its posterior predictive distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveCheck {
    pub observed: f64,
    pub replicated: Vec<f64>,
    /// Share of replicated statistics at or above the observed one.
    pub p_value: f64,
}

/// Compare `statistic(observed)` with the statistic of every simulated vector.
#[must_use]
pub fn predictive_check<F>(
    observed: &[f64],
    predictive: &PredictiveSampleSet,
    statistic: F,
) -> PredictiveCheck
where
    F: Fn(&[f64]) -> f64,
{
    let observed_stat = statistic(observed);
    let replicated = predictive
        .draws
        .iter()
        .map(|draw| statistic(draw))
        .collect::<Vec<_>>();
    let exceed = replicated
        .iter()
        .filter(|value| **value >= observed_stat)
        .count();
    PredictiveCheck {
        observed: observed_stat,
        p_value: usize_to_f64(exceed) / usize_to_f64(replicated.len().max(1)),
        replicated,
    }
}

enum GroupRef {
    Known(usize),
    Unseen(usize),
}

fn select_draws(available: usize, requested: Option<usize>, rng: &mut StdRng) -> Vec<usize> {
    let mut indices = (0..available).collect::<Vec<_>>();
    let Some(count) = requested.filter(|count| *count < available) else {
        return indices;
    };
    for position in 0..count {
        let pick = rng.random_range(position..available);
        indices.swap(position, pick);
    }
    indices.truncate(count);
    indices.sort_unstable();
    indices
}

/// Simulate responses for `data` from the posterior predictive distribution.
///
/// Groups absent from training receive fresh effects drawn from the group-level
/// distribution of each posterior draw, shared by all rows with that label.
///
/// # Errors
///
/// Returns `ModelError` if the posterior is empty, more draws are requested than
/// exist, or `data` lacks a covariate the model uses.
pub fn simulate_posterior_predictive(
    layout: &ParameterLayout,
    posterior: &PosteriorSampleSet,
    data: &PredictionData,
    options: &PredictiveOptions,
) -> Result<PredictiveSampleSet, ModelError> {
    if posterior.is_empty() {
        return Err(ModelError::EmptyPosterior);
    }
    if let Some(requested) = options.draws {
        if requested == 0 || requested > posterior.len() {
            return Err(ModelError::InvalidPredictiveDraws {
                requested,
                available: posterior.len(),
            });
        }
    }

    let fixed_design = design_matrix(layout.fixed_terms(), &data.covariates, &data.covariate_names)?;
    let random_design =
        design_matrix(layout.random_terms(), &data.covariates, &data.covariate_names)?;
    let q = layout.n_random();

    let fitted_groups = GroupIndex::with_labels(layout.group_labels().to_vec());
    let mut unseen = HashMap::new();
    let groups = data
        .group_labels
        .iter()
        .map(|label| {
            fitted_groups
                .index_of(label)
                .map_or_else(
                    || {
                        let next = unseen.len();
                        GroupRef::Unseen(*unseen.entry(label.clone()).or_insert(next))
                    },
                    GroupRef::Known,
                )
        })
        .collect::<Vec<_>>();
    let n_unseen = if q > 0 { unseen.len() } else { 0 };

    let mut rng = StdRng::seed_from_u64(options.seed);
    let draw_indices = select_draws(posterior.len(), options.draws, &mut rng);
    let mut draws = Vec::with_capacity(draw_indices.len());
    let mut fresh = vec![0.0; n_unseen * q];

    for index in &draw_indices {
        let draw = &posterior.draws()[*index];
        let sigma = draw[layout.sigma()];
        let beta = &draw[..layout.n_fixed()];

        if n_unseen > 0 {
            let rho = layout.correlation().map_or(0.0, |slot| draw[slot]);
            for group in 0..n_unseen {
                let z0 = sample_standard_normal(&mut rng);
                fresh[group * q] = draw[layout.group_scale(0)] * z0;
                if q == 2 {
                    let z1 = sample_standard_normal(&mut rng);
                    fresh[group * q + 1] = draw[layout.group_scale(1)]
                        * rho.mul_add(z0, rho.mul_add(-rho, 1.0).max(0.0).sqrt() * z1);
                }
            }
        }

        let simulated = groups
            .iter()
            .enumerate()
            .map(|(row, group)| {
                let mut mean = row_dot(&fixed_design, row, beta);
                for term in 0..q {
                    let effect = match group {
                        GroupRef::Known(code) => draw[layout.group_effect(*code, term)],
                        GroupRef::Unseen(code) => fresh[*code * q + term],
                    };
                    mean = random_design[(row, term)].mul_add(effect, mean);
                }
                sigma.mul_add(sample_standard_normal(&mut rng), mean)
            })
            .collect();
        draws.push(simulated);
    }

    Ok(PredictiveSampleSet {
        draw_indices,
        draws,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mixed::spec::{RandomStructure, Term};
    use crate::utils::{mean, sample_variance};
    use approx::assert_relative_eq;

    fn intercept_layout() -> ParameterLayout {
        ParameterLayout::new(
            vec![Term::Intercept, Term::covariate("age")],
            &RandomStructure::Intercept,
            "county",
            vec!["a".to_string(), "b".to_string()],
        )
    }

    fn constant_posterior(draw: Vec<f64>, copies: usize, names: Vec<String>) -> PosteriorSampleSet {
        use crate::inference::{AdaptationInfo, Chain, DrawStats};
        let stats = DrawStats {
            step_size: 0.1,
            tree_depth: 1,
            n_leapfrog: 1,
            divergent: false,
            accept_stat: 1.0,
            energy: 0.0,
            log_density: 0.0,
        };
        let chain = Chain {
            chain_id: 0,
            seed: 0,
            draws: vec![draw; copies],
            stats: vec![stats; copies],
            adaptation: AdaptationInfo {
                step_size: 0.1,
                inverse_metric: Vec::new(),
            },
        };
        PosteriorSampleSet::from_chains(&[chain], names)
    }

    #[test]
    fn known_and_unseen_groups_are_simulated() {
        let layout = intercept_layout();
        // b_Intercept, b_age, sigma, sd, r[a], r[b]
        let draw = vec![10.0, 2.0, 0.5, 3.0, -4.0, 4.0];
        let posterior = constant_posterior(draw, 4_000, layout.names());
        let data = PredictionData::new(
            vec![("age".to_string(), vec![1.0, 1.0, 0.0])],
            &["a", "b", "new"],
        )
        .expect("prediction data should build");

        let predictive =
            simulate_posterior_predictive(&layout, &posterior, &data, &PredictiveOptions::default())
                .expect("simulation should run");
        assert_eq!(predictive.len(), 4_000);

        let known_a = predictive.row(0);
        let known_b = predictive.row(1);
        let unseen = predictive.row(2);
        assert_relative_eq!(mean(&known_a), 8.0, epsilon = 0.05);
        assert_relative_eq!(mean(&known_b), 16.0, epsilon = 0.05);
        let unseen_mean = mean(&unseen);
        assert_relative_eq!(unseen_mean, 10.0, epsilon = 0.3);
        assert_relative_eq!(
            sample_variance(&unseen, unseen_mean),
            9.0 + 0.25,
            max_relative = 0.1
        );
    }

    #[test]
    fn subsampling_is_without_replacement_and_seeded() {
        let layout = intercept_layout();
        let posterior = constant_posterior(vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0], 50, layout.names());
        let data = PredictionData::new(vec![("age".to_string(), vec![0.0])], &["a"])
            .expect("prediction data should build");
        let options = PredictiveOptions {
            draws: Some(20),
            seed: 3,
        };
        let first = simulate_posterior_predictive(&layout, &posterior, &data, &options)
            .expect("simulation should run");
        let second = simulate_posterior_predictive(&layout, &posterior, &data, &options)
            .expect("simulation should run");
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
        let mut unique = first.draw_indices.clone();
        unique.dedup();
        assert_eq!(unique.len(), 20);
        assert!(first.draw_indices.iter().all(|index| *index < 50));

        let too_many = simulate_posterior_predictive(
            &layout,
            &posterior,
            &data,
            &PredictiveOptions {
                draws: Some(51),
                seed: 3,
            },
        );
        assert!(matches!(
            too_many,
            Err(ModelError::InvalidPredictiveDraws {
                requested: 51,
                available: 50
            })
        ));
    }

    #[test]
    fn predictive_check_counts_exceedances() {
        let predictive = PredictiveSampleSet {
            draw_indices: vec![0, 1, 2, 3],
            draws: vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]],
        };
        let check = predictive_check(&[2.5], &predictive, |values| values[0]);
        assert_relative_eq!(check.observed, 2.5);
        assert_eq!(check.replicated, vec![1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(check.p_value, 0.5);
    }

    #[test]
    fn prediction_data_is_validated() {
        let mismatch = PredictionData::new(vec![("age".to_string(), vec![0.0])], &["a", "b"]);
        assert!(matches!(mismatch, Err(InputError::LengthMismatch { .. })));
        let empty = PredictionData::new::<&str>(Vec::new(), &[]);
        assert!(matches!(empty, Err(InputError::Empty)));
    }
}
