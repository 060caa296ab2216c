//! Log posterior of the Gaussian mixed model on the unconstrained scale.
//!
//! Unconstrained layout: fixed effects `β`, `ln σ`, `ln τ_k` per random term, the
//! correlation on the `atanh` scale when two terms vary, then standard-normal group
//! innovations `z` (group-major). Group effects are `u_g = diag(τ) L z_g` with `L`
//! the Cholesky factor of the correlation matrix. Constrained draws share the
//! layout and hold `σ`, `τ`, `ρ` and `u` in place of their unconstrained values.

use faer::Mat;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use super::likelihood::{design_matrix, gaussian_log_likelihood, log_tanh_jacobian, row_dot};
use super::priors::Prior;
use super::spec::{ModelSpec, ParameterClass, RandomStructure, SpecError, Term};
use crate::inference::LogDensity;
use crate::input::Dataset;
use crate::utils::{least_squares, mean, usize_to_f64};

const OLS_RIDGE: f64 = 1.0e-8;
const MIN_INITIAL_SCALE: f64 = 1.0e-3;

/// Index map for the parameter vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterLayout {
    fixed_terms: Vec<Term>,
    random_terms: Vec<Term>,
    grouping_factor: String,
    group_labels: Vec<String>,
}

impl ParameterLayout {
    #[must_use]
    pub fn new(
        fixed_terms: Vec<Term>,
        structure: &RandomStructure,
        grouping_factor: impl Into<String>,
        group_labels: Vec<String>,
    ) -> Self {
        Self {
            fixed_terms,
            random_terms: structure.terms(),
            grouping_factor: grouping_factor.into(),
            group_labels,
        }
    }

    #[must_use]
    pub fn fixed_terms(&self) -> &[Term] {
        &self.fixed_terms
    }

    #[must_use]
    pub fn random_terms(&self) -> &[Term] {
        &self.random_terms
    }

    #[must_use]
    pub fn group_labels(&self) -> &[String] {
        &self.group_labels
    }

    #[must_use]
    pub const fn n_fixed(&self) -> usize {
        self.fixed_terms.len()
    }

    #[must_use]
    pub const fn n_random(&self) -> usize {
        self.random_terms.len()
    }

    #[must_use]
    pub const fn n_groups(&self) -> usize {
        self.group_labels.len()
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.group_effects_offset() + self.n_groups() * self.n_random()
    }

    #[must_use]
    pub const fn sigma(&self) -> usize {
        self.n_fixed()
    }

    #[must_use]
    pub const fn group_scale(&self, term: usize) -> usize {
        self.n_fixed() + 1 + term
    }

    #[must_use]
    pub const fn correlation(&self) -> Option<usize> {
        if self.n_random() == 2 {
            Some(self.n_fixed() + 1 + self.n_random())
        } else {
            None
        }
    }

    #[must_use]
    pub const fn group_effect(&self, group: usize, term: usize) -> usize {
        self.group_effects_offset() + group * self.n_random() + term
    }

    const fn group_effects_offset(&self) -> usize {
        let correlation = if self.n_random() == 2 { 1 } else { 0 };
        self.n_fixed() + 1 + self.n_random() + correlation
    }

    /// Parameter names in storage order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let group = &self.grouping_factor;
        let mut names = self
            .fixed_terms
            .iter()
            .map(|term| format!("b_{term}"))
            .collect::<Vec<_>>();
        names.push("sigma".to_string());
        names.extend(
            self.random_terms
                .iter()
                .map(|term| format!("sd_{group}__{term}")),
        );
        if let [first, second] = self.random_terms.as_slice() {
            names.push(format!("cor_{group}__{first}__{second}"));
        }
        for label in &self.group_labels {
            for term in &self.random_terms {
                names.push(format!("r_{group}[{label},{term}]"));
            }
        }
        names
    }

    /// Position of a named parameter.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names().iter().position(|candidate| candidate == name)
    }
}

#[derive(Debug, Clone)]
struct ResolvedPriors {
    fixed: Vec<Prior>,
    residual_scale: Prior,
    group_scale: Option<Prior>,
    correlation: Option<Prior>,
}

impl ResolvedPriors {
    fn from_spec(spec: &ModelSpec, structure: &RandomStructure) -> Result<Self, SpecError> {
        let lookup = |class: ParameterClass| spec.prior(class).ok_or(SpecError::MissingPrior { class });
        Ok(Self {
            fixed: spec
                .fixed_terms()
                .iter()
                .map(|term| lookup(term.coefficient_class()))
                .collect::<Result<_, _>>()?,
            residual_scale: lookup(ParameterClass::ResidualScale)?,
            group_scale: (structure.dimension() > 0)
                .then(|| lookup(ParameterClass::GroupScale))
                .transpose()?,
            correlation: (structure.dimension() == 2)
                .then(|| lookup(ParameterClass::GroupCorrelation))
                .transpose()?,
        })
    }
}

/// Log posterior of one model on one dataset.
#[derive(Debug, Clone)]
pub struct MixedModelDensity {
    layout: ParameterLayout,
    response: Vec<f64>,
    fixed_design: Mat<f64>,
    random_design: Mat<f64>,
    group_codes: Vec<usize>,
    priors: ResolvedPriors,
}

impl MixedModelDensity {
    /// # Errors
    ///
    /// Returns `SpecError` if the specification is invalid for `dataset`.
    pub fn new(dataset: &Dataset, spec: &ModelSpec) -> Result<Self, SpecError> {
        let structure = spec.validate_for(dataset)?;
        let layout = ParameterLayout::new(
            spec.fixed_terms().to_vec(),
            &structure,
            spec.grouping_factor(),
            if structure == RandomStructure::None {
                Vec::new()
            } else {
                dataset.groups().labels().to_vec()
            },
        );
        let fixed_design = design_matrix(
            layout.fixed_terms(),
            dataset.covariates(),
            dataset.covariate_names(),
        )?;
        let random_design = design_matrix(
            layout.random_terms(),
            dataset.covariates(),
            dataset.covariate_names(),
        )?;

        Ok(Self {
            priors: ResolvedPriors::from_spec(spec, &structure)?,
            layout,
            response: dataset.response().to_vec(),
            fixed_design,
            random_design,
            group_codes: dataset.groups().codes().to_vec(),
        })
    }

    #[must_use]
    pub const fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    #[must_use]
    pub fn response(&self) -> &[f64] {
        &self.response
    }

    /// Least-squares fixed effects, log residual SD, zero group innovations.
    #[must_use]
    pub fn initial_position(&self) -> Vec<f64> {
        let layout = &self.layout;
        let p = layout.n_fixed();
        let beta = least_squares(&self.fixed_design, &self.response, OLS_RIDGE)
            .filter(|beta| beta.iter().all(|value| value.is_finite()))
            .unwrap_or_else(|| {
                let mut fallback = vec![0.0; p];
                if let Some(intercept) = layout
                    .fixed_terms()
                    .iter()
                    .position(|term| *term == Term::Intercept)
                {
                    fallback[intercept] = mean(&self.response);
                }
                fallback
            });

        let sum_sq = (0..self.response.len())
            .map(|row| {
                let residual = self.response[row] - row_dot(&self.fixed_design, row, &beta);
                residual * residual
            })
            .sum::<f64>();
        let dof = usize_to_f64(self.response.len().saturating_sub(p).max(1));
        let residual_sd = (sum_sq / dof).sqrt().max(MIN_INITIAL_SCALE);

        let mut position = vec![0.0; layout.dim()];
        position[..p].copy_from_slice(&beta);
        position[layout.sigma()] = residual_sd.ln();
        for term in 0..layout.n_random() {
            position[layout.group_scale(term)] = (0.5 * residual_sd).ln();
        }
        position
    }

    /// Conditional mean of every training observation under a constrained draw.
    #[must_use]
    pub fn fitted_means(&self, draw: &[f64]) -> Vec<f64> {
        let layout = &self.layout;
        let beta = &draw[..layout.n_fixed()];
        let q = layout.n_random();
        (0..self.response.len())
            .map(|row| {
                let group = self.group_codes[row];
                (0..q).fold(row_dot(&self.fixed_design, row, beta), |acc, term| {
                    self.random_design[(row, term)]
                        .mul_add(draw[layout.group_effect(group, term)], acc)
                })
            })
            .collect()
    }

    /// Log likelihood of each training observation under a constrained draw.
    #[must_use]
    pub fn pointwise_log_likelihood(&self, draw: &[f64]) -> Vec<f64> {
        let sigma = draw[self.layout.sigma()];
        self.fitted_means(draw)
            .iter()
            .zip(&self.response)
            .map(|(mean, outcome)| gaussian_log_likelihood(*outcome, *mean, sigma))
            .collect()
    }

    fn group_effects(&self, position: &[f64], scales: &[f64], rho: f64, rho_sd: f64) -> Vec<f64> {
        let layout = &self.layout;
        let q = layout.n_random();
        let mut effects = vec![0.0; layout.n_groups() * q];
        for group in 0..layout.n_groups() {
            let z0 = position[layout.group_effect(group, 0)];
            effects[group * q] = scales[0] * z0;
            if q == 2 {
                let z1 = position[layout.group_effect(group, 1)];
                effects[group * q + 1] = scales[1] * rho.mul_add(z0, rho_sd * z1);
            }
        }
        effects
    }
}

impl LogDensity for MixedModelDensity {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn log_density_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        let layout = &self.layout;
        let p = layout.n_fixed();
        let q = layout.n_random();
        let n_groups = layout.n_groups();
        gradient.fill(0.0);

        let beta = &position[..p];
        let log_sigma = position[layout.sigma()];
        let sigma = log_sigma.exp();
        let scales = (0..q)
            .map(|term| position[layout.group_scale(term)].exp())
            .collect::<Vec<_>>();
        let atanh_rho = layout.correlation().map_or(0.0, |index| position[index]);
        let rho = atanh_rho.tanh();
        let rho_sd = atanh_rho.cosh().recip();
        let effects = if q > 0 {
            self.group_effects(position, &scales, rho, rho_sd)
        } else {
            Vec::new()
        };

        let inv_var = (sigma * sigma).recip();
        let mut effect_scores = vec![0.0; effects.len()];
        let mut sum_sq = 0.0;
        for row in 0..self.response.len() {
            let group = self.group_codes.get(row).copied().unwrap_or(0);
            let eta = (0..q).fold(row_dot(&self.fixed_design, row, beta), |acc, term| {
                self.random_design[(row, term)].mul_add(effects[group * q + term], acc)
            });
            let residual = self.response[row] - eta;
            sum_sq += residual * residual;
            let score = residual * inv_var;
            for (col, slot) in gradient[..p].iter_mut().enumerate() {
                *slot += self.fixed_design[(row, col)] * score;
            }
            for term in 0..q {
                effect_scores[group * q + term] += self.random_design[(row, term)] * score;
            }
        }

        let n = usize_to_f64(self.response.len());
        let mut log_density = -n * (0.5 * TAU.ln() + log_sigma) - 0.5 * sum_sq * inv_var;
        gradient[layout.sigma()] += sum_sq.mul_add(inv_var, -n);

        for (index, prior) in self.priors.fixed.iter().enumerate() {
            let (value, derivative) = prior.log_density_and_derivative(beta[index]);
            log_density += value;
            gradient[index] += derivative;
        }

        let (value, derivative) = self.priors.residual_scale.log_density_and_derivative(sigma);
        log_density += value + log_sigma;
        gradient[layout.sigma()] += derivative.mul_add(sigma, 1.0);

        if let Some(prior) = self.priors.group_scale {
            for (term, scale) in scales.iter().enumerate() {
                let (value, derivative) = prior.log_density_and_derivative(*scale);
                log_density += value + scale.ln();
                gradient[layout.group_scale(term)] += derivative.mul_add(*scale, 1.0);
            }

            let mut rho_score = 0.0;
            for group in 0..n_groups {
                let z0 = position[layout.group_effect(group, 0)];
                let score0 = effect_scores[group * q];
                log_density -= 0.5 * z0.mul_add(z0, TAU.ln());
                gradient[layout.group_scale(0)] += score0 * effects[group * q];

                if q == 2 {
                    let z1 = position[layout.group_effect(group, 1)];
                    let score1 = effect_scores[group * q + 1];
                    log_density -= 0.5 * z1.mul_add(z1, TAU.ln());
                    gradient[layout.group_effect(group, 0)] +=
                        (score1 * scales[1]).mul_add(rho, score0 * scales[0]) - z0;
                    gradient[layout.group_effect(group, 1)] += score1 * scales[1] * rho_sd - z1;
                    gradient[layout.group_scale(1)] += score1 * effects[group * q + 1];
                    rho_score += score1 * scales[1] * (z0 - rho * z1 / rho_sd);
                } else {
                    gradient[layout.group_effect(group, 0)] += score0 * scales[0] - z0;
                }
            }

            if let (Some(index), Some(prior)) = (layout.correlation(), self.priors.correlation) {
                let (value, derivative) = prior.log_density_and_derivative(rho);
                log_density += value + log_tanh_jacobian(atanh_rho);
                gradient[index] += (rho_score + derivative)
                    .mul_add(rho_sd * rho_sd, -2.0 * rho);
            }
        }

        log_density
    }

    fn constrain(&self, position: &[f64]) -> Vec<f64> {
        let layout = &self.layout;
        let mut draw = position.to_vec();
        draw[layout.sigma()] = position[layout.sigma()].exp();
        let scales = (0..layout.n_random())
            .map(|term| position[layout.group_scale(term)].exp())
            .collect::<Vec<_>>();
        for (term, scale) in scales.iter().enumerate() {
            draw[layout.group_scale(term)] = *scale;
        }
        if let Some(index) = layout.correlation() {
            draw[index] = position[index].tanh();
        }
        if !scales.is_empty() {
            let atanh_rho = layout.correlation().map_or(0.0, |index| position[index]);
            let effects = self.group_effects(
                position,
                &scales,
                atanh_rho.tanh(),
                atanh_rho.cosh().recip(),
            );
            let offset = layout.group_effect(0, 0);
            draw[offset..offset + effects.len()].copy_from_slice(&effects);
        }
        draw
    }
}
