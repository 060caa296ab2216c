//! Declarative model specification: terms, grouping factor, priors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::priors::{Prior, Support};
use crate::input::Dataset;

/// Errors raised while validating a [`ModelSpec`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpecError {
    #[error("model `{model}` has no fixed-effect terms")]
    NoFixedTerms { model: String },
    #[error("term `{term}` is listed more than once")]
    DuplicateTerm { term: String },
    #[error("random term `{term}` is not among the fixed terms")]
    RandomTermNotFixed { term: String },
    #[error("unsupported random-effect structure: {terms:?}")]
    UnsupportedRandomStructure { terms: Vec<String> },
    #[error("no prior given for parameter class {class}")]
    MissingPrior { class: ParameterClass },
    #[error("prior {prior} cannot be used for parameter class {class}")]
    IncompatiblePrior { class: ParameterClass, prior: Prior },
    #[error("prior {prior} for parameter class {class} has invalid hyperparameters")]
    InvalidHyperparameters { class: ParameterClass, prior: Prior },
    #[error("grouping factor `{expected}` does not match the dataset's `{found}`")]
    UnknownGroupingFactor { expected: String, found: String },
    #[error("covariate `{name}` is not present in the dataset")]
    UnknownCovariate { name: String },
}

/// One regression term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Intercept,
    Covariate(String),
}

impl Term {
    #[must_use]
    pub fn covariate(name: impl Into<String>) -> Self {
        Self::Covariate(name.into())
    }

    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Intercept => "Intercept",
            Self::Covariate(name) => name,
        }
    }

    /// Prior class of the fixed coefficient attached to this term.
    #[must_use]
    pub const fn coefficient_class(&self) -> ParameterClass {
        match self {
            Self::Intercept => ParameterClass::Intercept,
            Self::Covariate(_) => ParameterClass::Slope,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermKind {
    FixedOnly,
    FixedAndRandom,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ParameterClass {
    Intercept,
    Slope,
    ResidualScale,
    GroupScale,
    GroupCorrelation,
}

impl ParameterClass {
    #[must_use]
    pub const fn support(self) -> Support {
        match self {
            Self::Intercept | Self::Slope => Support::Real,
            Self::ResidualScale | Self::GroupScale => Support::Positive,
            Self::GroupCorrelation => Support::Correlation,
        }
    }
}

impl fmt::Display for ParameterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Intercept => "intercept",
            Self::Slope => "slope",
            Self::ResidualScale => "residual scale",
            Self::GroupScale => "group scale",
            Self::GroupCorrelation => "group correlation",
        };
        f.write_str(name)
    }
}

/// Group-level structure implied by the random terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RandomStructure {
    None,
    Intercept,
    /// Correlated intercept and slope on the named covariate.
    InterceptAndSlope(String),
}

impl RandomStructure {
    /// Group-level effects per group.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Intercept => 1,
            Self::InterceptAndSlope(_) => 2,
        }
    }

    /// Random terms in storage order.
    #[must_use]
    pub fn terms(&self) -> Vec<Term> {
        match self {
            Self::None => Vec::new(),
            Self::Intercept => vec![Term::Intercept],
            Self::InterceptAndSlope(name) => vec![Term::Intercept, Term::covariate(name)],
        }
    }
}

/// Gaussian mixed-model specification with a single grouping factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    name: String,
    fixed_terms: Vec<Term>,
    random_terms: Vec<Term>,
    grouping_factor: String,
    priors: BTreeMap<ParameterClass, Prior>,
}

impl ModelSpec {
    /// Empty specification; add terms and priors with the builder methods.
    #[must_use]
    pub fn new(name: impl Into<String>, grouping_factor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixed_terms: Vec::new(),
            random_terms: Vec::new(),
            grouping_factor: grouping_factor.into(),
            priors: BTreeMap::new(),
        }
    }

    /// Intercept plus fixed slopes, no group-level effects.
    #[must_use]
    pub fn pooled(
        name: impl Into<String>,
        grouping_factor: impl Into<String>,
        covariates: &[&str],
    ) -> Self {
        covariates.iter().fold(
            Self::new(name, grouping_factor).with_term(Term::Intercept, TermKind::FixedOnly),
            |spec, covariate| spec.with_term(Term::covariate(*covariate), TermKind::FixedOnly),
        )
    }

    /// Intercept varying by group plus fixed slopes.
    #[must_use]
    pub fn varying_intercept(
        name: impl Into<String>,
        grouping_factor: impl Into<String>,
        covariates: &[&str],
    ) -> Self {
        covariates.iter().fold(
            Self::new(name, grouping_factor).with_term(Term::Intercept, TermKind::FixedAndRandom),
            |spec, covariate| spec.with_term(Term::covariate(*covariate), TermKind::FixedOnly),
        )
    }

    /// Intercept and the slope on `random_slope` varying by group, with correlation.
    ///
    /// `random_slope` is added as a fixed term if it is not among `covariates`.
    #[must_use]
    pub fn varying_intercept_and_slope(
        name: impl Into<String>,
        grouping_factor: impl Into<String>,
        covariates: &[&str],
        random_slope: &str,
    ) -> Self {
        let mut spec =
            Self::new(name, grouping_factor).with_term(Term::Intercept, TermKind::FixedAndRandom);
        if !covariates.contains(&random_slope) {
            spec = spec.with_term(Term::covariate(random_slope), TermKind::FixedAndRandom);
        }
        covariates.iter().fold(spec, |spec, covariate| {
            let kind = if *covariate == random_slope {
                TermKind::FixedAndRandom
            } else {
                TermKind::FixedOnly
            };
            spec.with_term(Term::covariate(*covariate), kind)
        })
    }

    #[must_use]
    pub fn with_term(mut self, term: Term, kind: TermKind) -> Self {
        if kind == TermKind::FixedAndRandom {
            self.random_terms.push(term.clone());
        }
        self.fixed_terms.push(term);
        self
    }

    /// Add a group-level term without touching the fixed terms.
    #[must_use]
    pub fn with_random_term(mut self, term: Term) -> Self {
        self.random_terms.push(term);
        self
    }

    /// Set the prior for a parameter class, replacing any previous one.
    #[must_use]
    pub fn with_prior(mut self, class: ParameterClass, prior: Prior) -> Self {
        self.priors.insert(class, prior);
        self
    }

    /// Fill every class without a prior with a weakly-informative default scaled to the data.
    ///
    /// Intercept: Student-t(3) centred on the response mean. Slopes: normal(0) with a
    /// scale of 2.5 response SDs per covariate SD. Scales: half-Student-t(3) with
    /// scale 2.5 response SDs. Correlation: LKJ(2).
    #[must_use]
    pub fn with_default_priors(mut self, dataset: &Dataset) -> Self {
        let response_sd = dataset.response_sd();
        let covariate_sd = (0..dataset.covariates().ncols())
            .map(|col| {
                let values = (0..dataset.n_obs())
                    .map(|row| dataset.covariates()[(row, col)])
                    .collect::<Vec<_>>();
                let centre = crate::utils::mean(&values);
                crate::utils::sample_variance(&values, centre).sqrt()
            })
            .fold(f64::INFINITY, f64::min);
        let slope_sd = if covariate_sd.is_finite() && covariate_sd > 0.0 {
            2.5 * response_sd / covariate_sd
        } else {
            2.5 * response_sd
        };

        let defaults = [
            (
                ParameterClass::Intercept,
                Prior::StudentT {
                    df: 3.0,
                    location: dataset.response_mean(),
                    scale: 2.5 * response_sd,
                },
            ),
            (
                ParameterClass::Slope,
                Prior::Normal {
                    mean: 0.0,
                    sd: slope_sd,
                },
            ),
            (
                ParameterClass::ResidualScale,
                Prior::HalfStudentT {
                    df: 3.0,
                    scale: 2.5 * response_sd,
                },
            ),
            (
                ParameterClass::GroupScale,
                Prior::HalfStudentT {
                    df: 3.0,
                    scale: 2.5 * response_sd,
                },
            ),
            (ParameterClass::GroupCorrelation, Prior::Lkj { eta: 2.0 }),
        ];
        for (class, prior) in defaults {
            self.priors.entry(class).or_insert(prior);
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
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
    pub fn grouping_factor(&self) -> &str {
        &self.grouping_factor
    }

    #[must_use]
    pub fn prior(&self, class: ParameterClass) -> Option<Prior> {
        self.priors.get(&class).copied()
    }

    /// Fixed terms tagged with whether they also vary by group.
    #[must_use]
    pub fn terms(&self) -> Vec<(Term, TermKind)> {
        self.fixed_terms
            .iter()
            .map(|term| {
                let kind = if self.random_terms.contains(term) {
                    TermKind::FixedAndRandom
                } else {
                    TermKind::FixedOnly
                };
                (term.clone(), kind)
            })
            .collect()
    }

    /// Parameter classes the likelihood refers to.
    #[must_use]
    pub fn required_classes(&self) -> Vec<ParameterClass> {
        let mut classes = Vec::new();
        if self.fixed_terms.contains(&Term::Intercept) {
            classes.push(ParameterClass::Intercept);
        }
        if self
            .fixed_terms
            .iter()
            .any(|term| matches!(term, Term::Covariate(_)))
        {
            classes.push(ParameterClass::Slope);
        }
        classes.push(ParameterClass::ResidualScale);
        if !self.random_terms.is_empty() {
            classes.push(ParameterClass::GroupScale);
        }
        if self.random_terms.len() == 2 {
            classes.push(ParameterClass::GroupCorrelation);
        }
        classes
    }

    /// Validate terms and priors; returns the group-level structure.
    ///
    /// # Errors
    ///
    /// Returns `SpecError` for duplicate or missing terms, random terms outside the
    /// fixed terms, unsupported random structures, or missing/invalid priors.
    pub fn validate(&self) -> Result<RandomStructure, SpecError> {
        if self.fixed_terms.is_empty() {
            return Err(SpecError::NoFixedTerms {
                model: self.name.clone(),
            });
        }
        for (index, term) in self.fixed_terms.iter().enumerate() {
            if self.fixed_terms[..index].contains(term) {
                return Err(SpecError::DuplicateTerm {
                    term: term.label().to_string(),
                });
            }
        }
        for (index, term) in self.random_terms.iter().enumerate() {
            if self.random_terms[..index].contains(term) {
                return Err(SpecError::DuplicateTerm {
                    term: term.label().to_string(),
                });
            }
            if !self.fixed_terms.contains(term) {
                return Err(SpecError::RandomTermNotFixed {
                    term: term.label().to_string(),
                });
            }
        }

        let structure = self.random_structure()?;

        for class in self.required_classes() {
            let prior = self
                .prior(class)
                .ok_or(SpecError::MissingPrior { class })?;
            if prior.support() != class.support() {
                return Err(SpecError::IncompatiblePrior { class, prior });
            }
            if !prior.is_valid() {
                return Err(SpecError::InvalidHyperparameters { class, prior });
            }
        }
        Ok(structure)
    }

    /// Validate against a dataset: covariates must exist and the grouping factor match.
    ///
    /// # Errors
    ///
    /// Returns `SpecError` as [`ModelSpec::validate`], plus unknown covariates or a
    /// grouping factor that differs from the dataset's.
    pub fn validate_for(&self, dataset: &Dataset) -> Result<RandomStructure, SpecError> {
        let structure = self.validate()?;
        for term in &self.fixed_terms {
            if let Term::Covariate(name) = term {
                dataset
                    .covariate_index(name)
                    .map_err(|_| SpecError::UnknownCovariate { name: name.clone() })?;
            }
        }
        if structure != RandomStructure::None && self.grouping_factor != dataset.grouping_factor()
        {
            return Err(SpecError::UnknownGroupingFactor {
                expected: self.grouping_factor.clone(),
                found: dataset.grouping_factor().to_string(),
            });
        }
        Ok(structure)
    }

    fn random_structure(&self) -> Result<RandomStructure, SpecError> {
        let unsupported = || SpecError::UnsupportedRandomStructure {
            terms: self
                .random_terms
                .iter()
                .map(|term| term.label().to_string())
                .collect(),
        };
        match self.random_terms.as_slice() {
            [] => Ok(RandomStructure::None),
            [Term::Intercept] => Ok(RandomStructure::Intercept),
            [Term::Intercept, Term::Covariate(name)] | [Term::Covariate(name), Term::Intercept] => {
                Ok(RandomStructure::InterceptAndSlope(name.clone()))
            }
            _ => Err(unsupported()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::new(
            vec![1.0, 2.0, 3.0, 5.0],
            vec![("age".to_string(), vec![-1.0, 0.0, 1.0, 2.0])],
            "county",
            &["a", "a", "b", "b"],
        )
        .expect("dataset should build")
    }

    #[test]
    fn builders_produce_the_three_structures() {
        let data = dataset();
        let pooled = ModelSpec::pooled("pooled", "county", &["age"]).with_default_priors(&data);
        let intercept =
            ModelSpec::varying_intercept("intercept", "county", &["age"]).with_default_priors(&data);
        let slope = ModelSpec::varying_intercept_and_slope("slope", "county", &["age"], "age")
            .with_default_priors(&data);

        assert_eq!(pooled.validate_for(&data), Ok(RandomStructure::None));
        assert_eq!(intercept.validate_for(&data), Ok(RandomStructure::Intercept));
        assert_eq!(
            slope.validate_for(&data),
            Ok(RandomStructure::InterceptAndSlope("age".to_string()))
        );
        assert_eq!(slope.fixed_terms().len(), 2);
        assert_eq!(
            slope.terms()[1],
            (Term::covariate("age"), TermKind::FixedAndRandom)
        );
    }

    #[test]
    fn missing_prior_is_reported() {
        let spec = ModelSpec::varying_intercept("m", "county", &[])
            .with_prior(ParameterClass::Intercept, Prior::Normal { mean: 0.0, sd: 1.0 })
            .with_prior(ParameterClass::ResidualScale, Prior::HalfNormal { scale: 1.0 });
        assert_eq!(
            spec.validate(),
            Err(SpecError::MissingPrior {
                class: ParameterClass::GroupScale
            })
        );
    }

    #[test]
    fn prior_support_must_match_class() {
        let spec = ModelSpec::pooled("m", "county", &[])
            .with_prior(ParameterClass::Intercept, Prior::Normal { mean: 0.0, sd: 1.0 })
            .with_prior(ParameterClass::ResidualScale, Prior::Normal { mean: 0.0, sd: 1.0 });
        assert!(matches!(
            spec.validate(),
            Err(SpecError::IncompatiblePrior {
                class: ParameterClass::ResidualScale,
                ..
            })
        ));

        let invalid = ModelSpec::pooled("m", "county", &[])
            .with_prior(ParameterClass::Intercept, Prior::Normal { mean: 0.0, sd: -1.0 })
            .with_prior(ParameterClass::ResidualScale, Prior::HalfNormal { scale: 1.0 });
        assert!(matches!(
            invalid.validate(),
            Err(SpecError::InvalidHyperparameters { .. })
        ));
    }

    #[test]
    fn random_terms_must_be_fixed_and_supported() {
        let data = dataset();
        let stray = ModelSpec::pooled("m", "county", &[])
            .with_random_term(Term::covariate("age"))
            .with_default_priors(&data);
        assert_eq!(
            stray.validate(),
            Err(SpecError::RandomTermNotFixed {
                term: "age".to_string()
            })
        );

        let slope_only = ModelSpec::new("m", "county")
            .with_term(Term::Intercept, TermKind::FixedOnly)
            .with_term(Term::covariate("age"), TermKind::FixedAndRandom)
            .with_default_priors(&data);
        assert!(matches!(
            slope_only.validate(),
            Err(SpecError::UnsupportedRandomStructure { .. })
        ));
    }

    #[test]
    fn dataset_mismatches_are_rejected() {
        let data = dataset();
        let wrong_group =
            ModelSpec::varying_intercept("m", "state", &["age"]).with_default_priors(&data);
        assert!(matches!(
            wrong_group.validate_for(&data),
            Err(SpecError::UnknownGroupingFactor { .. })
        ));
        let unknown = ModelSpec::pooled("m", "county", &["income"]).with_default_priors(&data);
        assert_eq!(
            unknown.validate_for(&data),
            Err(SpecError::UnknownCovariate {
                name: "income".to_string()
            })
        );
        assert_eq!(
            ModelSpec::new("empty", "county").validate(),
            Err(SpecError::NoFixedTerms {
                model: "empty".to_string()
            })
        );
    }

    #[test]
    fn default_priors_do_not_override_explicit_ones() {
        let data = dataset();
        let explicit = Prior::Normal {
            mean: 20.0,
            sd: 10.0,
        };
        let spec = ModelSpec::pooled("m", "county", &["age"])
            .with_prior(ParameterClass::Intercept, explicit)
            .with_default_priors(&data);
        assert_eq!(spec.prior(ParameterClass::Intercept), Some(explicit));
        assert!(matches!(
            spec.prior(ParameterClass::ResidualScale),
            Some(Prior::HalfStudentT { .. })
        ));
    }
}
