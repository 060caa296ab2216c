//! # Model inputs
//!
//! Defines the immutable observation table consumed by the hierarchical models:
//! a response column, named covariate columns stored in a faer matrix, and a
//! grouping factor whose labels are mapped to dense 0-based indices at load time.
//!
//! # Examples
//!
//! ```
//! use hierarchical_models::Dataset;
//!
//! let dataset = Dataset::new(
//!     vec![1.0, 2.0, 3.0],
//!     vec![("age".to_string(), vec![-1.0, 0.0, 1.0])],
//!     "county",
//!     &["a", "b", "a"],
//! )
//! .expect("dataset should validate");
//!
//! assert_eq!(dataset.n_obs(), 3);
//! assert_eq!(dataset.groups().n_groups(), 2);
//! assert_eq!(dataset.groups().codes(), &[0, 1, 0]);
//! ```
//!
//! ```
//! use hierarchical_models::Dataset;
//!
//! let result = Dataset::new(
//!     vec![1.0, 2.0, 3.0],
//!     vec![("age".to_string(), vec![-1.0, 0.0])],
//!     "county",
//!     &["a", "b", "a"],
//! );
//!
//! assert!(result.is_err());
//! ```

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use faer::Mat;
use thiserror::Error;

use crate::utils::{mean, sample_variance};

/// Errors returned when validating model inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("dataset must contain at least one observation")]
    Empty,
    #[error("{what} length ({found}) must match response length ({expected})")]
    LengthMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
    #[error("response contains a non-finite value at row {row}")]
    NonFiniteResponse { row: usize },
    #[error("covariate `{name}` contains a non-finite value at row {row}")]
    NonFiniteCovariate { name: String, row: usize },
    #[error("covariate `{name}` is defined more than once")]
    DuplicateCovariate { name: String },
    #[error("covariate `{name}` is not present in the dataset")]
    UnknownCovariate { name: String },
}

/// Dense mapping from group labels to contiguous 0-based indices.
///
/// Indices follow the order in which labels first appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIndex {
    labels: Vec<String>,
    codes: Vec<usize>,
    lookup: HashMap<String, usize>,
}

impl GroupIndex {
    #[must_use]
    pub fn from_labels<S: AsRef<str>>(observations: &[S]) -> Self {
        let mut labels = Vec::new();
        let mut lookup = HashMap::new();
        let codes = observations
            .iter()
            .map(|label| {
                let label = label.as_ref();
                if let Some(code) = lookup.get(label) {
                    *code
                } else {
                    let code = labels.len();
                    labels.push(label.to_string());
                    lookup.insert(label.to_string(), code);
                    code
                }
            })
            .collect();
        Self {
            labels,
            codes,
            lookup,
        }
    }

    /// Index over a fixed label order, such as the groups a model was fitted on.
    ///
    /// The result carries no observation codes.
    #[must_use]
    pub fn with_labels(labels: Vec<String>) -> Self {
        let lookup = labels
            .iter()
            .enumerate()
            .map(|(code, label)| (label.clone(), code))
            .collect();
        Self {
            labels,
            codes: Vec::new(),
            lookup,
        }
    }

    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Group code of each observation.
    #[must_use]
    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.lookup.get(label).copied()
    }
}

/// Immutable observation table for a Gaussian mixed model.
#[derive(Debug, Clone)]
pub struct Dataset {
    response: Vec<f64>,
    covariates: Mat<f64>,
    covariate_names: Vec<String>,
    grouping_factor: String,
    groups: GroupIndex,
}

impl Dataset {
    /// Build and validate a dataset from in-memory columns.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if the table is empty, column lengths differ, values are
    /// non-finite, or covariate names repeat.
    pub fn new<S: AsRef<str>>(
        response: Vec<f64>,
        covariates: Vec<(String, Vec<f64>)>,
        grouping_factor: impl Into<String>,
        group_labels: &[S],
    ) -> Result<Self, InputError> {
        let n = response.len();
        if n == 0 {
            return Err(InputError::Empty);
        }
        if let Some(row) = response.iter().position(|value| !value.is_finite()) {
            return Err(InputError::NonFiniteResponse { row });
        }
        if group_labels.len() != n {
            return Err(InputError::LengthMismatch {
                what: "group labels".to_string(),
                expected: n,
                found: group_labels.len(),
            });
        }

        let mut covariate_names: Vec<String> = Vec::with_capacity(covariates.len());
        for (name, values) in &covariates {
            if covariate_names.contains(name) {
                return Err(InputError::DuplicateCovariate { name: name.clone() });
            }
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
            covariate_names.push(name.clone());
        }

        let matrix = Mat::from_fn(n, covariates.len(), |row, col| covariates[col].1[row]);

        Ok(Self {
            response,
            covariates: matrix,
            covariate_names,
            grouping_factor: grouping_factor.into(),
            groups: GroupIndex::from_labels(group_labels),
        })
    }

    #[must_use]
    pub fn n_obs(&self) -> usize {
        self.response.len()
    }

    #[must_use]
    pub fn response(&self) -> &[f64] {
        &self.response
    }

    /// Covariates as an `n_obs x n_covariates` matrix, columns in declaration order.
    #[must_use]
    pub const fn covariates(&self) -> &Mat<f64> {
        &self.covariates
    }

    #[must_use]
    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Column index of a named covariate.
    ///
    /// # Errors
    ///
    /// Returns `InputError::UnknownCovariate` if the name is not present.
    pub fn covariate_index(&self, name: &str) -> Result<usize, InputError> {
        self.covariate_names
            .iter()
            .position(|candidate| candidate == name)
            .ok_or_else(|| InputError::UnknownCovariate {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn grouping_factor(&self) -> &str {
        &self.grouping_factor
    }

    #[must_use]
    pub const fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    #[must_use]
    pub fn response_mean(&self) -> f64 {
        mean(&self.response)
    }

    /// Sample standard deviation of the response, floored at a small positive value.
    #[must_use]
    pub fn response_sd(&self) -> f64 {
        sample_variance(&self.response, self.response_mean())
            .sqrt()
            .max(1.0e-8)
    }

    /// Content hash over the response, covariates, and group assignment.
    ///
    /// Two datasets with equal fingerprints hold the same observations in the same order.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.response.len().hash(&mut hasher);
        for value in &self.response {
            value.to_bits().hash(&mut hasher);
        }
        self.covariate_names.hash(&mut hasher);
        for col in 0..self.covariates.ncols() {
            for row in 0..self.covariates.nrows() {
                self.covariates[(row, col)].to_bits().hash(&mut hasher);
            }
        }
        self.grouping_factor.hash(&mut hasher);
        for code in self.groups.codes() {
            self.groups.labels[*code].hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covariate(name: &str, values: &[f64]) -> (String, Vec<f64>) {
        (name.to_string(), values.to_vec())
    }

    #[test]
    fn group_index_uses_first_appearance_order() {
        let index = GroupIndex::from_labels(&["north", "south", "north", "east"]);
        assert_eq!(index.labels(), &["north", "south", "east"]);
        assert_eq!(index.codes(), &[0, 1, 0, 2]);
        assert_eq!(index.index_of("east"), Some(2));
        assert_eq!(index.index_of("west"), None);
    }

    #[test]
    fn fixed_label_index_resolves_fitted_groups() {
        let index = GroupIndex::with_labels(vec!["b".to_string(), "a".to_string()]);
        assert_eq!(index.n_groups(), 2);
        assert_eq!(index.index_of("a"), Some(1));
        assert_eq!(index.index_of("c"), None);
        assert!(index.codes().is_empty());
    }

    #[test]
    fn validate_rejects_empty_dataset() {
        let err = Dataset::new(Vec::new(), Vec::new(), "g", &[] as &[&str])
            .expect_err("empty dataset should fail");
        assert_eq!(err, InputError::Empty);
    }

    #[test]
    fn validate_rejects_label_length_mismatch() {
        let err = Dataset::new(vec![1.0, 2.0], Vec::new(), "g", &["a"])
            .expect_err("label mismatch should fail");
        assert!(matches!(
            err,
            InputError::LengthMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        let err = Dataset::new(vec![1.0, f64::NAN], Vec::new(), "g", &["a", "b"])
            .expect_err("non-finite response should fail");
        assert_eq!(err, InputError::NonFiniteResponse { row: 1 });

        let err = Dataset::new(
            vec![1.0, 2.0],
            vec![covariate("x", &[0.0, f64::INFINITY])],
            "g",
            &["a", "b"],
        )
        .expect_err("non-finite covariate should fail");
        assert_eq!(
            err,
            InputError::NonFiniteCovariate {
                name: "x".to_string(),
                row: 1
            }
        );
    }

    #[test]
    fn validate_rejects_duplicate_covariates() {
        let err = Dataset::new(
            vec![1.0, 2.0],
            vec![covariate("x", &[0.0, 1.0]), covariate("x", &[1.0, 0.0])],
            "g",
            &["a", "b"],
        )
        .expect_err("duplicate covariate should fail");
        assert_eq!(
            err,
            InputError::DuplicateCovariate {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn covariate_lookup_reports_unknown_names() {
        let dataset = Dataset::new(
            vec![1.0, 2.0],
            vec![covariate("x", &[0.0, 1.0])],
            "g",
            &["a", "b"],
        )
        .expect("dataset should validate");
        assert_eq!(dataset.covariate_index("x"), Ok(0));
        assert!(matches!(
            dataset.covariate_index("age"),
            Err(InputError::UnknownCovariate { .. })
        ));
    }

    #[test]
    fn fingerprint_tracks_observation_order() {
        let a = Dataset::new(
            vec![1.0, 2.0],
            vec![covariate("x", &[0.0, 1.0])],
            "g",
            &["a", "b"],
        )
        .expect("dataset should validate");
        let same = a.clone();
        let swapped = Dataset::new(
            vec![2.0, 1.0],
            vec![covariate("x", &[1.0, 0.0])],
            "g",
            &["b", "a"],
        )
        .expect("dataset should validate");
        assert_eq!(a.fingerprint(), same.fingerprint());
        assert_ne!(a.fingerprint(), swapped.fingerprint());
    }
}
