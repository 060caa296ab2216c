//! Gaussian likelihood and design-matrix helpers for the mixed model.

use faer::Mat;

use super::priors::log_normal_density;
use super::spec::{SpecError, Term};

/// Design matrix for `terms` over a covariate table (intercept columns are ones).
///
/// # Errors
///
/// Returns `SpecError::UnknownCovariate` if a term names a missing covariate.
pub fn design_matrix(
    terms: &[Term],
    covariates: &Mat<f64>,
    names: &[String],
) -> Result<Mat<f64>, SpecError> {
    let columns = terms
        .iter()
        .map(|term| match term {
            Term::Intercept => Ok(None),
            Term::Covariate(name) => names
                .iter()
                .position(|candidate| candidate == name)
                .map(Some)
                .ok_or_else(|| SpecError::UnknownCovariate { name: name.clone() }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Mat::from_fn(covariates.nrows(), terms.len(), |row, col| {
        columns[col].map_or(1.0, |source| covariates[(row, source)])
    }))
}

/// `matrix[row, ..] · coefficients`.
#[must_use]
pub fn row_dot(matrix: &Mat<f64>, row: usize, coefficients: &[f64]) -> f64 {
    coefficients
        .iter()
        .enumerate()
        .map(|(col, coefficient)| matrix[(row, col)] * coefficient)
        .sum()
}

/// Log likelihood of one observation.
#[must_use]
pub fn gaussian_log_likelihood(outcome: f64, mean: f64, sd: f64) -> f64 {
    if !(sd > 0.0 && sd.is_finite()) {
        return f64::NEG_INFINITY;
    }
    log_normal_density(outcome, mean, sd)
}

/// Stable `ln(1 - tanh(a)^2)`, the log-Jacobian of `rho = tanh(a)`.
#[must_use]
pub fn log_tanh_jacobian(a: f64) -> f64 {
    let magnitude = a.abs();
    2.0 * (std::f64::consts::LN_2 - magnitude - (-2.0 * magnitude).exp().ln_1p())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn design_matrix_places_intercept_and_named_columns() {
        let covariates = Mat::from_fn(3, 2, |row, col| (row * 10 + col) as f64);
        let names = vec!["a".to_string(), "b".to_string()];
        let design = design_matrix(&[Term::Intercept, Term::covariate("b")], &covariates, &names)
            .expect("design should build");
        assert_eq!(design.ncols(), 2);
        assert_relative_eq!(design[(2, 0)], 1.0);
        assert_relative_eq!(design[(2, 1)], 21.0);
        assert_relative_eq!(row_dot(&design, 1, &[2.0, 0.5]), 2.0 + 5.5);

        let missing = design_matrix(&[Term::covariate("c")], &covariates, &names);
        assert!(matches!(
            missing,
            Err(SpecError::UnknownCovariate { name }) if name == "c"
        ));
    }

    #[test]
    fn tanh_jacobian_is_stable_in_the_tails() {
        for a in [-3.0, -0.2, 0.0, 0.7, 4.0] {
            let rho: f64 = f64::tanh(a);
            assert_relative_eq!(log_tanh_jacobian(a), (1.0 - rho * rho).ln(), epsilon = 1e-10);
        }
        assert!(log_tanh_jacobian(400.0).is_finite());
    }

    #[test]
    fn gaussian_likelihood_rejects_degenerate_scale() {
        assert_eq!(gaussian_log_likelihood(1.0, 0.0, 0.0), f64::NEG_INFINITY);
        assert_relative_eq!(
            gaussian_log_likelihood(0.0, 0.0, 1.0),
            -0.5 * std::f64::consts::TAU.ln()
        );
    }
}
