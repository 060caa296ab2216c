/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared linear algebra and statistics utilities for the hierarchical models.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Shared helpers for solving linear systems, computing summary statistics,
//! drawing standard normals, working with faer matrices, and laying out text tables.

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use faer::Mat;
use faer::prelude::Solve;
use num_traits::ToPrimitive;
use rand::RngExt;
use rand::rngs::StdRng;

/// Lossy `usize -> f64` conversion used for counts and indices.
#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / usize_to_f64(values.len())
}

/// Unbiased sample variance around a precomputed mean; zero for fewer than two values.
#[must_use]
pub fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values
        .iter()
        .map(|value| {
            let centered = *value - mean;
            centered * centered
        })
        .sum::<f64>()
        / usize_to_f64(values.len() - 1)
}

/// Linear-interpolated quantile of an ascending slice.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last).min(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

/// Numerically stable `log(sum(exp(values)))`.
#[must_use]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|value| (value - max).exp()).sum::<f64>().ln()
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// Solve `a x = b` with a full-pivoting LU factorisation.
///
/// Returns `None` if the solve produces non-finite values.
#[must_use]
pub fn solve_linear_system(a: &Mat<f64>, b: &Mat<f64>) -> Option<Mat<f64>> {
    let rhs = b.clone();
    let lu = a.full_piv_lu();
    let solution = lu.solve(rhs);
    matrix_is_finite(&solution).then_some(solution)
}

/// Ridge-stabilised least squares `(X'X + λI)^{-1} X'y`.
#[must_use]
pub fn least_squares(x: &Mat<f64>, y: &[f64], ridge: f64) -> Option<Vec<f64>> {
    let p = x.ncols();
    if p == 0 || x.nrows() != y.len() {
        return None;
    }
    let information = Mat::from_fn(p, p, |a, b| {
        let cross = (0..x.nrows()).map(|i| x[(i, a)] * x[(i, b)]).sum::<f64>();
        if a == b { cross + ridge } else { cross }
    });
    let rhs = Mat::from_fn(p, 1, |a, _| {
        (0..x.nrows()).map(|i| x[(i, a)] * y[i]).sum::<f64>()
    });
    let solution = solve_linear_system(&information, &rhs)?;
    Some((0..p).map(|row| solution[(row, 0)]).collect())
}

/// Box-Muller standard normal draw.
pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Condensed UTF-8 table with the given header row.
#[must_use]
pub fn make_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(*h)).collect::<Vec<_>>());
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn percentile_interpolates_between_neighbours() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(percentile(&sorted, 0.5), 3.0);
        assert_relative_eq!(percentile(&sorted, 0.125), 1.5);
        assert_relative_eq!(percentile(&sorted, 1.0), 5.0);
        assert!(percentile(&[], 0.5).is_nan());
    }

    #[test]
    fn log_sum_exp_is_stable_for_large_inputs() {
        let values = [1000.0, 1000.0];
        assert_relative_eq!(log_sum_exp(&values), 1000.0 + 2.0_f64.ln(), epsilon = 1e-12);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn sample_variance_is_zero_for_single_value() {
        assert_relative_eq!(sample_variance(&[3.0], 3.0), 0.0);
        assert_relative_eq!(sample_variance(&[1.0, 3.0], 2.0), 2.0);
    }

    #[test]
    fn solve_linear_system_rejects_non_finite_solution() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 });
        let b = Mat::from_fn(2, 1, |i, _| if i == 0 { f64::NAN } else { 1.0 });
        assert!(solve_linear_system(&a, &b).is_none());
    }

    #[test]
    fn least_squares_recovers_exact_line() {
        let x = Mat::from_fn(5, 2, |i, j| if j == 0 { 1.0 } else { usize_to_f64(i) });
        let y = (0..5).map(|i| 2.0 + 3.0 * usize_to_f64(i)).collect::<Vec<_>>();
        let beta = least_squares(&x, &y, 0.0).expect("least squares should solve");
        assert_relative_eq!(beta[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(beta[1], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn standard_normal_draws_have_unit_scale() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws = (0..20_000)
            .map(|_| sample_standard_normal(&mut rng))
            .collect::<Vec<_>>();
        let m = mean(&draws);
        assert!(m.abs() < 0.03);
        assert!((sample_variance(&draws, m) - 1.0).abs() < 0.05);
    }
}
