/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Model comparison by expected log predictive density (PSIS-LOO).
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Model comparison
//!
//! Ranks models by `elpd_loo` and reports each model's difference to the best
//! one, with the standard error computed from pointwise differences. Models are
//! comparable only when their LOO results cover the same observations in the
//! same order.

use comfy_table::{Attribute, Cell, Color};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loo::LooResult;
use crate::utils::{make_table, mean, sample_variance, usize_to_f64};

/// Errors returned by the comparison workflow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComparisonError {
    #[error("at least two models are required; found {found}")]
    TooFewModels { found: usize },
    #[error("model name `{name}` is used more than once")]
    DuplicateName { name: String },
    #[error("models `{first}` and `{second}` are incomparable: {reason}")]
    IncomparableModels {
        first: String,
        second: String,
        reason: String,
    },
}

/// One model's line in the comparison table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub model: String,
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    /// `elpd_loo - best elpd_loo`; zero for the best model.
    pub elpd_diff: f64,
    pub se_diff: f64,
    pub p_loo: f64,
    pub looic: f64,
    /// Observations with Pareto k at or above the unreliable threshold.
    pub n_unreliable: usize,
}

/// Models ranked by descending `elpd_loo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonTable {
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonTable {
    /// Highest-ranked model.
    #[must_use]
    pub fn best(&self) -> Option<&ComparisonRow> {
        self.rows.first()
    }

    #[must_use]
    pub fn row(&self, model: &str) -> Option<&ComparisonRow> {
        self.rows.iter().find(|row| row.model == model)
    }
}

/// Elementwise `first - second` of pointwise elpd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointwiseDifference {
    pub first: String,
    pub second: String,
    pub differences: Vec<f64>,
    pub elpd_diff: f64,
    pub se_diff: f64,
}

fn check_comparable(
    first: (&str, &LooResult),
    second: (&str, &LooResult),
) -> Result<(), ComparisonError> {
    let incomparable = |reason: String| ComparisonError::IncomparableModels {
        first: first.0.to_string(),
        second: second.0.to_string(),
        reason,
    };
    if first.1.n_obs() != second.1.n_obs() {
        return Err(incomparable(format!(
            "{} vs {} observations",
            first.1.n_obs(),
            second.1.n_obs()
        )));
    }
    if let (Some(a), Some(b)) = (first.1.data_fingerprint, second.1.data_fingerprint) {
        if a != b {
            return Err(incomparable(
                "computed on different data or observation order".to_string(),
            ));
        }
    }
    Ok(())
}

/// Pointwise difference of two models' LOO results.
///
/// # Errors
///
/// Returns `ComparisonError::IncomparableModels` if the results cover different
/// observations.
pub fn pointwise_elpd_difference(
    first: (&str, &LooResult),
    second: (&str, &LooResult),
) -> Result<PointwiseDifference, ComparisonError> {
    check_comparable(first, second)?;
    let differences = first
        .1
        .pointwise_elpd
        .iter()
        .zip(&second.1.pointwise_elpd)
        .map(|(a, b)| a - b)
        .collect::<Vec<_>>();
    let n = usize_to_f64(differences.len());
    let se_diff = (n * sample_variance(&differences, mean(&differences))).sqrt();
    Ok(PointwiseDifference {
        first: first.0.to_string(),
        second: second.0.to_string(),
        elpd_diff: differences.iter().sum(),
        se_diff,
        differences,
    })
}

/// Rank models by `elpd_loo`.
///
/// # Errors
///
/// Returns `ComparisonError` for fewer than two models, repeated names, or results
/// that do not cover the same observations.
pub fn compare_models(models: &[(&str, &LooResult)]) -> Result<ComparisonTable, ComparisonError> {
    if models.len() < 2 {
        return Err(ComparisonError::TooFewModels {
            found: models.len(),
        });
    }
    for (index, (name, _)) in models.iter().enumerate() {
        if models[..index].iter().any(|(other, _)| other == name) {
            return Err(ComparisonError::DuplicateName {
                name: (*name).to_string(),
            });
        }
    }
    for pair in models.windows(2) {
        check_comparable(pair[0], pair[1])?;
    }

    let mut ranked = models.to_vec();
    ranked.sort_by(|a, b| b.1.elpd_loo.total_cmp(&a.1.elpd_loo));
    let best = ranked[0];

    let rows = ranked
        .iter()
        .map(|&(name, loo)| {
            let (elpd_diff, se_diff) = if name == best.0 {
                (0.0, 0.0)
            } else {
                let diff = pointwise_elpd_difference((name, loo), best)?;
                (diff.elpd_diff, diff.se_diff)
            };
            Ok(ComparisonRow {
                model: name.to_string(),
                elpd_loo: loo.elpd_loo,
                se_elpd_loo: loo.se_elpd_loo,
                elpd_diff,
                se_diff,
                p_loo: loo.p_loo,
                looic: loo.looic,
                n_unreliable: loo.k_counts.bad,
            })
        })
        .collect::<Result<Vec<_>, ComparisonError>>()?;

    log::info!(
        "compared {} models; best is `{}` (elpd_loo {:.2})",
        rows.len(),
        best.0,
        best.1.elpd_loo
    );
    Ok(ComparisonTable { rows })
}

/// Render a comparison table using `comfy_table`; the best elpd is highlighted.
#[must_use]
pub fn render_comparison_table(table: &ComparisonTable) -> String {
    let mut rendered = make_table(&[
        "model",
        "elpd_loo",
        "se",
        "elpd_diff",
        "se_diff",
        "p_loo",
        "looic",
        "k >= 0.7",
    ]);
    let best = table.best().map_or(f64::NAN, |row| row.elpd_loo);
    for row in &table.rows {
        rendered.add_row(vec![
            Cell::new(&row.model),
            highlight_metric_cell(row.elpd_loo, best, 2),
            Cell::new(format!("{:.2}", row.se_elpd_loo)),
            Cell::new(format!("{:.2}", row.elpd_diff)),
            Cell::new(format!("{:.2}", row.se_diff)),
            Cell::new(format!("{:.2}", row.p_loo)),
            Cell::new(format!("{:.2}", row.looic)),
            Cell::new(row.n_unreliable),
        ]);
    }
    rendered.to_string()
}

fn highlight_metric_cell(value: f64, best: f64, precision: usize) -> Cell {
    let is_best = (value - best).abs() < 1e-12;
    if is_best {
        Cell::new(format!("{value:.precision$}"))
            .fg(Color::Green)
            .add_attribute(Attribute::Bold)
    } else {
        Cell::new(format!("{value:.precision$}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loo::{LooOptions, PointwiseLogLikelihood, psis_loo};
    use approx::assert_abs_diff_eq;

    fn loo(shift: f64, fingerprint: u64) -> LooResult {
        let rows = (0..200_i32)
            .map(|draw| {
                (0..12_i32)
                    .map(|obs| {
                        let jitter = 0.05 * (f64::from(draw) * 0.7 + f64::from(obs)).sin();
                        -1.0 - shift - 0.1 * f64::from(obs % 3) + jitter
                    })
                    .collect()
            })
            .collect::<Vec<Vec<f64>>>();
        let matrix = PointwiseLogLikelihood::from_draws(&rows)
            .expect("matrix should build")
            .with_data_fingerprint(fingerprint);
        psis_loo(&matrix, &LooOptions::default()).expect("loo should run")
    }

    #[test]
    fn models_are_ranked_by_elpd() {
        let good = loo(0.0, 1);
        let bad = loo(0.5, 1);
        let table = compare_models(&[("bad", &bad), ("good", &good)]).expect("comparison");
        assert_eq!(table.rows[0].model, "good");
        assert_abs_diff_eq!(table.rows[0].elpd_diff, 0.0);
        assert_abs_diff_eq!(table.rows[1].elpd_diff, -6.0, epsilon = 1e-6);
        assert_eq!(table.best().map(|row| row.model.as_str()), Some("good"));

        let rendered = render_comparison_table(&table);
        assert!(rendered.contains("elpd_diff"));
        assert!(rendered.contains("good"));
    }

    #[test]
    fn self_comparison_has_zero_difference() {
        let result = loo(0.2, 9);
        let diff = pointwise_elpd_difference(("a", &result), ("b", &result)).expect("comparison");
        assert!(diff.differences.iter().all(|value| *value == 0.0));
        assert_abs_diff_eq!(diff.elpd_diff, 0.0);
        assert_abs_diff_eq!(diff.se_diff, 0.0);
    }

    #[test]
    fn mismatched_results_are_incomparable() {
        let first = loo(0.0, 1);
        let other_data = loo(0.0, 2);
        assert!(matches!(
            compare_models(&[("a", &first), ("b", &other_data)]),
            Err(ComparisonError::IncomparableModels { .. })
        ));

        let mut shorter = first.clone();
        shorter.pointwise_elpd.pop();
        assert!(matches!(
            pointwise_elpd_difference(("a", &first), ("b", &shorter)),
            Err(ComparisonError::IncomparableModels { .. })
        ));
    }

    #[test]
    fn model_list_is_validated() {
        let result = loo(0.0, 1);
        assert_eq!(
            compare_models(&[("only", &result)]),
            Err(ComparisonError::TooFewModels { found: 1 })
        );
        assert_eq!(
            compare_models(&[("same", &result), ("same", &result)]),
            Err(ComparisonError::DuplicateName {
                name: "same".to_string()
            })
        );
    }
}
