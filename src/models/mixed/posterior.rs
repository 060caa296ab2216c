//! Posterior draw storage, summaries, and table export.

use comfy_table::Cell;
use serde::{Deserialize, Serialize};

use crate::inference::Chain;
use crate::utils::{make_table, mean, percentile, sample_variance};

/// Post-warmup draws of every chain of one fit, in chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSampleSet {
    names: Vec<String>,
    chain_ids: Vec<usize>,
    draws: Vec<Vec<f64>>,
    draws_per_chain: usize,
}

/// One row of the exported posterior table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorRow {
    pub chain: usize,
    /// Index of the draw within its chain.
    pub iteration: usize,
    pub values: Vec<f64>,
}

/// Scalar posterior summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

impl PosteriorSampleSet {
    /// Pool chains; every chain contributes its first `min_len` draws.
    #[must_use]
    pub fn from_chains(chains: &[Chain], names: Vec<String>) -> Self {
        let draws_per_chain = chains.iter().map(Chain::len).min().unwrap_or(0);
        let mut chain_ids = Vec::with_capacity(draws_per_chain * chains.len());
        let mut draws = Vec::with_capacity(draws_per_chain * chains.len());
        for chain in chains {
            for draw in chain.draws.iter().take(draws_per_chain) {
                chain_ids.push(chain.chain_id);
                draws.push(draw.clone());
            }
        }
        Self {
            names,
            chain_ids,
            draws,
            draws_per_chain,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    #[must_use]
    pub const fn draws_per_chain(&self) -> usize {
        self.draws_per_chain
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn draws(&self) -> &[Vec<f64>] {
        &self.draws
    }

    #[must_use]
    pub fn chain_ids(&self) -> &[usize] {
        &self.chain_ids
    }

    /// All draws of the named parameter.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.names.iter().position(|candidate| candidate == name)?;
        Some(self.draws.iter().map(|draw| draw[index]).collect())
    }

    /// Table export: one row per draw with chain id and within-chain index.
    #[must_use]
    pub fn rows(&self) -> Vec<PosteriorRow> {
        self.draws
            .iter()
            .zip(&self.chain_ids)
            .enumerate()
            .map(|(index, (values, chain))| PosteriorRow {
                chain: *chain,
                iteration: index % self.draws_per_chain.max(1),
                values: values.clone(),
            })
            .collect()
    }

    /// Summaries for every parameter, in storage order.
    #[must_use]
    pub fn summarize(&self) -> Vec<ParameterSummary> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let values = self.draws.iter().map(|draw| draw[index]).collect::<Vec<_>>();
                summarize_scalar(name, &values)
            })
            .collect()
    }
}

fn summarize_scalar(name: &str, values: &[f64]) -> ParameterSummary {
    let centre = mean(values);
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    ParameterSummary {
        name: name.to_string(),
        mean: centre,
        std_dev: sample_variance(values, centre).sqrt(),
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
    }
}

/// Render parameter summaries as a text table.
#[must_use]
pub fn render_posterior_summary(summaries: &[ParameterSummary]) -> String {
    let mut table = make_table(&["parameter", "mean", "sd", "2.5%", "50%", "97.5%"]);
    for summary in summaries {
        table.add_row(vec![
            Cell::new(&summary.name),
            Cell::new(format!("{:.3}", summary.mean)),
            Cell::new(format!("{:.3}", summary.std_dev)),
            Cell::new(format!("{:.3}", summary.q025)),
            Cell::new(format!("{:.3}", summary.q50)),
            Cell::new(format!("{:.3}", summary.q975)),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{AdaptationInfo, DrawStats};
    use approx::assert_relative_eq;

    fn chain(chain_id: usize, draws: Vec<Vec<f64>>) -> Chain {
        let stats = draws
            .iter()
            .map(|_| DrawStats {
                step_size: 0.1,
                tree_depth: 2,
                n_leapfrog: 3,
                divergent: false,
                accept_stat: 0.9,
                energy: 1.0,
                log_density: -1.0,
            })
            .collect();
        Chain {
            chain_id,
            seed: 0,
            draws,
            stats,
            adaptation: AdaptationInfo {
                step_size: 0.1,
                inverse_metric: vec![1.0, 1.0],
            },
        }
    }

    fn samples() -> PosteriorSampleSet {
        PosteriorSampleSet::from_chains(
            &[
                chain(0, vec![vec![1.0, 10.0], vec![2.0, 20.0]]),
                chain(1, vec![vec![3.0, 30.0], vec![4.0, 40.0], vec![5.0, 50.0]]),
            ],
            vec!["b_Intercept".to_string(), "sigma".to_string()],
        )
    }

    #[test]
    fn chains_contribute_equal_draws_in_order() {
        let samples = samples();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples.draws_per_chain(), 2);
        assert_eq!(samples.chain_ids(), &[0, 0, 1, 1]);
        assert_eq!(samples.column("sigma"), Some(vec![10.0, 20.0, 30.0, 40.0]));
        assert_eq!(samples.column("missing"), None);

        let rows = samples.rows();
        assert_eq!(rows[3].chain, 1);
        assert_eq!(rows[3].iteration, 1);
        assert_eq!(rows[3].values, vec![4.0, 40.0]);
    }

    #[test]
    fn summaries_report_moments_and_quantiles() {
        let summaries = samples().summarize();
        assert_eq!(summaries[0].name, "b_Intercept");
        assert_relative_eq!(summaries[0].mean, 2.5);
        assert_relative_eq!(summaries[0].q50, 2.5);
        assert_relative_eq!(summaries[1].std_dev, (500.0_f64 / 3.0).sqrt(), epsilon = 1e-12);

        let rendered = render_posterior_summary(&summaries);
        assert!(rendered.contains("b_Intercept"));
        assert!(rendered.contains("97.5%"));
    }

    #[test]
    fn empty_chain_list_yields_empty_set() {
        let samples = PosteriorSampleSet::from_chains(&[], vec!["sigma".to_string()]);
        assert!(samples.is_empty());
        assert!(samples.rows().is_empty());
    }
}
