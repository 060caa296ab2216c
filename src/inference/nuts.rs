//! No-U-Turn Sampler transition.
//!
//! Multinomial NUTS: the trajectory is doubled in a random direction until it
//! turns back on itself, diverges, or reaches the maximum tree depth. Inside a
//! subtree the proposal is drawn uniformly by weight; at the top level the new
//! subtree is favoured (biased progressive sampling). The U-turn check uses the
//! generalised criterion on `rho = Σ p` and is repeated on the two overlapping
//! spans around every merge.

use rand::RngExt;
use rand::rngs::StdRng;

use super::LogDensity;
use super::hamiltonian::{PhasePoint, leapfrog};
use crate::utils::usize_to_f64;

/// Energy error above which a trajectory is declared divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Outcome of one NUTS transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub point: PhasePoint,
    pub tree_depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    pub accept_stat: f64,
    pub energy: f64,
}

/// A valid subtree, with momenta listed in integration order.
struct Subtree {
    proposal: PhasePoint,
    log_sum_weight: f64,
    rho: Vec<f64>,
    p_beg: Vec<f64>,
    p_end: Vec<f64>,
    p_sharp_beg: Vec<f64>,
    p_sharp_end: Vec<f64>,
}

struct TreeBuilder<'a, T: LogDensity + ?Sized> {
    target: &'a T,
    inverse_metric: &'a [f64],
    step_size: f64,
    initial_energy: f64,
    n_leapfrog: usize,
    sum_metro_prob: f64,
    divergent: bool,
}

impl<T: LogDensity + ?Sized> TreeBuilder<'_, T> {
    fn leaf(&mut self, point: &mut PhasePoint, direction: f64) -> Option<Subtree> {
        leapfrog(self.target, point, direction * self.step_size, self.inverse_metric);
        self.n_leapfrog += 1;

        let energy = point.hamiltonian(self.inverse_metric);
        let log_weight = self.initial_energy - energy;
        if -log_weight > DIVERGENCE_THRESHOLD {
            self.divergent = true;
        }
        self.sum_metro_prob += if log_weight > 0.0 {
            1.0
        } else {
            log_weight.exp()
        };
        if self.divergent {
            return None;
        }

        let p_sharp = point.velocity(self.inverse_metric);
        Some(Subtree {
            proposal: point.clone(),
            log_sum_weight: log_weight,
            rho: point.momentum.clone(),
            p_beg: point.momentum.clone(),
            p_end: point.momentum.clone(),
            p_sharp_beg: p_sharp.clone(),
            p_sharp_end: p_sharp,
        })
    }

    /// Extend `point` by `2^depth` leapfrog steps; `None` if the new span diverged or turned.
    fn build(
        &mut self,
        point: &mut PhasePoint,
        depth: usize,
        direction: f64,
        rng: &mut StdRng,
    ) -> Option<Subtree> {
        if depth == 0 {
            return self.leaf(point, direction);
        }

        let init = self.build(point, depth - 1, direction, rng)?;
        let last = self.build(point, depth - 1, direction, rng)?;

        let log_sum_weight = log_add_exp(init.log_sum_weight, last.log_sum_weight);
        let take_last = last.log_sum_weight > log_sum_weight
            || rng.random::<f64>() < (last.log_sum_weight - log_sum_weight).exp();
        let rho = add(&init.rho, &last.rho);

        let persistent = merge_is_persistent(
            &init.p_sharp_beg,
            &init.p_sharp_end,
            &init.p_end,
            &init.rho,
            &last,
            &rho,
        );
        if !persistent {
            return None;
        }

        Some(Subtree {
            proposal: if take_last {
                last.proposal
            } else {
                init.proposal
            },
            log_sum_weight,
            rho,
            p_beg: init.p_beg,
            p_end: last.p_end,
            p_sharp_beg: init.p_sharp_beg,
            p_sharp_end: last.p_sharp_end,
        })
    }
}

/// Run one NUTS transition from `current`.
pub fn transition<T: LogDensity + ?Sized>(
    target: &T,
    current: &PhasePoint,
    step_size: f64,
    inverse_metric: &[f64],
    max_tree_depth: usize,
    rng: &mut StdRng,
) -> Transition {
    let mut start = current.clone();
    start.resample_momentum(rng, inverse_metric);
    let initial_energy = start.hamiltonian(inverse_metric);

    let mut builder = TreeBuilder {
        target,
        inverse_metric,
        step_size,
        initial_energy,
        n_leapfrog: 0,
        sum_metro_prob: 0.0,
        divergent: false,
    };

    let mut rho = start.momentum.clone();
    let mut log_sum_weight = 0.0;
    let mut sample = start.clone();
    let mut forward_end = start.clone();
    let mut backward_end = start;
    let mut depth = 0;

    while depth < max_tree_depth {
        let forward = rng.random::<f64>() > 0.5;
        let (edge, opposite, direction) = if forward {
            (&mut forward_end, &backward_end, 1.0)
        } else {
            (&mut backward_end, &forward_end, -1.0)
        };
        let adjacent_p = edge.momentum.clone();
        let adjacent_p_sharp = edge.velocity(inverse_metric);

        let Some(subtree) = builder.build(edge, depth, direction, rng) else {
            break;
        };
        depth += 1;

        if subtree.log_sum_weight > log_sum_weight
            || rng.random::<f64>() < (subtree.log_sum_weight - log_sum_weight).exp()
        {
            sample = subtree.proposal.clone();
        }
        log_sum_weight = log_add_exp(log_sum_weight, subtree.log_sum_weight);

        let merged_rho = add(&rho, &subtree.rho);
        let persistent = merge_is_persistent(
            &opposite.velocity(inverse_metric),
            &adjacent_p_sharp,
            &adjacent_p,
            &rho,
            &subtree,
            &merged_rho,
        );
        rho = merged_rho;
        if !persistent {
            break;
        }
    }

    let n_leapfrog = builder.n_leapfrog.max(1);
    let accept_stat = builder.sum_metro_prob / usize_to_f64(n_leapfrog);
    let energy = sample.hamiltonian(inverse_metric);

    Transition {
        point: sample,
        tree_depth: depth,
        n_leapfrog,
        divergent: builder.divergent,
        accept_stat,
        energy,
    }
}

/// Generalised no-U-turn checks for an existing span merged with a new subtree.
///
/// `outer_p_sharp` is the far end of the existing span, `adjacent_*` its end touching
/// the new subtree. Checks the full span and both overlapping spans that straddle
/// the junction.
fn merge_is_persistent(
    outer_p_sharp: &[f64],
    adjacent_p_sharp: &[f64],
    adjacent_p: &[f64],
    existing_rho: &[f64],
    subtree: &Subtree,
    merged_rho: &[f64],
) -> bool {
    no_u_turn(outer_p_sharp, &subtree.p_sharp_end, merged_rho)
        && no_u_turn(
            outer_p_sharp,
            &subtree.p_sharp_beg,
            &add(existing_rho, &subtree.p_beg),
        )
        && no_u_turn(
            adjacent_p_sharp,
            &subtree.p_sharp_end,
            &add(&subtree.rho, adjacent_p),
        )
}

fn no_u_turn(p_sharp_a: &[f64], p_sharp_b: &[f64], rho: &[f64]) -> bool {
    dot(p_sharp_a, rho) > 0.0 && dot(p_sharp_b, rho) > 0.0
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}
