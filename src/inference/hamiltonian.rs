//! Phase-space points and the leapfrog integrator for a diagonal Euclidean metric.
//!
//! The metric is stored as the diagonal of the inverse mass matrix, which is
//! what both the position update `q += ε M⁻¹ p` and the kinetic energy
//! `½ pᵀ M⁻¹ p` need.

use rand::rngs::StdRng;

use super::LogDensity;
use crate::utils::sample_standard_normal;

/// Position, momentum, and cached density/gradient at one point of a trajectory.
#[derive(Debug, Clone)]
pub struct PhasePoint {
    pub position: Vec<f64>,
    pub momentum: Vec<f64>,
    pub gradient: Vec<f64>,
    pub log_density: f64,
}

impl PhasePoint {
    /// Evaluate the target at `position` with zero momentum.
    pub fn new<T: LogDensity + ?Sized>(target: &T, position: Vec<f64>) -> Self {
        let mut gradient = vec![0.0; position.len()];
        let log_density = target.log_density_and_gradient(&position, &mut gradient);
        Self {
            momentum: vec![0.0; position.len()],
            position,
            gradient,
            log_density,
        }
    }

    /// Whether the density and every gradient entry are finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.log_density.is_finite() && self.gradient.iter().all(|value| value.is_finite())
    }

    #[must_use]
    pub fn kinetic_energy(&self, inverse_metric: &[f64]) -> f64 {
        0.5 * self
            .momentum
            .iter()
            .zip(inverse_metric)
            .map(|(p, m)| m * p * p)
            .sum::<f64>()
    }

    /// Total energy `-log p(q) + K(p)`; NaN is reported as `+inf`.
    #[must_use]
    pub fn hamiltonian(&self, inverse_metric: &[f64]) -> f64 {
        let energy = -self.log_density + self.kinetic_energy(inverse_metric);
        if energy.is_nan() {
            f64::INFINITY
        } else {
            energy
        }
    }

    /// Velocity `M⁻¹ p`, used by the no-U-turn criterion.
    #[must_use]
    pub fn velocity(&self, inverse_metric: &[f64]) -> Vec<f64> {
        self.momentum
            .iter()
            .zip(inverse_metric)
            .map(|(p, m)| m * p)
            .collect()
    }

    /// Draw fresh momentum `p ~ N(0, M)`.
    pub fn resample_momentum(&mut self, rng: &mut StdRng, inverse_metric: &[f64]) {
        for (p, m) in self.momentum.iter_mut().zip(inverse_metric) {
            *p = sample_standard_normal(rng) / m.sqrt();
        }
    }
}

/// One leapfrog step of signed size `step_size`.
pub fn leapfrog<T: LogDensity + ?Sized>(
    target: &T,
    point: &mut PhasePoint,
    step_size: f64,
    inverse_metric: &[f64],
) {
    let half = 0.5 * step_size;
    for (p, g) in point.momentum.iter_mut().zip(&point.gradient) {
        *p += half * g;
    }
    for ((q, p), m) in point
        .position
        .iter_mut()
        .zip(&point.momentum)
        .zip(inverse_metric)
    {
        *q += step_size * m * p;
    }
    point.log_density = target.log_density_and_gradient(&point.position, &mut point.gradient);
    for (p, g) in point.momentum.iter_mut().zip(&point.gradient) {
        *p += half * g;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    /// Independent normals with the given scales.
    pub(crate) struct DiagonalNormal {
        pub(crate) scales: Vec<f64>,
    }

    impl LogDensity for DiagonalNormal {
        fn dim(&self) -> usize {
            self.scales.len()
        }

        fn log_density_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
            let mut log_density = 0.0;
            for ((x, s), g) in position.iter().zip(&self.scales).zip(gradient.iter_mut()) {
                log_density -= 0.5 * (x / s) * (x / s);
                *g = -x / (s * s);
            }
            log_density
        }
    }

    #[test]
    fn leapfrog_nearly_conserves_energy() {
        let target = DiagonalNormal {
            scales: vec![1.0, 2.0],
        };
        let metric = [1.0, 1.0];
        let mut point = PhasePoint::new(&target, vec![0.5, -1.0]);
        point.momentum = vec![0.3, 0.7];
        let start = point.hamiltonian(&metric);
        for _ in 0..50 {
            leapfrog(&target, &mut point, 0.05, &metric);
        }
        assert!((point.hamiltonian(&metric) - start).abs() < 1.0e-3);
    }

    #[test]
    fn leapfrog_is_reversible() {
        let target = DiagonalNormal {
            scales: vec![1.0, 0.5],
        };
        let metric = [1.0, 0.25];
        let mut point = PhasePoint::new(&target, vec![0.2, 0.1]);
        point.momentum = vec![-0.4, 1.1];
        let origin = point.position.clone();
        for _ in 0..10 {
            leapfrog(&target, &mut point, 0.1, &metric);
        }
        for _ in 0..10 {
            leapfrog(&target, &mut point, -0.1, &metric);
        }
        for (a, b) in point.position.iter().zip(&origin) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn momentum_scale_follows_metric() {
        let target = DiagonalNormal { scales: vec![1.0] };
        let metric = [0.25];
        let mut point = PhasePoint::new(&target, vec![0.0]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut sum_sq = 0.0;
        for _ in 0..20_000 {
            point.resample_momentum(&mut rng, &metric);
            sum_sq += point.momentum[0] * point.momentum[0];
        }
        assert!((sum_sq / 20_000.0 - 4.0).abs() < 0.2);
    }

    #[test]
    fn nan_energy_is_treated_as_infinite() {
        let target = DiagonalNormal { scales: vec![1.0] };
        let mut point = PhasePoint::new(&target, vec![0.0]);
        point.log_density = f64::NAN;
        assert_eq!(point.hamiltonian(&[1.0]), f64::INFINITY);
        assert!(!point.is_finite());
    }
}
