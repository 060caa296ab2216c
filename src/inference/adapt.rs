//! Warmup adaptation for NUTS: dual-averaging step size, Welford diagonal
//! metric estimation, and the windowed warmup schedule.
//!
//! The schedule splits warmup into an initial fast buffer (step size only), a
//! run of doubling slow windows (step size plus metric, the metric updated at
//! the end of each window), and a terminal fast buffer.
//! ```text
//! warmup = 1000:
//!   0..75      fast
//!   75..100    slow (25)
//!   100..150   slow (50)
//!   150..250   slow (100)
//!   250..450   slow (200)
//!   450..950   slow (500, stretched to the terminal buffer)
//!   950..1000  fast
//! ```

use rand::rngs::StdRng;

use super::LogDensity;
use super::hamiltonian::{PhasePoint, leapfrog};
use crate::utils::usize_to_f64;

const INIT_BUFFER: usize = 75;
const TERM_BUFFER: usize = 50;
const BASE_WINDOW: usize = 25;
const MIN_STEP_SIZE: f64 = 1.0e-10;
const MAX_STEP_SIZE: f64 = 1.0e3;
const MAX_STEP_SIZE_SEARCH: usize = 100;

/// Nesterov dual averaging of `log ε` towards a target mean acceptance statistic.
#[derive(Debug, Clone)]
pub struct DualAveraging {
    target: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    counter: usize,
    s_bar: f64,
    x_bar: f64,
    step_size: f64,
}

impl DualAveraging {
    #[must_use]
    pub fn new(target: f64, step_size: f64) -> Self {
        Self {
            target,
            mu: (10.0 * step_size).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            counter: 0,
            s_bar: 0.0,
            x_bar: 0.0,
            step_size,
        }
    }

    /// Feed one transition's acceptance statistic and move the step size.
    pub fn update(&mut self, accept_stat: f64) {
        self.counter += 1;
        let accept_stat = if accept_stat.is_nan() {
            0.0
        } else {
            accept_stat.min(1.0)
        };
        let t = usize_to_f64(self.counter);
        let eta = 1.0 / (t + self.t0);
        self.s_bar = (1.0 - eta).mul_add(self.s_bar, eta * (self.target - accept_stat));
        let x = self.mu - self.s_bar * t.sqrt() / self.gamma;
        let x_eta = t.powf(-self.kappa);
        self.x_bar = (1.0 - x_eta).mul_add(self.x_bar, x_eta * x);
        self.step_size = x.exp().clamp(MIN_STEP_SIZE, MAX_STEP_SIZE);
    }

    /// Step size to use for the next transition during warmup.
    #[must_use]
    pub const fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Averaged step size used after warmup.
    #[must_use]
    pub fn final_step_size(&self) -> f64 {
        if self.counter == 0 {
            return self.step_size;
        }
        self.x_bar.exp().clamp(MIN_STEP_SIZE, MAX_STEP_SIZE)
    }

    /// Start a new averaging run around `step_size`.
    pub fn restart(&mut self, step_size: f64) {
        self.step_size = step_size;
        self.mu = (10.0 * step_size).ln();
        self.counter = 0;
        self.s_bar = 0.0;
        self.x_bar = 0.0;
    }
}

/// Online per-coordinate mean and variance.
#[derive(Debug, Clone)]
pub struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn add_sample(&mut self, sample: &[f64]) {
        self.count += 1;
        let n = usize_to_f64(self.count);
        for ((mean, m2), value) in self.mean.iter_mut().zip(&mut self.m2).zip(sample) {
            let delta = value - *mean;
            *mean += delta / n;
            *m2 += delta * (value - *mean);
        }
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Variance shrunk towards `1e-3`, weighted by the number of samples.
    ///
    /// Returns `None` with fewer than two samples.
    #[must_use]
    pub fn regularized_variance(&self) -> Option<Vec<f64>> {
        if self.count < 2 {
            return None;
        }
        let n = usize_to_f64(self.count);
        Some(
            self.m2
                .iter()
                .map(|m2| {
                    let variance = m2 / (n - 1.0);
                    (n / (n + 5.0)).mul_add(variance, 1.0e-3 * (5.0 / (n + 5.0)))
                })
                .collect(),
        )
    }

    pub fn restart(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Iteration bookkeeping for windowed metric adaptation.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    num_warmup: usize,
    init_buffer: usize,
    term_buffer: usize,
    window_size: usize,
    window_end: usize,
    counter: usize,
    adapt_metric: bool,
}

impl WarmupSchedule {
    #[must_use]
    pub fn new(num_warmup: usize) -> Self {
        let (init_buffer, term_buffer, base_window) =
            if INIT_BUFFER + BASE_WINDOW + TERM_BUFFER > num_warmup {
                let init = num_warmup * 15 / 100;
                let term = num_warmup / 10;
                (init, term, num_warmup.saturating_sub(init + term))
            } else {
                (INIT_BUFFER, TERM_BUFFER, BASE_WINDOW)
            };
        let adapt_metric = num_warmup >= 20 && base_window > 0;
        Self {
            num_warmup,
            init_buffer,
            term_buffer,
            window_size: base_window,
            window_end: (init_buffer + base_window).saturating_sub(1),
            counter: 0,
            adapt_metric,
        }
    }

    /// Whether the current iteration falls inside a slow window.
    #[must_use]
    pub const fn in_slow_window(&self) -> bool {
        self.adapt_metric
            && self.counter >= self.init_buffer
            && self.counter + self.term_buffer < self.num_warmup
    }

    /// Whether the current iteration closes a slow window.
    #[must_use]
    pub const fn ends_slow_window(&self) -> bool {
        self.adapt_metric && self.counter == self.window_end && self.counter != self.num_warmup
    }

    fn last_window_end(&self) -> usize {
        self.num_warmup
            .saturating_sub(self.term_buffer)
            .saturating_sub(1)
    }

    fn advance_window(&mut self) {
        let last = self.last_window_end();
        if self.window_end == last {
            return;
        }
        self.window_size *= 2;
        self.window_end = self.counter + self.window_size;
        if self.window_end != last {
            let next_boundary = self.window_end + 2 * self.window_size;
            if next_boundary >= self.num_warmup.saturating_sub(self.term_buffer) {
                self.window_end = last;
            }
        }
    }

    /// Move to the next iteration; returns `true` if a slow window just closed.
    pub fn step(&mut self) -> bool {
        let closed = self.ends_slow_window();
        if closed {
            self.advance_window();
        }
        self.counter += 1;
        closed
    }
}

/// Combined step size and metric adaptation driven by the warmup schedule.
#[derive(Debug, Clone)]
pub struct WindowedAdaptation {
    step_size: DualAveraging,
    variance: WelfordVariance,
    schedule: WarmupSchedule,
    inverse_metric: Vec<f64>,
}

impl WindowedAdaptation {
    #[must_use]
    pub fn new(dim: usize, num_warmup: usize, target: f64, step_size: f64) -> Self {
        Self {
            step_size: DualAveraging::new(target, step_size),
            variance: WelfordVariance::new(dim),
            schedule: WarmupSchedule::new(num_warmup),
            inverse_metric: vec![1.0; dim],
        }
    }

    /// Learn from one warmup transition.
    ///
    /// Returns `true` when the metric was replaced; the caller must then re-run
    /// the step size heuristic and call [`Self::restart_step_size`].
    pub fn update(&mut self, position: &[f64], accept_stat: f64) -> bool {
        self.step_size.update(accept_stat);
        if self.schedule.in_slow_window() {
            self.variance.add_sample(position);
        }
        let closed = self.schedule.step();
        if closed {
            if let Some(variance) = self.variance.regularized_variance() {
                self.inverse_metric = variance;
            }
            self.variance.restart();
        }
        closed
    }

    pub fn restart_step_size(&mut self, step_size: f64) {
        self.step_size.restart(step_size);
    }

    #[must_use]
    pub const fn step_size(&self) -> f64 {
        self.step_size.step_size()
    }

    #[must_use]
    pub fn final_step_size(&self) -> f64 {
        self.step_size.final_step_size()
    }

    #[must_use]
    pub fn inverse_metric(&self) -> &[f64] {
        &self.inverse_metric
    }
}

/// Double or halve `step_size` until a single leapfrog step crosses an
/// acceptance probability of 0.8.
pub fn find_reasonable_step_size<T: LogDensity + ?Sized>(
    target: &T,
    start: &PhasePoint,
    step_size: f64,
    inverse_metric: &[f64],
    rng: &mut StdRng,
) -> f64 {
    let threshold = 0.8_f64.ln();
    let mut step_size = step_size.clamp(MIN_STEP_SIZE, MAX_STEP_SIZE);

    let trial = |step_size: f64, rng: &mut StdRng| {
        let mut point = start.clone();
        point.resample_momentum(rng, inverse_metric);
        let h0 = point.hamiltonian(inverse_metric);
        leapfrog(target, &mut point, step_size, inverse_metric);
        h0 - point.hamiltonian(inverse_metric)
    };

    let delta = trial(step_size, rng);
    let increase = delta > threshold;

    for _ in 0..MAX_STEP_SIZE_SEARCH {
        let delta = trial(step_size, rng);
        if increase && !(delta > threshold) {
            break;
        }
        if !increase && !(delta < threshold) {
            break;
        }
        step_size = if increase {
            step_size * 2.0
        } else {
            step_size * 0.5
        };
        if !(MIN_STEP_SIZE..=MAX_STEP_SIZE).contains(&step_size) {
            break;
        }
    }

    step_size.clamp(MIN_STEP_SIZE, MAX_STEP_SIZE)
}
