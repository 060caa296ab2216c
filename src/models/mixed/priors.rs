//! Prior families and their log densities with derivatives.

use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::{LN_2, PI, TAU};
use std::fmt;

/// Domain a prior family is defined on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    Positive,
    /// Correlation coefficient in `(-1, 1)`.
    Correlation,
}

/// Prior distribution for one parameter class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    Normal { mean: f64, sd: f64 },
    StudentT { df: f64, location: f64, scale: f64 },
    HalfNormal { scale: f64 },
    HalfCauchy { scale: f64 },
    HalfStudentT { df: f64, scale: f64 },
    Exponential { rate: f64 },
    InverseGamma { shape: f64, scale: f64 },
    /// LKJ prior on a 2x2 correlation matrix, expressed on the off-diagonal entry.
    Lkj { eta: f64 },
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal { mean, sd } => write!(f, "normal({mean}, {sd})"),
            Self::StudentT {
                df,
                location,
                scale,
            } => write!(f, "student_t({df}, {location}, {scale})"),
            Self::HalfNormal { scale } => write!(f, "half_normal({scale})"),
            Self::HalfCauchy { scale } => write!(f, "half_cauchy({scale})"),
            Self::HalfStudentT { df, scale } => write!(f, "half_student_t({df}, {scale})"),
            Self::Exponential { rate } => write!(f, "exponential({rate})"),
            Self::InverseGamma { shape, scale } => write!(f, "inv_gamma({shape}, {scale})"),
            Self::Lkj { eta } => write!(f, "lkj({eta})"),
        }
    }
}

impl Prior {
    #[must_use]
    pub const fn support(&self) -> Support {
        match self {
            Self::Normal { .. } | Self::StudentT { .. } => Support::Real,
            Self::HalfNormal { .. }
            | Self::HalfCauchy { .. }
            | Self::HalfStudentT { .. }
            | Self::Exponential { .. }
            | Self::InverseGamma { .. } => Support::Positive,
            Self::Lkj { .. } => Support::Correlation,
        }
    }

    /// Whether all hyperparameters are finite and in range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        match *self {
            Self::Normal { mean, sd } => mean.is_finite() && positive(sd),
            Self::StudentT {
                df,
                location,
                scale,
            } => positive(df) && location.is_finite() && positive(scale),
            Self::HalfNormal { scale } | Self::HalfCauchy { scale } => positive(scale),
            Self::HalfStudentT { df, scale } => positive(df) && positive(scale),
            Self::Exponential { rate } => positive(rate),
            Self::InverseGamma { shape, scale } => positive(shape) && positive(scale),
            Self::Lkj { eta } => positive(eta),
        }
    }

    /// Log density at `value`; `-inf` outside the support.
    #[must_use]
    pub fn log_density(&self, value: f64) -> f64 {
        self.log_density_and_derivative(value).0
    }

    /// Log density and its derivative with respect to `value`.
    ///
    /// Outside the support the density is `-inf` and the derivative zero.
    #[must_use]
    pub fn log_density_and_derivative(&self, value: f64) -> (f64, f64) {
        let outside = (f64::NEG_INFINITY, 0.0);
        match *self {
            Self::Normal { mean, sd } => (
                log_normal_density(value, mean, sd),
                -(value - mean) / (sd * sd),
            ),
            Self::StudentT {
                df,
                location,
                scale,
            } => log_student_t(value, df, location, scale),
            Self::HalfNormal { scale } => {
                if value <= 0.0 {
                    return outside;
                }
                (
                    LN_2 + log_normal_density(value, 0.0, scale),
                    -value / (scale * scale),
                )
            }
            Self::HalfCauchy { scale } => {
                if value <= 0.0 {
                    return outside;
                }
                let ratio = value / scale;
                (
                    LN_2 - PI.ln() - scale.ln() - (ratio * ratio).ln_1p(),
                    -2.0 * value / value.mul_add(value, scale * scale),
                )
            }
            Self::HalfStudentT { df, scale } => {
                if value <= 0.0 {
                    return outside;
                }
                let (log_density, derivative) = log_student_t(value, df, 0.0, scale);
                (LN_2 + log_density, derivative)
            }
            Self::Exponential { rate } => {
                if value < 0.0 {
                    return outside;
                }
                (rate.ln() - rate * value, -rate)
            }
            Self::InverseGamma { shape, scale } => {
                if value <= 0.0 {
                    return outside;
                }
                (
                    log_inverse_gamma_density(value, shape, scale),
                    -(shape + 1.0) / value + scale / (value * value),
                )
            }
            Self::Lkj { eta } => {
                if !(-1.0 < value && value < 1.0) {
                    return outside;
                }
                let one_minus_sq = value.mul_add(-value, 1.0);
                let log_beta = 2.0f64.mul_add(ln_gamma(eta), -ln_gamma(2.0 * eta));
                (
                    (eta - 1.0).mul_add(one_minus_sq.ln(), -log_beta)
                        - 2.0f64.mul_add(eta, -1.0) * LN_2,
                    (eta - 1.0) * (-2.0 * value / one_minus_sq),
                )
            }
        }
    }
}

/// Log density of `Normal(mean, sd)`.
#[must_use]
pub fn log_normal_density(value: f64, mean: f64, sd: f64) -> f64 {
    if sd <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let z = (value - mean) / sd;
    -0.5 * z.mul_add(z, TAU.ln()) - sd.ln()
}

/// Log density for an inverse-gamma distribution.
#[must_use]
pub fn log_inverse_gamma_density(value: f64, shape: f64, scale: f64) -> f64 {
    if !(value > 0.0 && shape > 0.0 && scale > 0.0) {
        return f64::NEG_INFINITY;
    }

    shape.mul_add(scale.ln(), -ln_gamma(shape)) - (shape + 1.0).mul_add(value.ln(), scale / value)
}

fn log_student_t(value: f64, df: f64, location: f64, scale: f64) -> (f64, f64) {
    let z = (value - location) / scale;
    let log_density = ln_gamma(0.5 * (df + 1.0))
        - ln_gamma(0.5 * df)
        - 0.5 * (df * PI).ln()
        - scale.ln()
        - 0.5 * (df + 1.0) * (z * z / df).ln_1p();
    let derivative = -(df + 1.0) * z / (scale * z.mul_add(z, df));
    (log_density, derivative)
}
