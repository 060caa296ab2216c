//! # Models
//!
//! Hierarchical Gaussian regression models and a LOO-based workflow to compare
//! candidate fits.

pub mod comparison;
pub mod mixed;
