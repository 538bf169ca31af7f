//! Least squares machinery and the peak-shape fits built on it.
//!
//! A fit always runs on a working copy of the window's samples: the background line
//! is removed from those samples before the Gaussian fit and the source
//! [`Spectrum`](crate::spectrum::Spectrum) is never modified.
use thiserror::Error;

pub mod background;
pub mod gaussian;
pub mod linear;
pub mod lm;

pub use background::{BackgroundLine, BackgroundModel};
pub use gaussian::{GaussianComponent, GaussianFit, MultiGaussianFitter, MAX_PEAKS};
pub use linear::{polyfit, LinearFit};
pub use lm::{FitModel, FitOutcome, LevenbergMarquardt};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("The fit window [{min}, {max}] contains no bins")]
    EmptyWindow { min: f64, max: f64 },
    #[error("Cannot fit {0} peaks, the peak count must be between 1 and {max}", max = MAX_PEAKS)]
    InvalidPeakCount(usize),
    #[error("The fit needs at least {needed} points, found {found}")]
    TooFewPoints { needed: usize, found: usize },
    #[error("The x and y samples differ in length ({0} != {1})")]
    MismatchedSamples(usize, usize),
}

/// The active analysis region and the flank width used for background estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Window {
    pub min: f64,
    pub max: f64,
    /// Number of bins sampled on each side of the window for the background line
    pub border_length: usize,
}

impl Window {
    pub fn new(min: f64, max: f64, border_length: usize) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            border_length,
        }
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn contains(&self, x: f64) -> bool {
        self.min <= x && x <= self.max
    }

    /// Apply `x' = slope * x + intercept` to both edges
    pub fn map(&self, slope: f64, intercept: f64) -> Self {
        Self::new(
            self.min * slope + intercept,
            self.max * slope + intercept,
            self.border_length,
        )
    }
}

/// Weights for a least squares fit from per-point uncertainties: `1 / sigma^2` when
/// every uncertainty is positive, otherwise `None` meaning unit weights.
pub fn inverse_variance_weights(uncertainties: &[f64]) -> Option<Vec<f64>> {
    if uncertainties.is_empty() || uncertainties.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
        None
    } else {
        Some(uncertainties.iter().map(|s| 1.0 / (s * s)).collect())
    }
}
