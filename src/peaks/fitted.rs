/// The ratio between a Gaussian's full width at half maximum and its standard
/// deviation, rounded the way the reported widths are.
pub const FWHM_PER_SIGMA: f64 = 2.35;

/// A single fitted peak component, reported in the units of the spectrum it was
/// fitted on.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FittedPeak {
    pub position: f64,
    pub fwhm: f64,
    /// Background-subtracted counts under the fitted curve within the window
    pub integral: f64,
    /// Counting uncertainty of `integral`
    pub integral_uncertainty: f64,
}

impl FittedPeak {
    pub fn new(position: f64, fwhm: f64, integral: f64) -> Self {
        Self {
            position,
            fwhm,
            integral,
            integral_uncertainty: integral.max(0.0).sqrt(),
        }
    }

    #[inline]
    pub fn sigma(&self) -> f64 {
        self.fwhm / FWHM_PER_SIGMA
    }
}
