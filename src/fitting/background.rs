use log::{debug, warn};

use super::{linear::LinearFit, Window};
use crate::spectrum::Spectrum;

/// A first degree polynomial describing the continuum under a peak window.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackgroundLine {
    pub slope: f64,
    pub intercept: f64,
}

impl BackgroundLine {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    /// The samples of `spectrum` inside `window` with this line removed, as `(x, y)` columns.
    pub fn subtract_from(&self, spectrum: &Spectrum, window: &Window) -> (Vec<f64>, Vec<f64>) {
        spectrum
            .bins_between(window.min, window.max)
            .map(|i| {
                let x = spectrum.center(i);
                (x, spectrum.count(i) - self.eval(x))
            })
            .unzip()
    }
}

/// Estimates the continuum under a window from the bins flanking it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackgroundModel;

impl BackgroundModel {
    /// The flank samples: `border_length` bins walking left from the bin holding
    /// `window.min` and `border_length` bins walking right from the bin holding
    /// `window.max`. Bins past either end of the spectrum are skipped.
    pub fn samples(spectrum: &Spectrum, window: &Window) -> (Vec<f64>, Vec<f64>) {
        let n = spectrum.len() as isize;
        let left = spectrum.raw_bin(window.min);
        let right = spectrum.raw_bin(window.max);
        let border = window.border_length as isize;

        let left_side = (0..border).map(|i| left - i);
        let right_side = (0..border).map(|i| right + i);
        left_side
            .chain(right_side)
            .filter(|i| (0..n).contains(i))
            .map(|i| {
                let i = i as usize;
                (spectrum.center(i), spectrum.count(i))
            })
            .unzip()
    }

    /// Fit the background line for `window`. With no usable flank bins the
    /// background is taken to be zero; a single bin gives a flat line.
    pub fn fit(spectrum: &Spectrum, window: &Window) -> BackgroundLine {
        let (xs, ys) = Self::samples(spectrum, window);
        if xs.len() < 2 * window.border_length {
            debug!(
                "Background for [{}, {}] uses {} of {} flank bins",
                window.min,
                window.max,
                xs.len(),
                2 * window.border_length
            );
        }
        match LinearFit::fit(&xs, &ys) {
            Ok(fit) => BackgroundLine::new(fit.slope, fit.intercept),
            Err(e) => {
                if window.border_length > 0 {
                    warn!("No background estimate for [{}, {}]: {e}", window.min, window.max);
                }
                BackgroundLine::default()
            }
        }
    }
}
