//! The binned histogram that every analysis stage reads from.
//!
//! A [`Spectrum`] is a persistent value: rebinning, re-expressing the axis in energy
//! units or subtracting a background spectrum all produce a new [`Spectrum`] and leave
//! the receiver untouched.
use std::ops::Range;

use num_traits::ToPrimitive;
use thiserror::Error;

/// The physical meaning of a spectrum's x axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AxisDomain {
    /// Raw acquisition channels
    #[default]
    Channel,
    /// Calibrated energy, usually keV
    Energy,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpectrumError {
    #[error("A spectrum needs at least {needed} bins, found {found}")]
    TooFewBins { needed: usize, found: usize },
    #[error("The axis range [{low}, {high}] is empty")]
    EmptyRange { low: f64, high: f64 },
    #[error("Cannot combine spectra with {0} and {1} bins")]
    IncompatibleBinning(usize, usize),
    #[error("An axis transformation must be increasing, the slope was {0}")]
    NonIncreasingAxis(f64),
    #[error("Cannot combine {0} channels into one bin")]
    InvalidRebin(usize),
}

/// A histogram of counts over uniformly spaced bins.
///
/// Bin `i` covers `[low + i * width, low + (i + 1) * width)` and its center is
/// the midpoint of that interval, so bin centers are strictly increasing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Spectrum {
    low: f64,
    width: f64,
    counts: Vec<f64>,
    domain: AxisDomain,
    units_per_channel: f64,
}

impl Spectrum {
    pub fn new(low: f64, width: f64, counts: Vec<f64>) -> Result<Self, SpectrumError> {
        if counts.is_empty() {
            return Err(SpectrumError::TooFewBins {
                needed: 1,
                found: 0,
            });
        }
        if !(width.is_finite() && width > 0.0) || !low.is_finite() {
            return Err(SpectrumError::EmptyRange {
                low,
                high: low + width * counts.len() as f64,
            });
        }
        Ok(Self {
            low,
            width,
            counts,
            domain: AxisDomain::Channel,
            units_per_channel: 1.0,
        })
    }

    /// Build a spectrum from any numeric count type, e.g. integer channel contents.
    /// Values that cannot be represented as `f64` are stored as zero.
    pub fn from_counts<T: ToPrimitive>(
        low: f64,
        width: f64,
        counts: &[T],
    ) -> Result<Self, SpectrumError> {
        let counts = counts
            .iter()
            .map(|c| c.to_f64().unwrap_or_default())
            .collect();
        Self::new(low, width, counts)
    }

    /// Build a spectrum from `(x, count)` pairs as they appear in a spectrum file.
    ///
    /// The histogram spans `[first x, last x]` with one bin per pair. Each pair is
    /// filled into the bin containing its x; the last x sits on the upper edge and is
    /// clamped into the final bin. Counts are stored as absolute values.
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self, SpectrumError> {
        if pairs.len() < 2 {
            return Err(SpectrumError::TooFewBins {
                needed: 2,
                found: pairs.len(),
            });
        }
        let low = pairs[0].0;
        let high = pairs[pairs.len() - 1].0;
        if !(high > low) {
            return Err(SpectrumError::EmptyRange { low, high });
        }
        let n = pairs.len();
        let width = (high - low) / n as f64;
        let mut counts = vec![0.0; n];
        for (x, y) in pairs.iter().copied() {
            if let Some(i) = bin_of(low, width, n, x) {
                counts[i] += y.abs();
            }
        }
        Self::new(low, width, counts)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.low + self.width * self.counts.len() as f64
    }

    pub fn bin_width(&self) -> f64 {
        self.width
    }

    pub fn domain(&self) -> AxisDomain {
        self.domain
    }

    /// How many x-axis units one raw channel spans. This is 1 on the channel axis
    /// and the calibration slope once the axis has been expressed in energy.
    pub fn units_per_channel(&self) -> f64 {
        self.units_per_channel
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// The content of bin `i`, or zero outside the histogram
    pub fn count(&self, i: usize) -> f64 {
        self.counts.get(i).copied().unwrap_or_default()
    }

    pub fn center(&self, i: usize) -> f64 {
        self.low + (i as f64 + 0.5) * self.width
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, c)| (self.center(i), *c))
    }

    /// The bin containing `x`, if `x` lies inside the histogram. The upper edge is
    /// counted as part of the final bin.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        bin_of(self.low, self.width, self.counts.len(), x)
    }

    /// Signed bin index for `x`, not clamped to the histogram. Useful for walking
    /// outward from a position that may lie past either edge.
    pub fn raw_bin(&self, x: f64) -> isize {
        ((x - self.low) / self.width).floor() as isize
    }

    /// The bins whose centers lie in `[min, max]`
    pub fn bins_between(&self, min: f64, max: f64) -> Range<usize> {
        let lo = (0..self.len())
            .find(|i| self.center(*i) >= min)
            .unwrap_or(self.len());
        let hi = (lo..self.len())
            .find(|i| self.center(*i) > max)
            .unwrap_or(self.len());
        lo..hi
    }

    /// Combine every `factor` adjacent channels into one bin over the same axis range.
    /// The new contents are filled by bin center and scaled by `1 / factor`, so they
    /// stay in counts-per-original-channel.
    pub fn rebin(&self, factor: usize) -> Result<Self, SpectrumError> {
        if factor == 0 {
            return Err(SpectrumError::InvalidRebin(factor));
        }
        if factor == 1 {
            return Ok(self.clone());
        }
        let n = self.len() / factor;
        if n == 0 {
            return Err(SpectrumError::TooFewBins {
                needed: factor,
                found: self.len(),
            });
        }
        let width = (self.high() - self.low) / n as f64;
        let mut counts = vec![0.0; n];
        for (x, y) in self.iter() {
            if let Some(i) = bin_of(self.low, width, n, x) {
                counts[i] += y;
            }
        }
        let scale = 1.0 / factor as f64;
        counts.iter_mut().for_each(|c| *c *= scale);
        Ok(Self {
            low: self.low,
            width,
            counts,
            domain: self.domain,
            units_per_channel: self.units_per_channel,
        })
    }

    /// Bin-wise `self - other`, with negative differences clamped to zero.
    pub fn subtract_clamped(&self, other: &Spectrum) -> Result<Self, SpectrumError> {
        if self.len() != other.len() {
            return Err(SpectrumError::IncompatibleBinning(self.len(), other.len()));
        }
        let counts = self
            .counts
            .iter()
            .zip(other.counts.iter())
            .map(|(a, b)| (a - b).max(0.0))
            .collect();
        Ok(Self {
            counts,
            ..self.clone()
        })
    }

    /// Re-express the axis through `x' = slope * x + intercept`, keeping the contents.
    pub fn map_axis(
        &self,
        slope: f64,
        intercept: f64,
        domain: AxisDomain,
    ) -> Result<Self, SpectrumError> {
        if !(slope.is_finite() && slope > 0.0) {
            return Err(SpectrumError::NonIncreasingAxis(slope));
        }
        Ok(Self {
            low: self.low * slope + intercept,
            width: self.width * slope,
            counts: self.counts.clone(),
            domain,
            units_per_channel: self.units_per_channel * slope,
        })
    }
}

fn bin_of(low: f64, width: f64, n: usize, x: f64) -> Option<usize> {
    let high = low + width * n as f64;
    if x.is_nan() || x < low || x > high {
        return None;
    }
    let i = ((x - low) / width).floor() as usize;
    Some(i.min(n - 1))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test_log::test]
    fn test_from_pairs() {
        let pairs: Vec<(f64, f64)> = (0..8).map(|i| (i as f64, -(i as f64) * 2.0)).collect();
        let spec = Spectrum::from_pairs(&pairs).unwrap();
        assert_eq!(spec.len(), 8);
        assert_eq!(spec.low(), 0.0);
        assert!((spec.high() - 7.0).abs() < 1e-12);
        let total: f64 = spec.counts().iter().sum();
        assert!((total - 56.0).abs() < 1e-9);
        assert!(spec.counts().iter().all(|c| *c >= 0.0));
        assert_eq!(spec.count(7), 14.0);
    }

    #[test]
    fn test_from_pairs_rejects_degenerate_range() {
        assert!(matches!(
            Spectrum::from_pairs(&[(1.0, 2.0)]),
            Err(SpectrumError::TooFewBins { .. })
        ));
        assert!(matches!(
            Spectrum::from_pairs(&[(1.0, 2.0), (1.0, 3.0)]),
            Err(SpectrumError::EmptyRange { .. })
        ));
    }

    #[test]
    fn test_find_bin_and_window() {
        let spec = Spectrum::from_counts(-0.5, 1.0, &[1u32, 2, 3, 4, 5]).unwrap();
        assert_eq!(spec.center(0), 0.0);
        assert_eq!(spec.find_bin(2.2), Some(2));
        assert_eq!(spec.find_bin(4.5), Some(4));
        assert_eq!(spec.find_bin(-1.0), None);
        assert_eq!(spec.bins_between(1.0, 3.0), 1..4);
        assert_eq!(spec.bins_between(10.0, 30.0), 5..5);
        assert_eq!(spec.raw_bin(-3.0), -3);
    }

    #[test]
    fn test_rebin_averages() {
        let spec = Spectrum::from_counts(0.0, 1.0, &[2.0, 4.0, 6.0, 8.0, 10.0, 12.0]).unwrap();
        let merged = spec.rebin(2).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.bin_width(), 2.0);
        assert_eq!(merged.counts(), &[3.0, 7.0, 11.0]);
        // the source is untouched
        assert_eq!(spec.len(), 6);
        assert!(spec.rebin(0).is_err());
    }

    #[test]
    fn test_subtract_clamped() {
        let a = Spectrum::from_counts(0.0, 1.0, &[5.0, 1.0, 3.0]).unwrap();
        let b = Spectrum::from_counts(0.0, 1.0, &[2.0, 4.0, 3.0]).unwrap();
        let d = a.subtract_clamped(&b).unwrap();
        assert_eq!(d.counts(), &[3.0, 0.0, 0.0]);
        let c = Spectrum::from_counts(0.0, 1.0, &[1.0]).unwrap();
        assert!(a.subtract_clamped(&c).is_err());
    }

    #[test]
    fn test_map_axis_round_trip() {
        let spec = Spectrum::from_counts(0.0, 1.0, &[1.0, 2.0, 3.0]).unwrap();
        let energy = spec.map_axis(0.5, 10.0, AxisDomain::Energy).unwrap();
        assert_eq!(energy.domain(), AxisDomain::Energy);
        assert_eq!(energy.low(), 10.0);
        assert_eq!(energy.bin_width(), 0.5);
        assert_eq!(energy.units_per_channel(), 0.5);
        let back = energy
            .map_axis(2.0, -20.0, AxisDomain::Channel)
            .unwrap();
        assert_eq!(back, spec);
        assert!(spec.map_axis(-1.0, 0.0, AxisDomain::Energy).is_err());
    }
}
