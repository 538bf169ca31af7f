use log::debug;

use super::CalibrationError;
use crate::fitting::{inverse_variance_weights, LinearFit};
use crate::io::TableRow;

/// Which of a point's two uncertainties was measured; the other is derived from
/// the calibration slope on every refit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UncertaintyOrigin {
    /// Read from a calibration file
    #[default]
    Energy,
    /// The FWHM of a committed peak
    Channel,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationPoint {
    pub channel: f64,
    pub energy: f64,
    pub channel_uncertainty: f64,
    pub energy_uncertainty: f64,
    pub origin: UncertaintyOrigin,
}

impl CalibrationPoint {
    /// A point read from a calibration file, with its uncertainty in energy units
    pub fn from_energy(channel: f64, energy: f64, energy_uncertainty: f64) -> Self {
        Self {
            channel,
            energy,
            channel_uncertainty: 0.0,
            energy_uncertainty,
            origin: UncertaintyOrigin::Energy,
        }
    }

    /// A point committed from a fitted peak, with its uncertainty in channels
    pub fn from_channel(channel: f64, energy: f64, channel_uncertainty: f64) -> Self {
        Self {
            channel,
            energy,
            channel_uncertainty,
            energy_uncertainty: 0.0,
            origin: UncertaintyOrigin::Channel,
        }
    }

    fn with_model(mut self, model: &CalibrationModel) -> Self {
        match self.origin {
            UncertaintyOrigin::Energy => {
                self.channel_uncertainty = model.energy_to_channel_uncertainty(self.energy_uncertainty)
            }
            UncertaintyOrigin::Channel => {
                self.energy_uncertainty = model.channel_to_energy_uncertainty(self.channel_uncertainty)
            }
        }
        self
    }

    /// The energy uncertainty this point carries in a fit with the given slope
    fn energy_sigma(&self, slope: f64) -> f64 {
        match self.origin {
            UncertaintyOrigin::Energy => self.energy_uncertainty,
            UncertaintyOrigin::Channel => self.channel_uncertainty * slope.abs(),
        }
    }
}

/// Refits made after the unweighted starting fit, each one re-deriving the energy
/// uncertainty of channel-origin points from the previous slope
const EFFECTIVE_VARIANCE_PASSES: usize = 2;

/// `energy = slope * channel + intercept`. The slope is never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationModel {
    pub slope: f64,
    pub intercept: f64,
    pub slope_error: f64,
    pub intercept_error: f64,
}

impl CalibrationModel {
    pub fn new(slope: f64, intercept: f64) -> Result<Self, CalibrationError> {
        if slope == 0.0 || !slope.is_finite() {
            return Err(CalibrationError::ZeroSlope);
        }
        Ok(Self {
            slope,
            intercept,
            slope_error: 0.0,
            intercept_error: 0.0,
        })
    }

    #[inline]
    pub fn to_energy(&self, channel: f64) -> f64 {
        self.slope * channel + self.intercept
    }

    #[inline]
    pub fn to_channel(&self, energy: f64) -> f64 {
        (energy - self.intercept) / self.slope
    }

    #[inline]
    pub fn energy_to_channel_uncertainty(&self, energy_uncertainty: f64) -> f64 {
        energy_uncertainty / self.slope.abs()
    }

    #[inline]
    pub fn channel_to_energy_uncertainty(&self, channel_uncertainty: f64) -> f64 {
        channel_uncertainty * self.slope.abs()
    }
}

/// The accumulated calibration points, kept sorted by channel.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationSet {
    points: Vec<CalibrationPoint>,
}

impl CalibrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `(channel, energy, energy uncertainty)`
    pub fn from_rows(rows: &[TableRow]) -> Self {
        let mut set = Self::new();
        for row in rows {
            set.insert(CalibrationPoint::from_energy(row.x, row.value, row.uncertainty));
        }
        set
    }

    pub fn insert(&mut self, point: CalibrationPoint) {
        let i = self.points.partition_point(|p| p.channel <= point.channel);
        self.points.insert(i, point);
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Fit the channel to energy line by weighted least squares.
    ///
    /// File points are weighted by their energy uncertainty. Committed peaks carry a
    /// channel uncertainty, which is moved onto the energy axis with the slope of the
    /// previous pass, starting from an unweighted fit. When any point ends up with a
    /// zero uncertainty every point is weighted equally.
    pub fn fit(&self) -> Result<CalibrationModel, CalibrationError> {
        if self.points.len() < 2 {
            return Err(CalibrationError::InsufficientCalibrationPoints(
                self.points.len(),
            ));
        }
        let xs: Vec<f64> = self.points.iter().map(|p| p.channel).collect();
        let ys: Vec<f64> = self.points.iter().map(|p| p.energy).collect();
        let mut fit = LinearFit::fit(&xs, &ys)?;
        for _ in 0..EFFECTIVE_VARIANCE_PASSES {
            let sigmas: Vec<f64> = self.points.iter().map(|p| p.energy_sigma(fit.slope)).collect();
            let Some(weights) = inverse_variance_weights(&sigmas) else {
                debug!("Some calibration points have no uncertainty, fitting unweighted");
                break;
            };
            fit = LinearFit::fit_weighted(&xs, &ys, Some(weights.as_slice()))?;
        }
        let mut model = CalibrationModel::new(fit.slope, fit.intercept)?;
        model.slope_error = fit.slope_error;
        model.intercept_error = fit.intercept_error;
        debug!(
            "Energy calibration from {} points: E = {:.6} * ch + {:.4}",
            self.points.len(),
            model.slope,
            model.intercept
        );
        Ok(model)
    }

    /// Fill in each point's derived uncertainty from `model`
    pub fn with_model(&self, model: &CalibrationModel) -> Self {
        Self {
            points: self.points.iter().map(|p| p.with_model(model)).collect(),
        }
    }

    /// `energy - model(channel)` for each point, as `(channel, residual)`
    pub fn residuals(&self, model: &CalibrationModel) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|p| (p.channel, p.energy - model.to_energy(p.channel)))
            .collect()
    }

    /// Export rows of `(channel, energy, energy uncertainty)` in ascending channel order
    pub fn rows(&self) -> Vec<TableRow> {
        self.points
            .iter()
            .map(|p| TableRow::new(p.channel, p.energy, p.energy_uncertainty))
            .collect()
    }
}
