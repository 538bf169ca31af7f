use log::trace;

use super::{
    efficiency::{EfficiencyModel, EfficiencySet},
    energy::CalibrationModel,
    CalibrationError,
};
use crate::spectrum::AxisDomain;

/// A rate with its one-sigma uncertainty
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateEstimate {
    pub value: f64,
    pub uncertainty: f64,
}

impl RateEstimate {
    pub fn new(value: f64, uncertainty: f64) -> Self {
        Self { value, uncertainty }
    }
}

/// Where efficiencies come from. Both are indexed by channel.
#[derive(Debug, Clone, Copy)]
pub enum EfficiencySource<'a> {
    /// A fitted curve, contributing its residual as a systematic term
    Model(&'a EfficiencyModel),
    /// Interpolation between measured points, with no systematic term
    Points(&'a EfficiencySet),
}

impl<'a> EfficiencySource<'a> {
    fn efficiency_at(&self, channel: f64) -> Option<f64> {
        match self {
            Self::Model(model) => Some(model.eval(channel)),
            Self::Points(points) => points.interpolate(channel),
        }
    }
}

/// Turns a fitted peak integral into a rate: counting statistics first, then the
/// measurement time, then the efficiency, then the branching ratio.
#[derive(Debug, Clone, Copy)]
pub struct UncertaintyPropagator<'a> {
    pub measurement_time: f64,
    pub efficiency: Option<EfficiencySource<'a>>,
    pub branching_ratio: Option<f64>,
    pub calibration: Option<&'a CalibrationModel>,
    /// The axis that peak positions handed to [`UncertaintyPropagator::propagate`] are on
    pub position_domain: AxisDomain,
}

impl<'a> UncertaintyPropagator<'a> {
    pub fn new(measurement_time: f64) -> Self {
        Self {
            measurement_time,
            efficiency: None,
            branching_ratio: None,
            calibration: None,
            position_domain: AxisDomain::Channel,
        }
    }

    /// Correct for detection efficiency and divide by the branching ratio
    pub fn with_efficiency(mut self, source: EfficiencySource<'a>, branching_ratio: f64) -> Self {
        self.efficiency = Some(source);
        self.branching_ratio = Some(branching_ratio);
        self
    }

    pub fn with_calibration(mut self, calibration: &'a CalibrationModel, domain: AxisDomain) -> Self {
        self.calibration = Some(calibration);
        self.position_domain = domain;
        self
    }

    fn to_channel(&self, position: f64) -> Result<f64, CalibrationError> {
        match self.position_domain {
            AxisDomain::Channel => Ok(position),
            AxisDomain::Energy => self
                .calibration
                .map(|c| c.to_channel(position))
                .ok_or(CalibrationError::MissingCalibration),
        }
    }

    pub fn propagate(&self, integral: f64, position: f64) -> Result<RateEstimate, CalibrationError> {
        if !(self.measurement_time > 0.0) {
            return Err(CalibrationError::InvalidMeasurementTime(self.measurement_time));
        }
        let mut value = integral;
        let mut sigma = integral.max(0.0).sqrt();

        value /= self.measurement_time;
        sigma /= self.measurement_time;

        if let Some(source) = &self.efficiency {
            let channel = self.to_channel(position)?;
            let eff = source.efficiency_at(channel).unwrap_or(f64::NAN);
            if !(eff.is_finite() && eff > 0.0) {
                return Err(CalibrationError::NonPositiveEfficiency {
                    position,
                    value: eff,
                });
            }
            value /= eff;
            match source {
                EfficiencySource::Model(model) => {
                    let systematic = value / eff * model.residual;
                    sigma = ((sigma / eff).powi(2) + systematic.powi(2)).sqrt();
                }
                EfficiencySource::Points(_) => {
                    sigma /= eff;
                }
            }
            trace!("Efficiency {eff:.4e} at channel {channel:.2}");
        }

        if let Some(ratio) = self.branching_ratio {
            value /= ratio;
            sigma /= ratio;
        }
        Ok(RateEstimate::new(value, sigma))
    }
}
