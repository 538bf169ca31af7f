//! Conversion of fitted channel-space measurements into physical units.
//!
//! [`energy`] maps channels to energy with a straight line, [`efficiency`] models
//! the detector's absolute efficiency with two fitted branches joined by a line,
//! and [`uncertainty`] turns a fitted integral into an efficiency-corrected rate.
use thiserror::Error;

use crate::fitting::FitError;

pub mod efficiency;
pub mod energy;
pub mod uncertainty;

pub use efficiency::{
    BandSample, EfficiencyCalibrator, EfficiencyModel, EfficiencyPoint, EfficiencySet, HighBranch,
    LowBranch,
};
pub use energy::{CalibrationModel, CalibrationPoint, CalibrationSet, UncertaintyOrigin};
pub use uncertainty::{EfficiencySource, RateEstimate, UncertaintyPropagator};

/// Which half of the efficiency curve a message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Low,
    High,
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Branch::Low => f.write_str("low"),
            Branch::High => f.write_str("high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("An energy calibration needs at least 2 points, found {0}")]
    InsufficientCalibrationPoints(usize),
    #[error("The calibration slope is zero, channels cannot be recovered from energies")]
    ZeroSlope,
    #[error("Efficiency branches coincide (both approach {constant}); adjust breakpoints")]
    DegenerateJoin { constant: f64 },
    #[error("Breakpoints must satisfy low < high, got {low} and {high}")]
    InvalidBreakpoints { low: f64, high: f64 },
    #[error("The {branch} efficiency branch needs at least {needed} points, found {found}")]
    InsufficientEfficiencyPoints {
        branch: Branch,
        needed: usize,
        found: usize,
    },
    #[error("Converting between channel and energy requires an energy calibration")]
    MissingCalibration,
    #[error("The efficiency at {position} is {value}, which cannot correct a rate")]
    NonPositiveEfficiency { position: f64, value: f64 },
    #[error("The measurement time must be positive, got {0}")]
    InvalidMeasurementTime(f64),
    #[error(transparent)]
    Fit(#[from] FitError),
}
