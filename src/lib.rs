pub mod calibration;
pub mod config;
pub mod fitting;
pub mod io;
pub mod peaks;
pub mod prelude;
pub mod session;
pub mod spectrum;

pub use crate::spectrum::{AxisDomain, Spectrum};

pub use crate::peaks::{FittedPeak, PeakCandidate, PeakDetector};
pub use crate::fitting::{BackgroundModel, MultiGaussianFitter, Window};

pub use crate::calibration::{
    CalibrationModel, CalibrationSet, EfficiencyCalibrator, EfficiencyModel, EfficiencySet,
    UncertaintyPropagator,
};
pub use crate::config::{AnalysisConfig, AnalysisFlags};

pub use crate::io::{TableRow, XyReader};
pub use crate::session::{recompute, Command, SessionState};
