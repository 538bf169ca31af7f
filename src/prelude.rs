pub use crate::calibration::{
    CalibrationError, CalibrationModel, CalibrationPoint, CalibrationSet, EfficiencyCalibrator,
    EfficiencyModel, EfficiencyPoint, EfficiencySet, EfficiencySource, RateEstimate,
    UncertaintyPropagator,
};
pub use crate::config::{AnalysisConfig, AnalysisFlags};
pub use crate::fitting::{BackgroundLine, BackgroundModel, FitError, MultiGaussianFitter, Window};
pub use crate::io::{read_table, TableRow, TableWriter, XyReader};
pub use crate::peaks::{FittedPeak, PeakCandidate, PeakDetector};
pub use crate::session::{
    recompute, Command, Recomputed, SaveTarget, SessionError, SessionState, SessionWarning,
    SpectrumView, View,
};
pub use crate::spectrum::{AxisDomain, Spectrum};
