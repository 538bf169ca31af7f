//! Peak candidates found by scanning a [`Spectrum`](crate::spectrum::Spectrum) and the
//! fitted peaks produced by the [`fitting`](crate::fitting) stage.
pub mod detect;
pub mod fitted;

pub use detect::{find_closest_peak, PeakCandidate, PeakDetector, PeakScan, ScanStep};
pub use fitted::{FittedPeak, FWHM_PER_SIGMA};
