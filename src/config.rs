//! Analysis settings that the interactive front end would otherwise own.
use bitflags::bitflags;
use thiserror::Error;

use crate::fitting::MAX_PEAKS;

bitflags! {
    /// Boolean switches for an analysis session
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AnalysisFlags: u8 {
        /// Correct rates for detection efficiency and branching ratio
        const EFFICIENCY_CORRECTION = 0b0001;
        /// Logarithmic count axis. Only affects display.
        const LOG_SCALE = 0b0010;
        /// Seed the Gaussian components from detector candidates inside the window
        const SEED_FROM_DETECTOR = 0b0100;
    }
}

pub const DEFAULT_BRANCHING_RATIO: f64 = 0.9999;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Peak count must be between 1 and {max}, got {0}", max = MAX_PEAKS)]
    PeakCount(usize),
    #[error("Measurement time must be at least 1, got {0}")]
    MeasurementTime(u32),
    #[error("Rebin factor must be at least 1, got {0}")]
    Rebin(usize),
    #[error("Branching ratio must be positive, got {0}")]
    BranchingRatio(f64),
    #[cfg(feature = "serde")]
    #[error("Failed to read configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AnalysisConfig {
    pub peak_count: usize,
    pub border_length: usize,
    /// Live time of the acquisition, in seconds
    pub measurement_time: u32,
    pub branching_ratio: f64,
    pub rebin: usize,
    pub flags: AnalysisFlags,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            peak_count: 1,
            border_length: 10,
            measurement_time: 1,
            branching_ratio: DEFAULT_BRANCHING_RATIO,
            rebin: 1,
            flags: AnalysisFlags::empty(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PEAKS).contains(&self.peak_count) {
            return Err(ConfigError::PeakCount(self.peak_count));
        }
        if self.measurement_time < 1 {
            return Err(ConfigError::MeasurementTime(self.measurement_time));
        }
        if self.rebin < 1 {
            return Err(ConfigError::Rebin(self.rebin));
        }
        if !(self.branching_ratio > 0.0 && self.branching_ratio.is_finite()) {
            return Err(ConfigError::BranchingRatio(self.branching_ratio));
        }
        Ok(())
    }

    pub fn efficiency_correction(&self) -> bool {
        self.flags.contains(AnalysisFlags::EFFICIENCY_CORRECTION)
    }

    /// Toggle efficiency correction. Switching it on resets the branching ratio to 1.
    pub fn set_efficiency_correction(&mut self, enabled: bool) {
        self.flags.set(AnalysisFlags::EFFICIENCY_CORRECTION, enabled);
        if enabled {
            self.branching_ratio = 1.0;
        }
    }

    pub fn seed_from_detector(&self) -> bool {
        self.flags.contains(AnalysisFlags::SEED_FROM_DETECTOR)
    }

    #[cfg(feature = "serde")]
    pub fn from_json<R: std::io::Read>(reader: R) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_reader(reader).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.peak_count, 1);
        assert_eq!(config.border_length, 10);
        assert_eq!(config.branching_ratio, DEFAULT_BRANCHING_RATIO);
        assert!(!config.efficiency_correction());
    }

    #[test]
    fn test_validation() {
        let config = AnalysisConfig {
            peak_count: 11,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PeakCount(11)));
        let config = AnalysisConfig {
            measurement_time: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MeasurementTime(0)));
        let config = AnalysisConfig {
            rebin: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Rebin(0)));
    }

    #[test]
    fn test_efficiency_toggle_resets_branching_ratio() {
        let mut config = AnalysisConfig {
            branching_ratio: 0.85,
            ..Default::default()
        };
        config.set_efficiency_correction(true);
        assert!(config.efficiency_correction());
        assert_eq!(config.branching_ratio, 1.0);
        config.branching_ratio = 0.5;
        config.set_efficiency_correction(false);
        assert_eq!(config.branching_ratio, 0.5);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_json() {
        let text = r#"{"peak_count": 3, "measurement_time": 600}"#;
        let config = AnalysisConfig::from_json(text.as_bytes()).unwrap();
        assert_eq!(config.peak_count, 3);
        assert_eq!(config.measurement_time, 600);
        assert_eq!(config.border_length, 10);
    }
}
