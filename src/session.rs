//! An interactive analysis session, modelled as an immutable [`SessionState`] and a
//! pure transition function [`recompute`].
//!
//! Every [`Command`] produces a new state. The stages affected by a command are
//! recomputed in dependency order, calibration then efficiency then the working
//! spectrum then the peak analysis, and every stage after the first affected one is
//! recomputed too. A command that fails leaves the caller holding the previous
//! state untouched.
//!
//! ```
//! use gammaspec::prelude::*;
//!
//! let counts: Vec<f64> = (0..300)
//!     .map(|i| {
//!         let z = (i as f64 - 150.0) / 3.0;
//!         (5.0 + 500.0 * (-0.5 * z * z).exp()).round()
//!     })
//!     .collect();
//! let spectrum = Spectrum::new(-0.5, 1.0, counts).unwrap();
//!
//! let state = SessionState::default();
//! let next = recompute(&state, Command::LoadSpectrum(spectrum)).unwrap();
//! let analysis = next.state.analysis().unwrap();
//! assert_eq!(analysis.fit.peaks.len(), 1);
//! assert!((analysis.fit.peaks[0].position - 150.0).abs() < 0.5);
//! ```
use std::collections::VecDeque;
use std::fmt::Display;

use log::{debug, info, warn};
use thiserror::Error;

use crate::calibration::{
    CalibrationError, CalibrationModel, CalibrationPoint, CalibrationSet, EfficiencyCalibrator,
    EfficiencyModel, EfficiencyPoint, EfficiencySet, EfficiencySource, RateEstimate,
    UncertaintyPropagator,
};
use crate::config::{AnalysisConfig, AnalysisFlags, ConfigError};
use crate::fitting::{
    BackgroundLine, BackgroundModel, FitError, GaussianComponent, GaussianFit,
    MultiGaussianFitter, Window,
};
use crate::io::TableRow;
use crate::peaks::{find_closest_peak, FittedPeak, PeakCandidate, PeakDetector, FWHM_PER_SIGMA};
use crate::spectrum::{AxisDomain, Spectrum, SpectrumError};

/// Which spectrum the analysis runs on
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumView {
    #[default]
    Source,
    Background,
    /// Source minus background, clamped at zero
    Difference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Spectrum(SpectrumView),
    Calibration,
    Efficiency,
}

impl Default for View {
    fn default() -> Self {
        Self::Spectrum(SpectrumView::Source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTarget {
    Calibration,
    Efficiency,
}

/// Everything an operator can ask of a session
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LoadSpectrum(Spectrum),
    LoadBackground(Spectrum),
    /// Rows of `(channel, energy, energy uncertainty)`
    LoadCalibration(Vec<TableRow>),
    /// Rows of `(position, efficiency, uncertainty)` on the given axis
    LoadEfficiency {
        rows: Vec<TableRow>,
        domain: AxisDomain,
    },
    Show(View),
    /// Export the calibration or efficiency points as table rows
    Save(SaveTarget),
    /// The analysis window, on the current axis
    SetRange {
        min: f64,
        max: f64,
    },
    SetConfig(AnalysisConfig),
    SetPeakCount(usize),
    SetBorderLength(usize),
    SetMeasurementTime(u32),
    SetBranchingRatio(f64),
    SetRebin(usize),
    SetEfficiencyCorrection(bool),
    SetLogScale(bool),
    SetAxis(AxisDomain),
    SetBreakpoints {
        low: f64,
        high: f64,
    },
    /// Pair the next pending fitted peak with a known line energy
    CommitCalibrationPoint {
        energy: f64,
    },
    /// Pair the next pending fitted peak with the source activity to measure an efficiency
    CommitEfficiencyPoint {
        activity: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Calibration,
    Efficiency,
    Spectrum,
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Nothing,
    /// The stage and everything downstream of it
    From(Stage),
    /// Just these stages, in order
    Only(&'static [Stage]),
}

/// A fitted peak waiting to be committed as a calibration or efficiency point.
/// Its channel and width are fixed when the peak is fitted, so later changes to
/// the calibration do not move it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingPeak {
    pub peak: FittedPeak,
    pub channel: f64,
    /// The FWHM in channels
    pub channel_width: f64,
    pub rate: Option<RateEstimate>,
}

/// Fitted peaks in ascending position order, consumed one per commit.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AssignmentQueue {
    pending: VecDeque<PendingPeak>,
}

impl AssignmentQueue {
    pub fn new(peaks: impl IntoIterator<Item = PendingPeak>) -> Self {
        Self {
            pending: peaks.into_iter().collect(),
        }
    }

    pub fn pop(&mut self) -> Option<PendingPeak> {
        self.pending.pop_front()
    }

    pub fn peek(&self) -> Option<&PendingPeak> {
        self.pending.front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingPeak> {
        self.pending.iter()
    }
}

/// The result of analysing the current window
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// The window on the working spectrum's axis
    pub window: Window,
    pub candidates: Vec<PeakCandidate>,
    pub fit: GaussianFit,
    /// One entry per fitted peak, absent when the rate could not be computed
    pub rates: Vec<Option<RateEstimate>>,
}

/// Recoverable conditions reported alongside a new state
#[derive(Debug, Clone, PartialEq)]
pub enum SessionWarning {
    /// The detector found no qualifying candidate in the window
    NoPeakFound { min: f64, max: f64 },
    /// The energy calibration was not refitted, the previous model is kept
    CalibrationSkipped(CalibrationError),
    /// The efficiency curve could not be built
    EfficiencySkipped(CalibrationError),
    FitNotConverged { iterations: usize },
    RateUnavailable {
        position: f64,
        error: CalibrationError,
    },
}

impl Display for SessionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPeakFound { min, max } => write!(f, "No peak found in [{min}, {max}]"),
            Self::CalibrationSkipped(e) => write!(f, "Energy calibration not updated: {e}"),
            Self::EfficiencySkipped(e) => write!(f, "Efficiency curve not built: {e}"),
            Self::FitNotConverged { iterations } => {
                write!(f, "Peak fit did not converge after {iterations} iterations")
            }
            Self::RateUnavailable { position, error } => {
                write!(f, "No rate for the peak at {position}: {error}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("There are no fitted peaks left to commit")]
    NoCommitTargets,
    #[error("No spectrum has been loaded")]
    NoSpectrum,
    #[error("No background spectrum has been loaded")]
    NoBackground,
    #[error("No energy calibration is available")]
    NoCalibration,
    #[error("Efficiency correction needs an efficiency curve or efficiency points")]
    NoEfficiencySource,
    #[error("Efficiency points cannot be measured while efficiency correction is on")]
    EfficiencyCorrectionActive,
    #[error("The source activity must be positive, got {0}")]
    InvalidActivity(f64),
    #[error("The peak at {position} has no rate to derive an efficiency from")]
    MissingRate { position: f64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
}

/// The state reached by a successful [`recompute`]
#[derive(Debug, Clone, PartialEq)]
pub struct Recomputed {
    pub state: SessionState,
    pub warnings: Vec<SessionWarning>,
    /// Rows produced by [`Command::Save`]
    pub export: Option<Vec<TableRow>>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionState {
    config: AnalysisConfig,
    view: View,
    axis: AxisDomain,
    source: Option<Spectrum>,
    background: Option<Spectrum>,
    /// Always in channels
    range: Option<(f64, f64)>,
    calibration_points: CalibrationSet,
    calibration: Option<CalibrationModel>,
    efficiency_points: EfficiencySet,
    breakpoints: Option<(f64, f64)>,
    efficiency: Option<EfficiencyModel>,
    working: Option<Spectrum>,
    analysis: Option<Analysis>,
    calibration_queue: AssignmentQueue,
    efficiency_queue: AssignmentQueue,
}

/// Apply `command` to `state`, returning the new state and any warnings.
pub fn recompute(state: &SessionState, command: Command) -> Result<Recomputed, SessionError> {
    let mut next = state.clone();
    let mut warnings = Vec::new();
    let mut export = None;

    let refresh = match command {
        Command::Save(target) => {
            let rows = match target {
                SaveTarget::Calibration => next.calibration_points.rows(),
                SaveTarget::Efficiency => next.efficiency_points.rows(),
            };
            info!("Exporting {} {target:?} rows", rows.len());
            export = Some(rows);
            Refresh::Nothing
        }
        command => next.apply(command)?,
    };

    match refresh {
        Refresh::Nothing => {}
        Refresh::From(stage) => next.refresh_from(stage, &mut warnings)?,
        Refresh::Only(stages) => {
            for stage in stages {
                next.refresh_stage(*stage, &mut warnings)?;
            }
        }
    }

    for w in warnings.iter() {
        warn!("{w}");
    }
    Ok(Recomputed {
        state: next,
        warnings,
        export,
    })
}

impl SessionState {
    pub fn new(config: AnalysisConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn axis(&self) -> AxisDomain {
        self.axis
    }

    pub fn log_scale(&self) -> bool {
        self.config.flags.contains(AnalysisFlags::LOG_SCALE)
    }

    pub fn source(&self) -> Option<&Spectrum> {
        self.source.as_ref()
    }

    pub fn background(&self) -> Option<&Spectrum> {
        self.background.as_ref()
    }

    /// The spectrum the analysis runs on, after view selection, rebinning and axis conversion
    pub fn working(&self) -> Option<&Spectrum> {
        self.working.as_ref()
    }

    /// The analysis range in channels
    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    pub fn calibration_points(&self) -> &CalibrationSet {
        &self.calibration_points
    }

    pub fn calibration(&self) -> Option<&CalibrationModel> {
        self.calibration.as_ref()
    }

    pub fn efficiency_points(&self) -> &EfficiencySet {
        &self.efficiency_points
    }

    pub fn efficiency(&self) -> Option<&EfficiencyModel> {
        self.efficiency.as_ref()
    }

    pub fn breakpoints(&self) -> Option<(f64, f64)> {
        self.breakpoints
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        self.analysis.as_ref()
    }

    pub fn calibration_queue(&self) -> &AssignmentQueue {
        &self.calibration_queue
    }

    pub fn efficiency_queue(&self) -> &AssignmentQueue {
        &self.efficiency_queue
    }

    /// The position of the highest bin near where a line of `energy` should appear
    /// under the current calibration, on the working spectrum's axis.
    pub fn expected_peak(&self, energy: f64) -> Result<Option<f64>, SessionError> {
        let calibration = self.calibration.ok_or(SessionError::NoCalibration)?;
        let working = self.working.as_ref().ok_or(SessionError::NoSpectrum)?;
        let x = match self.axis {
            AxisDomain::Channel => calibration.to_channel(energy),
            AxisDomain::Energy => energy,
        };
        Ok(working
            .find_bin(x)
            .and_then(|bin| find_closest_peak(working, bin))
            .map(|bin| working.center(bin)))
    }

    fn efficiency_source(&self) -> Option<EfficiencySource<'_>> {
        if let Some(model) = &self.efficiency {
            Some(EfficiencySource::Model(model))
        } else if !self.efficiency_points.is_empty() {
            Some(EfficiencySource::Points(&self.efficiency_points))
        } else {
            None
        }
    }

    fn update_config(
        &mut self,
        update: impl FnOnce(&mut AnalysisConfig),
        stage: Stage,
    ) -> Result<Refresh, SessionError> {
        let mut config = self.config;
        update(&mut config);
        config.validate()?;
        self.config = config;
        Ok(Refresh::From(stage))
    }

    /// Express a position and width on the working axis in channels
    fn to_channels(&self, position: f64, width: f64) -> Result<(f64, f64), SessionError> {
        match self.axis {
            AxisDomain::Channel => Ok((position, width)),
            AxisDomain::Energy => {
                let calibration = self.calibration.ok_or(SessionError::NoCalibration)?;
                Ok((
                    calibration.to_channel(position),
                    calibration.energy_to_channel_uncertainty(width),
                ))
            }
        }
    }

    fn apply(&mut self, command: Command) -> Result<Refresh, SessionError> {
        match command {
            Command::LoadSpectrum(spectrum) => {
                let span = spectrum.high() - spectrum.low();
                self.range = Some((
                    spectrum.low() + span / 3.0,
                    spectrum.low() + 2.0 * span / 3.0,
                ));
                info!(
                    "Loaded spectrum with {} bins over [{}, {}]",
                    spectrum.len(),
                    spectrum.low(),
                    spectrum.high()
                );
                self.source = Some(spectrum);
                self.view = View::Spectrum(SpectrumView::Source);
                Ok(Refresh::From(Stage::Spectrum))
            }
            Command::LoadBackground(spectrum) => {
                self.background = Some(spectrum);
                Ok(Refresh::From(Stage::Spectrum))
            }
            Command::LoadCalibration(rows) => {
                self.calibration_points = CalibrationSet::from_rows(&rows);
                Ok(Refresh::From(Stage::Calibration))
            }
            Command::LoadEfficiency { rows, domain } => {
                let points = EfficiencySet::from_rows(&rows, domain);
                self.efficiency_points = match domain {
                    AxisDomain::Channel => points,
                    AxisDomain::Energy => {
                        let calibration = self.calibration.ok_or(SessionError::NoCalibration)?;
                        points.to_channel_domain(&calibration)
                    }
                };
                Ok(Refresh::From(Stage::Efficiency))
            }
            Command::Show(view) => {
                self.view = view;
                match view {
                    View::Spectrum(_) => Ok(Refresh::From(Stage::Spectrum)),
                    View::Calibration | View::Efficiency => Ok(Refresh::Nothing),
                }
            }
            Command::Save(_) => Ok(Refresh::Nothing),
            Command::SetRange { min, max } => {
                if self.source.is_none() {
                    return Err(SessionError::NoSpectrum);
                }
                let (min, _) = self.to_channels(min, 0.0)?;
                let (max, _) = self.to_channels(max, 0.0)?;
                self.range = Some(if min <= max { (min, max) } else { (max, min) });
                Ok(Refresh::From(Stage::Analysis))
            }
            Command::SetConfig(mut config) => {
                config.validate()?;
                let enabling =
                    config.efficiency_correction() && !self.config.efficiency_correction();
                if enabling {
                    if self.efficiency_source().is_none() {
                        return Err(SessionError::NoEfficiencySource);
                    }
                    config.set_efficiency_correction(true);
                }
                self.config = config;
                Ok(Refresh::From(Stage::Spectrum))
            }
            Command::SetPeakCount(n) => self.update_config(|c| c.peak_count = n, Stage::Analysis),
            Command::SetBorderLength(b) => {
                self.update_config(|c| c.border_length = b, Stage::Analysis)
            }
            Command::SetMeasurementTime(t) => {
                self.update_config(|c| c.measurement_time = t, Stage::Analysis)
            }
            Command::SetBranchingRatio(r) => {
                self.update_config(|c| c.branching_ratio = r, Stage::Analysis)
            }
            Command::SetRebin(k) => self.update_config(|c| c.rebin = k, Stage::Spectrum),
            Command::SetEfficiencyCorrection(enabled) => {
                if enabled && self.efficiency_source().is_none() {
                    return Err(SessionError::NoEfficiencySource);
                }
                self.update_config(|c| c.set_efficiency_correction(enabled), Stage::Analysis)
            }
            Command::SetLogScale(enabled) => {
                self.config.flags.set(AnalysisFlags::LOG_SCALE, enabled);
                Ok(Refresh::Nothing)
            }
            Command::SetAxis(domain) => {
                if domain == AxisDomain::Energy && self.calibration.is_none() {
                    return Err(SessionError::NoCalibration);
                }
                self.axis = domain;
                Ok(Refresh::From(Stage::Spectrum))
            }
            Command::SetBreakpoints { low, high } => {
                if !(low < high) {
                    return Err(CalibrationError::InvalidBreakpoints { low, high }.into());
                }
                self.breakpoints = Some((low, high));
                Ok(Refresh::From(Stage::Efficiency))
            }
            Command::CommitCalibrationPoint { energy } => {
                let pending = self
                    .calibration_queue
                    .pop()
                    .ok_or(SessionError::NoCommitTargets)?;
                let (channel, width) = (pending.channel, pending.channel_width);
                debug!("Committing channel {channel:.2} as {energy} (width {width:.2})");
                self.calibration_points
                    .insert(CalibrationPoint::from_channel(channel, energy, width));
                // The working spectrum follows the new calibration; the analysis and
                // its queue are kept until the next fit.
                Ok(Refresh::Only(&[Stage::Calibration, Stage::Spectrum]))
            }
            Command::CommitEfficiencyPoint { activity } => {
                if self.config.efficiency_correction() {
                    return Err(SessionError::EfficiencyCorrectionActive);
                }
                if !(activity.is_finite() && activity > 0.0) {
                    return Err(SessionError::InvalidActivity(activity));
                }
                let pending = self
                    .efficiency_queue
                    .pop()
                    .ok_or(SessionError::NoCommitTargets)?;
                let rate = pending.rate.ok_or(SessionError::MissingRate {
                    position: pending.peak.position,
                })?;
                let channel = pending.channel;
                let scale = activity * self.config.branching_ratio;
                let point = EfficiencyPoint::new(channel, rate.value / scale, rate.uncertainty / scale);
                debug!("Committing efficiency {:.4e} at channel {channel:.2}", point.efficiency);
                self.efficiency_points.insert(point);
                Ok(Refresh::Only(&[Stage::Efficiency]))
            }
        }
    }

    fn refresh_from(
        &mut self,
        stage: Stage,
        warnings: &mut Vec<SessionWarning>,
    ) -> Result<(), SessionError> {
        for s in [
            Stage::Calibration,
            Stage::Efficiency,
            Stage::Spectrum,
            Stage::Analysis,
        ] {
            if s >= stage {
                self.refresh_stage(s, warnings)?;
            }
        }
        Ok(())
    }

    fn refresh_stage(
        &mut self,
        stage: Stage,
        warnings: &mut Vec<SessionWarning>,
    ) -> Result<(), SessionError> {
        match stage {
            Stage::Calibration => {
                self.refit_calibration(warnings);
                Ok(())
            }
            Stage::Efficiency => {
                self.refit_efficiency(warnings);
                Ok(())
            }
            Stage::Spectrum => self.rebuild_working(),
            Stage::Analysis => self.analyze(warnings),
        }
    }

    fn refit_calibration(&mut self, warnings: &mut Vec<SessionWarning>) {
        if self.calibration_points.is_empty() {
            return;
        }
        match self.calibration_points.fit() {
            Ok(model) => {
                self.calibration_points = self.calibration_points.with_model(&model);
                self.calibration = Some(model);
            }
            Err(e) => warnings.push(SessionWarning::CalibrationSkipped(e)),
        }
    }

    fn refit_efficiency(&mut self, warnings: &mut Vec<SessionWarning>) {
        self.efficiency = None;
        let Some((low, high)) = self.breakpoints else {
            return;
        };
        if self.efficiency_points.is_empty() {
            return;
        }
        match EfficiencyCalibrator::default().fit(&self.efficiency_points, low, high) {
            Ok(model) => self.efficiency = Some(model),
            Err(e) => warnings.push(SessionWarning::EfficiencySkipped(e)),
        }
    }

    fn rebuild_working(&mut self) -> Result<(), SessionError> {
        let Some(source) = &self.source else {
            self.working = None;
            return Ok(());
        };
        let base = match self.view {
            View::Spectrum(SpectrumView::Background) => {
                self.background.clone().ok_or(SessionError::NoBackground)?
            }
            View::Spectrum(SpectrumView::Difference) => {
                let background = self.background.as_ref().ok_or(SessionError::NoBackground)?;
                source.subtract_clamped(background)?
            }
            _ => source.clone(),
        };
        let mut working = base.rebin(self.config.rebin)?;
        if self.axis == AxisDomain::Energy {
            let calibration = self.calibration.ok_or(SessionError::NoCalibration)?;
            working = working.map_axis(calibration.slope, calibration.intercept, AxisDomain::Energy)?;
        }
        self.working = Some(working);
        Ok(())
    }

    fn window_on_axis(&self) -> Option<Window> {
        let (min, max) = self.range?;
        let window = Window::new(min, max, self.config.border_length);
        match (self.axis, self.calibration) {
            (AxisDomain::Energy, Some(c)) => Some(window.map(c.slope, c.intercept)),
            (AxisDomain::Energy, None) => None,
            (AxisDomain::Channel, _) => Some(window),
        }
    }

    fn propagator(&self) -> Result<UncertaintyPropagator<'_>, SessionError> {
        let mut propagator = UncertaintyPropagator::new(self.config.measurement_time as f64);
        if let Some(calibration) = &self.calibration {
            propagator = propagator.with_calibration(calibration, self.axis);
        }
        if self.config.efficiency_correction() {
            let source = self
                .efficiency_source()
                .ok_or(SessionError::NoEfficiencySource)?;
            propagator = propagator.with_efficiency(source, self.config.branching_ratio);
        }
        Ok(propagator)
    }

    fn analyze(&mut self, warnings: &mut Vec<SessionWarning>) -> Result<(), SessionError> {
        if !matches!(self.view, View::Spectrum(_)) {
            return Ok(());
        }
        let (Some(working), Some(window)) = (self.working.as_ref(), self.window_on_axis()) else {
            self.analysis = None;
            self.calibration_queue.clear();
            self.efficiency_queue.clear();
            return Ok(());
        };

        let background = BackgroundModel::fit(working, &window);
        let candidates: Vec<PeakCandidate> = PeakDetector::default()
            .scan_range(working, working.bins_between(window.min, window.max))
            .collect();
        if candidates.is_empty() {
            warnings.push(SessionWarning::NoPeakFound {
                min: window.min,
                max: window.max,
            });
        }

        let fitter = MultiGaussianFitter::default();
        let n = self.config.peak_count;
        let fit = if self.config.seed_from_detector() && !candidates.is_empty() {
            let seeds = detector_seeds(working, &window, &background, &candidates, n);
            fitter.fit_seeded(working, &window, &background, &seeds)?
        } else {
            fitter.fit(working, &window, &background, n)?
        };
        if !fit.converged {
            warnings.push(SessionWarning::FitNotConverged {
                iterations: fit.iterations,
            });
        }

        let propagator = self.propagator()?;
        let rates: Vec<Option<RateEstimate>> = fit
            .peaks
            .iter()
            .map(|p| match propagator.propagate(p.integral, p.position) {
                Ok(rate) => Some(rate),
                Err(error) => {
                    warnings.push(SessionWarning::RateUnavailable {
                        position: p.position,
                        error,
                    });
                    None
                }
            })
            .collect();

        let pending = fit
            .peaks
            .iter()
            .zip(rates.iter())
            .map(|(peak, rate)| {
                let (channel, channel_width) = self.to_channels(peak.position, peak.fwhm)?;
                Ok(PendingPeak {
                    peak: *peak,
                    channel,
                    channel_width,
                    rate: *rate,
                })
            })
            .collect::<Result<Vec<PendingPeak>, SessionError>>()?;

        self.calibration_queue = AssignmentQueue::new(pending.iter().copied());
        self.efficiency_queue = AssignmentQueue::new(pending);
        self.analysis = Some(Analysis {
            window,
            candidates,
            fit,
            rates,
        });
        Ok(())
    }
}

/// Seed one component per detector candidate, falling back to the identical
/// default seed for components beyond the candidates found.
fn detector_seeds(
    spectrum: &Spectrum,
    window: &Window,
    background: &BackgroundLine,
    candidates: &[PeakCandidate],
    n: usize,
) -> Vec<GaussianComponent> {
    let bin_width = spectrum.bin_width();
    let mut seeds: Vec<GaussianComponent> = candidates
        .iter()
        .take(n)
        .map(|c| {
            let x = spectrum.center(c.bin);
            let sigma = (c.width as f64 * bin_width / FWHM_PER_SIGMA).max(bin_width);
            GaussianComponent::new(spectrum.count(c.bin) - background.eval(x), x, sigma)
        })
        .collect();
    seeds.extend(MultiGaussianFitter::default_seeds(window, n - seeds.len()));
    seeds
}

#[cfg(test)]
mod test {
    use super::*;

    fn synthetic(components: &[(f64, f64)], n: usize) -> Spectrum {
        let counts: Vec<f64> = (0..n)
            .map(|i| {
                let x = i as f64;
                let signal: f64 = components
                    .iter()
                    .map(|(mu, a)| a * (-0.5 * ((x - mu) / 3.0).powi(2)).exp())
                    .sum();
                (5.0 + signal).round()
            })
            .collect();
        Spectrum::new(-0.5, 1.0, counts).unwrap()
    }

    fn run(state: &SessionState, command: Command) -> Recomputed {
        recompute(state, command).unwrap()
    }

    fn two_peak_session() -> SessionState {
        let config = AnalysisConfig {
            peak_count: 2,
            flags: AnalysisFlags::SEED_FROM_DETECTOR,
            ..Default::default()
        };
        let state = SessionState::new(config).unwrap();
        let spectrum = synthetic(&[(120.0, 500.0), (170.0, 400.0)], 300);
        run(&state, Command::LoadSpectrum(spectrum)).state
    }

    #[test_log::test]
    fn test_load_spectrum_analyses_middle_third() {
        let state = run(
            &SessionState::default(),
            Command::LoadSpectrum(synthetic(&[(150.0, 500.0)], 300)),
        )
        .state;
        assert_eq!(state.range(), Some((99.5, 199.5)));
        let analysis = state.analysis().unwrap();
        assert_eq!(analysis.candidates.len(), 1);
        assert!((analysis.candidates[0].bin as f64 - 150.0).abs() <= 1.0);
        let peak = analysis.fit.peaks[0];
        assert!((peak.position - 150.0).abs() < 0.5);
        assert!((peak.fwhm - 2.35 * 3.0).abs() < 0.05 * 2.35 * 3.0);
        assert_eq!(state.calibration_queue().len(), 1);

        let rate = analysis.rates[0].unwrap();
        assert!((rate.value - peak.integral).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_measurement_time_scales_rates() {
        let state = two_peak_session();
        let next = run(&state, Command::SetMeasurementTime(10)).state;
        let before = state.analysis().unwrap();
        let after = next.analysis().unwrap();
        for (a, b) in before.rates.iter().zip(after.rates.iter()) {
            let (a, b) = (a.unwrap(), b.unwrap());
            assert!((a.value / 10.0 - b.value).abs() < 1e-6);
            assert!((a.uncertainty / 10.0 - b.uncertainty).abs() < 1e-6);
        }
    }

    #[test_log::test]
    fn test_commit_calibration_points_in_position_order() {
        let state = two_peak_session();
        let positions: Vec<f64> = state
            .calibration_queue()
            .iter()
            .map(|p| p.peak.position)
            .collect();
        assert_eq!(positions.len(), 2);
        assert!(positions[0] < positions[1]);

        let first = run(&state, Command::CommitCalibrationPoint { energy: 60.0 });
        assert!(matches!(
            first.warnings[..],
            [SessionWarning::CalibrationSkipped(
                CalibrationError::InsufficientCalibrationPoints(1)
            )]
        ));
        assert_eq!(first.state.calibration_queue().len(), 1);
        assert!(first.state.calibration().is_none());

        let second = run(&first.state, Command::CommitCalibrationPoint { energy: 85.0 });
        let model = second.state.calibration().unwrap();
        assert!((model.slope - 0.5).abs() < 1e-3, "{model:?}");
        assert!(model.intercept.abs() < 0.2);
        assert!(second.state.calibration_queue().is_empty());
        // committing does not re-run the analysis, so the queue stays drained
        assert_eq!(
            recompute(&second.state, Command::CommitCalibrationPoint { energy: 1.0 }),
            Err(SessionError::NoCommitTargets)
        );

        let energy = run(&second.state, Command::SetAxis(AxisDomain::Energy)).state;
        let window = energy.analysis().unwrap().window;
        assert!((window.min - model.to_energy(99.5)).abs() < 1e-9);
        let expected = energy.expected_peak(60.0).unwrap().unwrap();
        assert!((expected - 60.0).abs() < 1.0);

        let export = run(&second.state, Command::Save(SaveTarget::Calibration));
        let rows = export.export.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 60.0);
        assert!(rows[0].uncertainty > 0.0);
    }

    #[test_log::test]
    fn test_commits_on_energy_axis_follow_the_refit() {
        let rows = vec![TableRow::new(100.0, 50.0, 5.0), TableRow::new(200.0, 100.0, 5.0)];
        let state = run(&two_peak_session(), Command::LoadCalibration(rows)).state;
        let state = run(&state, Command::SetAxis(AxisDomain::Energy)).state;
        let channels: Vec<f64> = state.calibration_queue().iter().map(|p| p.channel).collect();
        assert!((channels[0] - 120.0).abs() < 0.5, "{channels:?}");
        assert!((channels[1] - 170.0).abs() < 0.5, "{channels:?}");

        let first = run(&state, Command::CommitCalibrationPoint { energy: 70.0 }).state;
        let model = *first.calibration().unwrap();
        assert!((model.slope - 0.5).abs() > 0.02, "{model:?}");
        let working = first.working().unwrap();
        assert!((working.low() - model.to_energy(-0.5)).abs() < 1e-9);
        assert_eq!(first.calibration_queue().len(), 1);

        let second = run(&first, Command::CommitCalibrationPoint { energy: 85.0 }).state;
        let committed: Vec<f64> = second
            .calibration_points()
            .points()
            .iter()
            .map(|p| p.channel)
            .collect();
        assert_eq!(committed.len(), 4);
        assert!((committed[2] - 170.0).abs() < 0.5, "{committed:?}");

        // a commit that makes the calibration decrease cannot re-express the axis
        assert!(matches!(
            recompute(&state, Command::CommitCalibrationPoint { energy: 300.0 }),
            Err(SessionError::Spectrum(SpectrumError::NonIncreasingAxis(_)))
        ));
        assert_eq!(state.calibration_queue().len(), 2);
    }

    #[test]
    fn test_config_enabling_correction_needs_a_source() {
        let state = two_peak_session();
        let mut config = *state.config();
        config.flags.insert(AnalysisFlags::EFFICIENCY_CORRECTION);
        assert_eq!(
            recompute(&state, Command::SetConfig(config)),
            Err(SessionError::NoEfficiencySource)
        );

        let measured = run(&state, Command::CommitEfficiencyPoint { activity: 100.0 }).state;
        let corrected = run(&measured, Command::SetConfig(config)).state;
        assert!(corrected.config().efficiency_correction());
        assert_eq!(corrected.config().branching_ratio, 1.0);
    }

    #[test]
    fn test_energy_axis_needs_calibration() {
        let state = two_peak_session();
        assert_eq!(
            recompute(&state, Command::SetAxis(AxisDomain::Energy)),
            Err(SessionError::NoCalibration)
        );
        assert_eq!(state.axis(), AxisDomain::Channel);
    }

    #[test]
    fn test_background_views() {
        let state = two_peak_session();
        assert_eq!(
            recompute(&state, Command::Show(View::Spectrum(SpectrumView::Difference))),
            Err(SessionError::NoBackground)
        );
        let flat = Spectrum::new(-0.5, 1.0, vec![5.0; 300]).unwrap();
        let state = run(&state, Command::LoadBackground(flat)).state;
        let state = run(&state, Command::Show(View::Spectrum(SpectrumView::Difference))).state;
        let working = state.working().unwrap();
        assert_eq!(working.count(0), 0.0);
        assert!(working.count(120) > 400.0);
        assert_eq!(state.analysis().unwrap().fit.peaks.len(), 2);
    }

    #[test_log::test]
    fn test_efficiency_commits() {
        let state = two_peak_session();
        let next = run(&state, Command::CommitEfficiencyPoint { activity: 100.0 }).state;
        let rate = state.analysis().unwrap().rates[0].unwrap();
        let point = next.efficiency_points().points()[0];
        assert!((point.efficiency - rate.value / (100.0 * 0.9999)).abs() < 1e-12);
        assert_eq!(next.efficiency_queue().len(), 1);
        assert_eq!(
            recompute(&next, Command::CommitEfficiencyPoint { activity: 0.0 }),
            Err(SessionError::InvalidActivity(0.0))
        );

        assert_eq!(
            recompute(&state, Command::SetEfficiencyCorrection(true)),
            Err(SessionError::NoEfficiencySource)
        );
        let corrected = run(&next, Command::SetEfficiencyCorrection(true)).state;
        assert_eq!(corrected.config().branching_ratio, 1.0);
        assert_eq!(
            recompute(&corrected, Command::CommitEfficiencyPoint { activity: 100.0 }),
            Err(SessionError::EfficiencyCorrectionActive)
        );
        // a single point gives a constant efficiency everywhere
        let corrected_rate = corrected.analysis().unwrap().rates[0].unwrap();
        assert!((corrected_rate.value - 100.0 * 0.9999).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let state = two_peak_session();
        assert!(matches!(
            recompute(&state, Command::SetPeakCount(0)),
            Err(SessionError::Config(ConfigError::PeakCount(0)))
        ));
        assert!(matches!(
            recompute(&state, Command::SetBreakpoints { low: 5.0, high: 1.0 }),
            Err(SessionError::Calibration(CalibrationError::InvalidBreakpoints { .. }))
        ));
        assert_eq!(
            recompute(&SessionState::default(), Command::SetRange { min: 0.0, max: 1.0 }),
            Err(SessionError::NoSpectrum)
        );
        let log = run(&state, Command::SetLogScale(true)).state;
        assert!(log.log_scale());
        assert_eq!(log.analysis(), state.analysis());
    }
}
