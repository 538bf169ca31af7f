//! Background-subtracted fits of one to [`MAX_PEAKS`] Gaussian components.
//!
//! A single component is seeded from the moments of the window. Several components
//! all start from the same fixed seed at the window midpoint, so the optimiser has to
//! separate them from the data alone; callers that know better can pass their own
//! seeds to [`MultiGaussianFitter::fit_seeded`].
use std::f64::consts::{FRAC_PI_2, SQRT_2};

use log::{debug, warn};
use statrs::function::erf::erf;

use super::{
    background::BackgroundLine,
    lm::{FitModel, LevenbergMarquardt},
    FitError, Window,
};
use crate::peaks::{FittedPeak, FWHM_PER_SIGMA};
use crate::spectrum::Spectrum;

pub const MAX_PEAKS: usize = 10;

/// Amplitude every component starts from in a multi-peak fit
pub const SEED_AMPLITUDE: f64 = 100.0;

/// Width every component starts from in a multi-peak fit
pub const SEED_SIGMA: f64 = 3.0;

/// `amplitude * exp(-0.5 * ((x - mean) / sigma)^2)`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianComponent {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
}

impl GaussianComponent {
    pub fn new(amplitude: f64, mean: f64, sigma: f64) -> Self {
        Self {
            amplitude,
            mean,
            sigma,
        }
    }

    #[inline]
    pub fn value(&self, x: f64) -> f64 {
        if self.sigma == 0.0 {
            return 0.0;
        }
        let z = (x - self.mean) / self.sigma;
        self.amplitude * (-0.5 * z * z).exp()
    }

    pub fn fwhm(&self) -> f64 {
        self.sigma.abs() * FWHM_PER_SIGMA
    }

    /// Closed form integral of the curve over `[low, high]`
    pub fn integral(&self, low: f64, high: f64) -> f64 {
        let sigma = self.sigma.abs();
        if sigma == 0.0 {
            return 0.0;
        }
        let scale = sigma * SQRT_2;
        self.amplitude
            * sigma
            * FRAC_PI_2.sqrt()
            * (erf((high - self.mean) / scale) - erf((low - self.mean) / scale))
    }
}

/// The sum of `n` Gaussians with parameters laid out `[A0, mu0, sigma0, A1, ...]`
#[derive(Debug, Clone, Copy)]
struct GaussianSum {
    components: usize,
}

impl FitModel for GaussianSum {
    fn parameter_count(&self) -> usize {
        self.components * 3
    }

    fn value(&self, x: f64, params: &[f64]) -> f64 {
        params
            .chunks_exact(3)
            .map(|p| GaussianComponent::new(p[0], p[1], p[2]).value(x))
            .sum()
    }

    fn gradient(&self, x: f64, params: &[f64], gradient: &mut [f64]) {
        for (p, g) in params.chunks_exact(3).zip(gradient.chunks_exact_mut(3)) {
            let (a, mu, sigma) = (p[0], p[1], p[2]);
            if sigma == 0.0 {
                g.iter_mut().for_each(|v| *v = 0.0);
                continue;
            }
            let d = x - mu;
            let e = (-0.5 * (d / sigma).powi(2)).exp();
            g[0] = e;
            g[1] = a * e * d / (sigma * sigma);
            g[2] = a * e * d * d / (sigma * sigma * sigma);
        }
    }
}

/// The result of fitting a window, with components and peaks sorted by ascending position.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianFit {
    pub window: Window,
    pub background: BackgroundLine,
    pub components: Vec<GaussianComponent>,
    pub peaks: Vec<FittedPeak>,
    pub chi2: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl GaussianFit {
    /// The fitted curve with the background added back, for display
    pub fn total(&self, x: f64) -> f64 {
        self.background.eval(x) + self.components.iter().map(|c| c.value(x)).sum::<f64>()
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MultiGaussianFitter {
    pub solver: LevenbergMarquardt,
}

impl MultiGaussianFitter {
    pub fn new(solver: LevenbergMarquardt) -> Self {
        Self { solver }
    }

    /// The identical starting point used for every component of an `n`-peak fit
    pub fn default_seeds(window: &Window, n: usize) -> Vec<GaussianComponent> {
        vec![GaussianComponent::new(SEED_AMPLITUDE, window.midpoint(), SEED_SIGMA); n]
    }

    /// A single-component seed from the window's moments, treating negative
    /// residual counts as zero.
    fn moment_seed(window: &Window, xs: &[f64], ys: &[f64], bin_width: f64) -> GaussianComponent {
        let total: f64 = ys.iter().map(|y| y.max(0.0)).sum();
        let peak = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(total > 0.0) {
            return GaussianComponent::new(SEED_AMPLITUDE, window.midpoint(), SEED_SIGMA);
        }
        let mean = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| x * y.max(0.0))
            .sum::<f64>()
            / total;
        let variance = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| (x - mean).powi(2) * y.max(0.0))
            .sum::<f64>()
            / total;
        let sigma = variance.sqrt().max(bin_width);
        GaussianComponent::new(peak, mean, sigma)
    }

    /// Fit `n` components over `window` after removing `background`.
    pub fn fit(
        &self,
        spectrum: &Spectrum,
        window: &Window,
        background: &BackgroundLine,
        n: usize,
    ) -> Result<GaussianFit, FitError> {
        if n == 0 || n > MAX_PEAKS {
            return Err(FitError::InvalidPeakCount(n));
        }
        let (xs, ys) = background.subtract_from(spectrum, window);
        if xs.is_empty() {
            return Err(FitError::EmptyWindow {
                min: window.min,
                max: window.max,
            });
        }
        let seeds = if n == 1 {
            vec![Self::moment_seed(window, &xs, &ys, spectrum.bin_width())]
        } else {
            Self::default_seeds(window, n)
        };
        Ok(self.fit_samples(spectrum, window, background, &xs, &ys, &seeds))
    }

    /// Fit one component per seed over `window` after removing `background`.
    pub fn fit_seeded(
        &self,
        spectrum: &Spectrum,
        window: &Window,
        background: &BackgroundLine,
        seeds: &[GaussianComponent],
    ) -> Result<GaussianFit, FitError> {
        if seeds.is_empty() || seeds.len() > MAX_PEAKS {
            return Err(FitError::InvalidPeakCount(seeds.len()));
        }
        let (xs, ys) = background.subtract_from(spectrum, window);
        if xs.is_empty() {
            return Err(FitError::EmptyWindow {
                min: window.min,
                max: window.max,
            });
        }
        Ok(self.fit_samples(spectrum, window, background, &xs, &ys, seeds))
    }

    fn fit_samples(
        &self,
        spectrum: &Spectrum,
        window: &Window,
        background: &BackgroundLine,
        xs: &[f64],
        ys: &[f64],
        seeds: &[GaussianComponent],
    ) -> GaussianFit {
        let model = GaussianSum {
            components: seeds.len(),
        };
        let initial: Vec<f64> = seeds
            .iter()
            .flat_map(|s| [s.amplitude, s.mean, s.sigma])
            .collect();
        let outcome = self.solver.minimize(&model, xs, ys, None, &initial);
        if !outcome.converged {
            warn!(
                "Gaussian fit over [{}, {}] did not converge, keeping best-effort parameters",
                window.min, window.max
            );
        }

        let mut components: Vec<GaussianComponent> = outcome
            .parameters
            .chunks_exact(3)
            .map(|p| GaussianComponent::new(p[0], p[1], p[2].abs()))
            .collect();
        components.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let per_channel = spectrum.units_per_channel();
        let peaks: Vec<FittedPeak> = components
            .iter()
            .map(|c| {
                FittedPeak::new(
                    c.mean,
                    c.fwhm(),
                    c.integral(window.min, window.max) / per_channel,
                )
            })
            .collect();

        debug!(
            "Fitted {} peak(s) over [{}, {}] in {} iterations: {:?}",
            peaks.len(),
            window.min,
            window.max,
            outcome.iterations,
            peaks.iter().map(|p| p.position).collect::<Vec<_>>()
        );

        GaussianFit {
            window: *window,
            background: *background,
            components,
            peaks,
            chi2: outcome.chi2,
            iterations: outcome.iterations,
            converged: outcome.converged,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fitting::BackgroundModel;

    fn synthetic(components: &[(f64, f64, f64)], baseline: f64, n: usize) -> Spectrum {
        let counts: Vec<f64> = (0..n)
            .map(|i| {
                let x = i as f64;
                baseline
                    + components
                        .iter()
                        .map(|(a, mu, s)| GaussianComponent::new(*a, *mu, *s).value(x))
                        .sum::<f64>()
            })
            .collect();
        Spectrum::new(-0.5, 1.0, counts).unwrap()
    }

    #[test]
    fn test_closed_form_integral() {
        let g = GaussianComponent::new(10.0, 0.0, 2.0);
        let full = 10.0 * 2.0 * (2.0 * std::f64::consts::PI).sqrt();
        assert!((g.integral(-100.0, 100.0) - full).abs() < 1e-9);
        assert!((g.integral(0.0, 100.0) - full / 2.0).abs() < 1e-9);
        assert!((g.fwhm() - 4.7).abs() < 1e-12);
    }

    #[test_log::test]
    fn test_single_peak_recovery() {
        let spec = synthetic(&[(500.0, 100.0, 3.0)], 5.0, 256);
        let window = Window::new(85.0, 115.0, 10);
        let background = BackgroundModel::fit(&spec, &window);
        assert!((background.intercept - 5.0).abs() < 0.5);
        let fit = MultiGaussianFitter::default()
            .fit(&spec, &window, &background, 1)
            .unwrap();
        assert_eq!(fit.len(), 1);
        let peak = fit.peaks[0];
        assert!((peak.position - 100.0).abs() < 0.5);
        assert!((peak.fwhm - 2.35 * 3.0).abs() < 0.05 * 2.35 * 3.0);
        let expected = 500.0 * 3.0 * (2.0 * std::f64::consts::PI).sqrt();
        assert!((peak.integral - expected).abs() / expected < 0.02);
        assert!((peak.integral_uncertainty - peak.integral.sqrt()).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_seeded_peaks_are_sorted() {
        let truth = [(300.0, 70.0, 2.5), (450.0, 85.0, 3.0), (250.0, 100.0, 2.5)];
        let spec = synthetic(&truth, 2.0, 200);
        let window = Window::new(60.0, 110.0, 10);
        let background = BackgroundModel::fit(&spec, &window);
        // seeds deliberately in descending order
        let seeds = [
            GaussianComponent::new(200.0, 101.0, 3.0),
            GaussianComponent::new(200.0, 84.0, 3.0),
            GaussianComponent::new(200.0, 71.0, 3.0),
        ];
        let fit = MultiGaussianFitter::default()
            .fit_seeded(&spec, &window, &background, &seeds)
            .unwrap();
        assert_eq!(fit.len(), 3);
        for pair in fit.peaks.windows(2) {
            assert!(pair[0].position < pair[1].position, "{:?}", fit.peaks);
        }
        for (peak, mu) in fit.peaks.iter().zip([70.0, 85.0, 100.0]) {
            assert!((peak.position - mu).abs() < 0.5, "{:?}", fit.peaks);
        }
    }

    #[test_log::test]
    fn test_identical_seeds_keep_every_component() {
        let spec = synthetic(&[(400.0, 100.0, 3.0)], 5.0, 200);
        let window = Window::new(85.0, 115.0, 5);
        let background = BackgroundModel::fit(&spec, &window);
        let fit = MultiGaussianFitter::default()
            .fit(&spec, &window, &background, 3)
            .unwrap();
        assert_eq!(fit.peaks.len(), 3);
        for pair in fit.peaks.windows(2) {
            assert!(pair[0].position <= pair[1].position);
        }
    }

    #[test]
    fn test_rejects_bad_requests() {
        let spec = synthetic(&[(400.0, 100.0, 3.0)], 5.0, 200);
        let window = Window::new(85.0, 115.0, 5);
        let fitter = MultiGaussianFitter::default();
        let bg = BackgroundLine::default();
        assert_eq!(
            fitter.fit(&spec, &window, &bg, 0),
            Err(FitError::InvalidPeakCount(0))
        );
        assert_eq!(
            fitter.fit(&spec, &window, &bg, 11),
            Err(FitError::InvalidPeakCount(11))
        );
        assert!(matches!(
            fitter.fit(&spec, &Window::new(500.0, 600.0, 5), &bg, 1),
            Err(FitError::EmptyWindow { .. })
        ));
    }
}
