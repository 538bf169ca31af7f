//! Absolute detection efficiency as a function of channel.
//!
//! The curve is built from three pieces. Below the first breakpoint a parabola
//! `A(x - B)^2 + C` is fitted to the points plus their mirror images across the
//! breakpoint, which pins the vertex near the breakpoint when few points exist.
//! Above the second breakpoint a hyperbola `A / (x + B) + C` is fitted. Between the
//! two a straight line joins the branch values, so the curve is continuous but not
//! smooth.
use log::{debug, warn};

use super::{energy::CalibrationModel, Branch, CalibrationError};
use crate::fitting::{inverse_variance_weights, polyfit, FitModel, LevenbergMarquardt, LinearFit};
use crate::io::TableRow;
use crate::spectrum::AxisDomain;

/// Minimum number of measured points below the first breakpoint
pub const LOW_BRANCH_POINTS: usize = 2;
/// Minimum number of measured points at or above the second breakpoint
pub const HIGH_BRANCH_POINTS: usize = 3;
/// Number of samples in [`EfficiencyModel::error_band`]
pub const BAND_SAMPLES: usize = 100;

const RECONCILE_NUDGE: f64 = 0.01;
const OFFSET_GRID: usize = 121;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EfficiencyPoint {
    pub x: f64,
    pub efficiency: f64,
    pub uncertainty: f64,
}

impl EfficiencyPoint {
    pub fn new(x: f64, efficiency: f64, uncertainty: f64) -> Self {
        Self {
            x,
            efficiency,
            uncertainty,
        }
    }
}

/// Measured efficiencies sorted by position, tagged with the axis they are expressed on.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EfficiencySet {
    points: Vec<EfficiencyPoint>,
    domain: AxisDomain,
}

impl EfficiencySet {
    pub fn new(domain: AxisDomain) -> Self {
        Self {
            points: Vec::new(),
            domain,
        }
    }

    pub fn from_rows(rows: &[TableRow], domain: AxisDomain) -> Self {
        let mut set = Self::new(domain);
        for row in rows {
            set.insert(EfficiencyPoint::new(row.x, row.value, row.uncertainty));
        }
        set
    }

    pub fn insert(&mut self, point: EfficiencyPoint) {
        let i = self.points.partition_point(|p| p.x <= point.x);
        self.points.insert(i, point);
    }

    pub fn points(&self) -> &[EfficiencyPoint] {
        &self.points
    }

    pub fn domain(&self) -> AxisDomain {
        self.domain
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Express the points on the channel axis, inverting `calibration` when they
    /// were given in energy.
    pub fn to_channel_domain(&self, calibration: &CalibrationModel) -> Self {
        match self.domain {
            AxisDomain::Channel => self.clone(),
            AxisDomain::Energy => {
                let mut set = Self::new(AxisDomain::Channel);
                for p in self.points.iter() {
                    set.insert(EfficiencyPoint::new(
                        calibration.to_channel(p.x),
                        p.efficiency,
                        p.uncertainty,
                    ));
                }
                set
            }
        }
    }

    /// Linear interpolation between neighbouring points, extrapolating the
    /// outermost segments past either end.
    pub fn interpolate(&self, x: f64) -> Option<f64> {
        match self.points.len() {
            0 => None,
            1 => Some(self.points[0].efficiency),
            n => {
                let i = self.points.partition_point(|p| p.x <= x).clamp(1, n - 1);
                let (a, b) = (&self.points[i - 1], &self.points[i]);
                if b.x == a.x {
                    return Some(a.efficiency);
                }
                let t = (x - a.x) / (b.x - a.x);
                Some(a.efficiency + t * (b.efficiency - a.efficiency))
            }
        }
    }

    pub fn rows(&self) -> Vec<TableRow> {
        self.points
            .iter()
            .map(|p| TableRow::new(p.x, p.efficiency, p.uncertainty))
            .collect()
    }

    fn weights(points: &[EfficiencyPoint]) -> Option<Vec<f64>> {
        let sigmas: Vec<f64> = points.iter().map(|p| p.uncertainty).collect();
        inverse_variance_weights(&sigmas)
    }
}

/// `A(x - B)^2 + C`
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LowBranch {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl LowBranch {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        let d = x - self.b;
        self.a * d * d + self.c
    }

    /// Convert ascending polynomial coefficients `c0 + c1 x + c2 x^2` to vertex form.
    /// A vanishing quadratic term leaves a constant at the value of the polynomial at `anchor`.
    fn from_polynomial(coefficients: &[f64], anchor: f64) -> Self {
        let c0 = coefficients.first().copied().unwrap_or(0.0);
        let c1 = coefficients.get(1).copied().unwrap_or(0.0);
        let c2 = coefficients.get(2).copied().unwrap_or(0.0);
        if c2.abs() <= f64::EPSILON * (c0.abs() + c1.abs()).max(1.0) {
            return Self::new(0.0, anchor, c0 + c1 * anchor);
        }
        let b = -c1 / (2.0 * c2);
        Self::new(c2, b, c0 - c2 * b * b)
    }
}

/// `A / (x + B) + C`
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HighBranch {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl HighBranch {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.a / (x + self.b) + self.c
    }
}

struct Hyperbola;

impl FitModel for Hyperbola {
    fn parameter_count(&self) -> usize {
        3
    }

    fn value(&self, x: f64, params: &[f64]) -> f64 {
        params[0] / (x + params[1]) + params[2]
    }

    fn gradient(&self, x: f64, params: &[f64], gradient: &mut [f64]) {
        let u = 1.0 / (x + params[1]);
        gradient[0] = u;
        gradient[1] = -params[0] * u * u;
        gradient[2] = 1.0;
    }
}

/// One sample of the residual band around the efficiency curve
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BandSample {
    pub x: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EfficiencyModel {
    pub low: LowBranch,
    pub high: HighBranch,
    pub breakpoints: (f64, f64),
    pub join_slope: f64,
    pub join_intercept: f64,
    /// `sqrt(sum of squared residuals) / point count` over the points the model was built from
    pub residual: f64,
    /// Where the two branch asymptotes would meet, `A2 / (C1 - C2) - B2`
    pub reconciled_breakpoint: f64,
    /// The span of the points, for sampling the curve
    pub extent: (f64, f64),
}

impl EfficiencyModel {
    /// Stitch the branches together with a line from `low(p1)` to `high(p2)`.
    ///
    /// Fails with [`CalibrationError::DegenerateJoin`] when the branches share their
    /// constant term, since their meeting point is then undefined.
    pub fn join(
        low: LowBranch,
        high: HighBranch,
        p1: f64,
        p2: f64,
    ) -> Result<Self, CalibrationError> {
        if !(p1 < p2) {
            return Err(CalibrationError::InvalidBreakpoints { low: p1, high: p2 });
        }
        let denominator = low.c - high.c;
        if denominator == 0.0 {
            return Err(CalibrationError::DegenerateJoin { constant: low.c });
        }
        let mut reconciled = high.a / denominator - high.b;
        if !reconciled.is_finite() {
            return Err(CalibrationError::DegenerateJoin { constant: low.c });
        }
        if reconciled == p1 {
            reconciled -= RECONCILE_NUDGE;
        }

        let (y1, y2) = (low.eval(p1), high.eval(p2));
        let join_slope = (y2 - y1) / (p2 - p1);
        let join_intercept = y1 - join_slope * p1;
        Ok(Self {
            low,
            high,
            breakpoints: (p1, p2),
            join_slope,
            join_intercept,
            residual: 0.0,
            reconciled_breakpoint: reconciled,
            extent: (p1, p2),
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        let (p1, p2) = self.breakpoints;
        if x < p1 {
            self.low.eval(x)
        } else if x <= p2 {
            self.join_slope * x + self.join_intercept
        } else {
            self.high.eval(x)
        }
    }

    /// Set the residual and sampling extent from the points the curve describes
    pub fn with_points(mut self, points: &[EfficiencyPoint]) -> Self {
        if points.is_empty() {
            return self;
        }
        let ss: f64 = points
            .iter()
            .map(|p| {
                let r = p.efficiency - self.eval(p.x);
                r * r
            })
            .sum();
        self.residual = ss.sqrt() / points.len() as f64;
        let lo = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let hi = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        self.extent = (lo, hi);
        self
    }

    fn sample_axis(&self, samples: usize) -> impl Iterator<Item = f64> {
        let (lo, hi) = self.extent;
        let start = lo - 0.01 * (hi - lo);
        let step = if samples > 1 {
            (hi - start) / (samples - 1) as f64
        } else {
            0.0
        };
        (0..samples).map(move |i| start + step * i as f64)
    }

    /// `(x, Eff(x))` pairs across the point extent
    pub fn curve(&self, samples: usize) -> Vec<(f64, f64)> {
        self.sample_axis(samples).map(|x| (x, self.eval(x))).collect()
    }

    /// The curve shifted down and up by the residual at [`BAND_SAMPLES`] positions
    pub fn error_band(&self) -> Vec<BandSample> {
        self.sample_axis(BAND_SAMPLES)
            .map(|x| {
                let y = self.eval(x);
                BandSample {
                    x,
                    lower: y - self.residual,
                    upper: y + self.residual,
                }
            })
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EfficiencyCalibrator {
    pub solver: LevenbergMarquardt,
}

impl EfficiencyCalibrator {
    pub fn new(solver: LevenbergMarquardt) -> Self {
        Self { solver }
    }

    pub fn fit_low(&self, points: &[EfficiencyPoint], p1: f64) -> Result<LowBranch, CalibrationError> {
        let below: Vec<EfficiencyPoint> = points.iter().filter(|p| p.x < p1).copied().collect();
        if below.len() < LOW_BRANCH_POINTS {
            return Err(CalibrationError::InsufficientEfficiencyPoints {
                branch: Branch::Low,
                needed: LOW_BRANCH_POINTS,
                found: below.len(),
            });
        }
        let mirrored: Vec<EfficiencyPoint> = below
            .iter()
            .map(|p| EfficiencyPoint::new(2.0 * p1 - p.x, p.efficiency, p.uncertainty))
            .collect();
        let samples: Vec<EfficiencyPoint> = below.into_iter().chain(mirrored).collect();
        let xs: Vec<f64> = samples.iter().map(|p| p.x).collect();
        let ys: Vec<f64> = samples.iter().map(|p| p.efficiency).collect();
        let weights = EfficiencySet::weights(&samples);
        let coefficients = polyfit(&xs, &ys, weights.as_deref(), 2)?;
        Ok(LowBranch::from_polynomial(&coefficients, p1))
    }

    /// Seed the hyperbola by scanning the offset `B` and solving the remaining
    /// linear problem in `1 / (x + B)` for each, then refine all three parameters.
    pub fn fit_high(&self, points: &[EfficiencyPoint], p2: f64) -> Result<HighBranch, CalibrationError> {
        let above: Vec<EfficiencyPoint> = points.iter().filter(|p| p.x >= p2).copied().collect();
        if above.len() < HIGH_BRANCH_POINTS {
            return Err(CalibrationError::InsufficientEfficiencyPoints {
                branch: Branch::High,
                needed: HIGH_BRANCH_POINTS,
                found: above.len(),
            });
        }
        let xs: Vec<f64> = above.iter().map(|p| p.x).collect();
        let ys: Vec<f64> = above.iter().map(|p| p.efficiency).collect();
        let weights = EfficiencySet::weights(&above);

        let x_min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let x_max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let span = if x_max > x_min { x_max - x_min } else { 1.0 };

        let mut best: Option<(f64, LinearFit)> = None;
        for k in 0..OFFSET_GRID {
            let exponent = -3.0 + 6.0 * k as f64 / (OFFSET_GRID - 1) as f64;
            let offset = span * 10f64.powf(exponent) - x_min;
            let us: Vec<f64> = xs.iter().map(|x| 1.0 / (x + offset)).collect();
            let fit = LinearFit::fit_weighted(&us, &ys, weights.as_deref())?;
            if best.as_ref().map_or(true, |(_, b)| fit.chi2 < b.chi2) {
                best = Some((offset, fit));
            }
        }
        let (offset, seed) = best.ok_or(CalibrationError::InsufficientEfficiencyPoints {
            branch: Branch::High,
            needed: HIGH_BRANCH_POINTS,
            found: 0,
        })?;

        let outcome = self.solver.minimize(
            &Hyperbola,
            &xs,
            &ys,
            weights.as_deref(),
            &[seed.slope, offset, seed.intercept],
        );
        if !outcome.converged {
            warn!("High efficiency branch did not converge, using best parameters");
        }
        let p = &outcome.parameters;
        Ok(HighBranch::new(p[0], p[1], p[2]))
    }

    /// Build the full curve for `points` (channel domain) with breakpoints `p1 < p2`
    pub fn fit(
        &self,
        points: &EfficiencySet,
        p1: f64,
        p2: f64,
    ) -> Result<EfficiencyModel, CalibrationError> {
        if !(p1 < p2) {
            return Err(CalibrationError::InvalidBreakpoints { low: p1, high: p2 });
        }
        let low = self.fit_low(points.points(), p1)?;
        let high = self.fit_high(points.points(), p2)?;
        let model = EfficiencyModel::join(low, high, p1, p2)?.with_points(points.points());
        debug!(
            "Efficiency curve: low {:?}, high {:?}, join {:.3e}x + {:.3e}, residual {:.3e}",
            model.low, model.high, model.join_slope, model.join_intercept, model.residual
        );
        Ok(model)
    }
}
