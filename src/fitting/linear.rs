use nalgebra::{DMatrix, DVector};

use super::FitError;

/// A straight line `y = slope * x + intercept` fitted by (weighted) least squares.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub slope_error: f64,
    pub intercept_error: f64,
    /// Weighted sum of squared residuals
    pub chi2: f64,
    pub points: usize,
}

impl LinearFit {
    /// Unweighted least squares.
    pub fn fit(xs: &[f64], ys: &[f64]) -> Result<Self, FitError> {
        Self::fit_weighted(xs, ys, None)
    }

    /// Least squares with optional per-point weights, usually `1 / sigma^2`.
    ///
    /// When every sample shares one x the slope is undetermined; the result is then
    /// the flat line through the weighted mean of the y values.
    pub fn fit_weighted(xs: &[f64], ys: &[f64], weights: Option<&[f64]>) -> Result<Self, FitError> {
        if xs.len() != ys.len() {
            return Err(FitError::MismatchedSamples(xs.len(), ys.len()));
        }
        if let Some(w) = weights {
            if w.len() != xs.len() {
                return Err(FitError::MismatchedSamples(xs.len(), w.len()));
            }
        }
        if xs.is_empty() {
            return Err(FitError::TooFewPoints {
                needed: 1,
                found: 0,
            });
        }

        let weight = |i: usize| weights.map(|w| w[i]).unwrap_or(1.0);
        let (mut s, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (i, (x, y)) in xs.iter().zip(ys.iter()).enumerate() {
            let w = weight(i);
            s += w;
            sx += w * x;
            sy += w * y;
            sxx += w * x * x;
            sxy += w * x * y;
        }

        let delta = s * sxx - sx * sx;
        let (slope, intercept, slope_error, intercept_error) =
            if delta.abs() <= f64::EPSILON * (s * sxx).abs() {
                (0.0, sy / s, 0.0, (1.0 / s).sqrt())
            } else {
                (
                    (s * sxy - sx * sy) / delta,
                    (sxx * sy - sx * sxy) / delta,
                    (s / delta).abs().sqrt(),
                    (sxx / delta).abs().sqrt(),
                )
            };

        let chi2 = xs
            .iter()
            .zip(ys.iter())
            .enumerate()
            .map(|(i, (x, y))| {
                let r = y - (slope * x + intercept);
                weight(i) * r * r
            })
            .sum();

        Ok(Self {
            slope,
            intercept,
            slope_error,
            intercept_error,
            chi2,
            points: xs.len(),
        })
    }

    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Fit a polynomial of `degree` by (weighted) least squares, returning the
/// coefficients in ascending order of power.
///
/// The normal system is solved by SVD so rank deficient samples (fewer distinct x
/// values than coefficients) yield the minimum-norm solution instead of failing.
pub fn polyfit(
    xs: &[f64],
    ys: &[f64],
    weights: Option<&[f64]>,
    degree: usize,
) -> Result<Vec<f64>, FitError> {
    if xs.len() != ys.len() {
        return Err(FitError::MismatchedSamples(xs.len(), ys.len()));
    }
    if xs.is_empty() {
        return Err(FitError::TooFewPoints {
            needed: 1,
            found: 0,
        });
    }
    let n = xs.len();
    let k = degree + 1;
    let mut design = DMatrix::<f64>::zeros(n, k);
    let mut rhs = DVector::<f64>::zeros(n);
    for (i, (x, y)) in xs.iter().zip(ys.iter()).enumerate() {
        let w = weights.and_then(|w| w.get(i).copied()).unwrap_or(1.0).sqrt();
        let mut p = 1.0;
        for j in 0..k {
            design[(i, j)] = w * p;
            p *= x;
        }
        rhs[i] = w * y;
    }
    let svd = design.svd(true, true);
    let solution = svd
        .solve(&rhs, 1e-12)
        .map_err(|_| FitError::TooFewPoints { needed: k, found: n })?;
    Ok(solution.iter().copied().collect())
}
