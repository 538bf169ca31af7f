//! A Levenberg-Marquardt minimiser for small non-linear least squares problems.
//!
//! Non-convergence is not an error: the solver always hands back the best parameters
//! it visited and flags whether the stopping criteria were met.
use log::{trace, warn};
use nalgebra::{DMatrix, DVector};

/// A model `y = f(x; p)` with an analytic gradient in the parameters.
pub trait FitModel {
    fn parameter_count(&self) -> usize;

    fn value(&self, x: f64, params: &[f64]) -> f64;

    /// Write `df/dp_j` at `x` into `gradient[j]`
    fn gradient(&self, x: f64, params: &[f64], gradient: &mut [f64]);
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub parameters: Vec<f64>,
    /// Weighted sum of squared residuals at `parameters`
    pub chi2: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    /// Relative improvement in chi-square below which the fit is considered converged
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

const MAX_LAMBDA: f64 = 1e16;
const MIN_LAMBDA: f64 = 1e-15;

impl LevenbergMarquardt {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            ..Default::default()
        }
    }

    fn chi2<M: FitModel>(
        model: &M,
        xs: &[f64],
        ys: &[f64],
        weights: Option<&[f64]>,
        params: &[f64],
    ) -> f64 {
        xs.iter()
            .zip(ys.iter())
            .enumerate()
            .map(|(i, (x, y))| {
                let w = weights.map(|w| w[i]).unwrap_or(1.0);
                let r = y - model.value(*x, params);
                w * r * r
            })
            .sum()
    }

    /// Minimise the (weighted) squared residuals of `model` over the samples,
    /// starting from `initial`.
    pub fn minimize<M: FitModel>(
        &self,
        model: &M,
        xs: &[f64],
        ys: &[f64],
        weights: Option<&[f64]>,
        initial: &[f64],
    ) -> FitOutcome {
        let n = xs.len().min(ys.len());
        let p = model.parameter_count().min(initial.len());
        let mut params = initial[..p].to_vec();
        let mut chi2 = Self::chi2(model, &xs[..n], &ys[..n], weights, &params);

        if n == 0 || p == 0 || !chi2.is_finite() {
            warn!("Skipping fit with {n} samples, {p} parameters and initial chi2 {chi2}");
            return FitOutcome {
                parameters: params,
                chi2,
                iterations: 0,
                converged: false,
            };
        }

        let mut lambda = self.initial_lambda;
        let mut gradient = vec![0.0; p];
        let mut jacobian = DMatrix::<f64>::zeros(n, p);
        let mut residuals = DVector::<f64>::zeros(n);
        let mut converged = false;
        let mut iterations = 0;

        'outer: while iterations < self.max_iterations {
            iterations += 1;
            for i in 0..n {
                let sw = weights.map(|w| w[i]).unwrap_or(1.0).sqrt();
                model.gradient(xs[i], &params, &mut gradient);
                for (j, g) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = sw * g;
                }
                residuals[i] = sw * (ys[i] - model.value(xs[i], &params));
            }
            let jtj = jacobian.transpose() * &jacobian;
            let jtr = jacobian.transpose() * &residuals;

            loop {
                let mut damped = jtj.clone();
                for j in 0..p {
                    damped[(j, j)] += lambda * jtj[(j, j)].max(1e-12);
                }
                let step = match damped.cholesky() {
                    Some(chol) => chol.solve(&jtr),
                    None => {
                        lambda *= 10.0;
                        if lambda > MAX_LAMBDA {
                            break 'outer;
                        }
                        continue;
                    }
                };
                let trial: Vec<f64> = params.iter().zip(step.iter()).map(|(a, d)| a + d).collect();
                let trial_chi2 = Self::chi2(model, &xs[..n], &ys[..n], weights, &trial);
                if trial_chi2.is_finite() && trial_chi2 < chi2 {
                    let improvement = (chi2 - trial_chi2) / chi2.max(f64::MIN_POSITIVE);
                    let step_norm = step.norm();
                    let scale = params.iter().map(|v| v * v).sum::<f64>().sqrt();
                    params = trial;
                    chi2 = trial_chi2;
                    lambda = (lambda / 10.0).max(MIN_LAMBDA);
                    trace!("Iteration {iterations}: chi2 {chi2:.6e}, lambda {lambda:.1e}");
                    if improvement < self.tolerance
                        || step_norm <= self.tolerance * (scale + self.tolerance)
                    {
                        converged = true;
                        break 'outer;
                    }
                    break;
                } else {
                    lambda *= 10.0;
                    if lambda > MAX_LAMBDA {
                        // No direction reduces chi-square any further
                        converged = true;
                        break 'outer;
                    }
                }
            }
        }

        if !converged {
            warn!("Fit did not converge after {iterations} iterations (chi2 {chi2:.6e})");
        }

        FitOutcome {
            parameters: params,
            chi2,
            iterations,
            converged,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Exponential;

    impl FitModel for Exponential {
        fn parameter_count(&self) -> usize {
            2
        }

        fn value(&self, x: f64, params: &[f64]) -> f64 {
            params[0] * (params[1] * x).exp()
        }

        fn gradient(&self, x: f64, params: &[f64], gradient: &mut [f64]) {
            let e = (params[1] * x).exp();
            gradient[0] = e;
            gradient[1] = params[0] * x * e;
        }
    }

    #[test_log::test]
    fn test_recovers_exponential() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * (-1.5 * x).exp()).collect();
        let outcome = LevenbergMarquardt::default().minimize(&Exponential, &xs, &ys, None, &[1.0, -0.5]);
        assert!(outcome.converged);
        assert!((outcome.parameters[0] - 3.0).abs() < 1e-6);
        assert!((outcome.parameters[1] + 1.5).abs() < 1e-6);
        assert!(outcome.chi2 < 1e-12);
    }

    #[test]
    fn test_empty_samples_return_initial() {
        let outcome = LevenbergMarquardt::default().minimize(&Exponential, &[], &[], None, &[1.0, 2.0]);
        assert!(!outcome.converged);
        assert_eq!(outcome.parameters, vec![1.0, 2.0]);
    }
}
