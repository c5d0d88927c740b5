//! Monotone rational quadratic splines (Durkan et al., neural spline
//! flows). The spline acts on `[-interval, interval]` and is the identity
//! outside, so boundary knot derivatives are pinned to 1.

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::params::ParamLeaves;

pub(crate) fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

pub(crate) fn softplus_inv(y: f64) -> f64 {
    (y.exp() - 1.0).ln()
}

/// Softmax blended with a uniform component so no bin can collapse to
/// zero width.
fn adjusted_softmax(v: &[f64], adjust: f64) -> Vec<f64> {
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = v.iter().map(|&x| (x - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    let n = v.len() as f64;
    exps.iter()
        .map(|&e| (e / total + adjust / n) / (1.0 + adjust))
        .collect()
}

/// Processed knot positions and derivatives of one scalar spline.
#[derive(Debug, Clone)]
pub(crate) struct SplineKnots {
    x_pos: Vec<f64>,
    y_pos: Vec<f64>,
    derivs: Vec<f64>,
    interval: f64,
}

impl SplineKnots {
    /// Build knots from unconstrained parameters: `widths` and `heights`
    /// of length `K` (bins), `derivs` of length `K - 1` (interior knots).
    pub fn from_unconstrained(
        widths: &[f64],
        heights: &[f64],
        derivs: &[f64],
        interval: f64,
        min_derivative: f64,
        softmax_adjust: f64,
    ) -> Result<Self> {
        let bins = widths.len();
        if bins < 2 || heights.len() != bins || derivs.len() != bins - 1 {
            return Err(FlowError::Config(format!(
                "spline expects widths/heights of equal length >= 2 and one fewer \
                 derivative, got {}/{}/{}",
                widths.len(),
                heights.len(),
                derivs.len()
            )));
        }
        if !(interval.is_finite() && interval > 0.0) {
            return Err(FlowError::Config(format!(
                "spline interval must be positive and finite, got {interval}"
            )));
        }
        let positions = |unconstrained: &[f64]| {
            let fractions = adjusted_softmax(unconstrained, softmax_adjust);
            let mut pos = Vec::with_capacity(bins + 1);
            let mut acc = -interval;
            pos.push(acc);
            for f in &fractions {
                acc += f * 2.0 * interval;
                pos.push(acc);
            }
            // Pin the last knot exactly to the boundary.
            pos[bins] = interval;
            pos
        };
        let mut d = Vec::with_capacity(bins + 1);
        d.push(1.0);
        for &u in derivs {
            d.push(softplus(u) + min_derivative);
        }
        d.push(1.0);
        Ok(Self {
            x_pos: positions(widths),
            y_pos: positions(heights),
            derivs: d,
            interval,
        })
    }

    fn bin(&self, pos: &[f64], v: f64) -> usize {
        // Binary search over the knot positions, clamped to a valid bin.
        let mut lo = 0usize;
        let mut hi = pos.len() - 1;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if v < pos[mid] {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        lo
    }

    /// `(y, log d y / d x)` at a scalar `x`; identity outside the interval.
    pub fn forward(&self, x: f64) -> (f64, f64) {
        if x.abs() >= self.interval {
            return (x, 0.0);
        }
        let k = self.bin(&self.x_pos, x);
        let (xk, xk1) = (self.x_pos[k], self.x_pos[k + 1]);
        let (yk, yk1) = (self.y_pos[k], self.y_pos[k + 1]);
        let (dk, dk1) = (self.derivs[k], self.derivs[k + 1]);
        let s = (yk1 - yk) / (xk1 - xk);
        let xi = (x - xk) / (xk1 - xk);
        let xi1 = 1.0 - xi;
        let den = s + (dk1 + dk - 2.0 * s) * xi * xi1;
        let y = yk + (yk1 - yk) * (s * xi * xi + dk * xi * xi1) / den;
        let grad = s * s * (dk1 * xi * xi + 2.0 * s * xi * xi1 + dk * xi1 * xi1) / (den * den);
        (y, grad.ln())
    }

    /// `(x, log d y / d x at x)` at a scalar `y`; identity outside.
    pub fn inverse(&self, y: f64) -> (f64, f64) {
        if y.abs() >= self.interval {
            return (y, 0.0);
        }
        let k = self.bin(&self.y_pos, y);
        let (xk, xk1) = (self.x_pos[k], self.x_pos[k + 1]);
        let (yk, yk1) = (self.y_pos[k], self.y_pos[k + 1]);
        let (dk, dk1) = (self.derivs[k], self.derivs[k + 1]);
        let s = (yk1 - yk) / (xk1 - xk);
        let dy = y - yk;
        let c2 = dk1 + dk - 2.0 * s;
        let a = (yk1 - yk) * (s - dk) + dy * c2;
        let b = (yk1 - yk) * dk - dy * c2;
        let c = -s * dy;
        let xi = 2.0 * c / (-b - (b * b - 4.0 * a * c).sqrt());
        let x = xk + xi * (xk1 - xk);
        let xi1 = 1.0 - xi;
        let den = s + c2 * xi * xi1;
        let grad = s * s * (dk1 * xi * xi + 2.0 * s * xi * xi1 + dk * xi1 * xi1) / (den * den);
        (x, grad.ln())
    }
}

/// Scalar-shape rational quadratic spline bijection.
///
/// Vectorize with [`Vmap`](crate::bijections::Vmap) to act elementwise on
/// a vector, as the spline-based flow presets do.
#[derive(Debug, Clone)]
pub struct RationalQuadraticSpline {
    knots: usize,
    interval: f64,
    min_derivative: f64,
    softmax_adjust: f64,
    widths: ArrayD<f64>,
    heights: ArrayD<f64>,
    derivs: ArrayD<f64>,
    shape: Vec<usize>,
}

impl RationalQuadraticSpline {
    /// Identity-initialized spline with `knots` bins on
    /// `[-interval, interval]`.
    pub fn new(knots: usize, interval: f64) -> Result<Self> {
        let widths = ArrayD::zeros(IxDyn(&[knots]));
        let heights = ArrayD::zeros(IxDyn(&[knots]));
        // softplus(u) + min_derivative == 1 makes the init exactly linear.
        let derivs = ArrayD::from_elem(IxDyn(&[knots.saturating_sub(1)]), softplus_inv(1.0 - 1e-3));
        Self::with_params(widths, heights, derivs, interval)
    }

    /// Spline from unconstrained parameter arrays.
    pub fn with_params(
        widths: ArrayD<f64>,
        heights: ArrayD<f64>,
        derivs: ArrayD<f64>,
        interval: f64,
    ) -> Result<Self> {
        let spline = Self {
            knots: widths.len(),
            interval,
            min_derivative: 1e-3,
            softmax_adjust: 1e-2,
            widths,
            heights,
            derivs,
            shape: Vec::new(),
        };
        spline.knot_positions()?;
        Ok(spline)
    }

    pub fn knots(&self) -> usize {
        self.knots
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    fn knot_positions(&self) -> Result<SplineKnots> {
        let as_slice = |a: &ArrayD<f64>, name: &str| -> Result<Vec<f64>> {
            if a.ndim() != 1 {
                return Err(FlowError::Internal(format!(
                    "spline `{name}` must be rank-1, got rank {}",
                    a.ndim()
                )));
            }
            Ok(a.iter().cloned().collect())
        };
        SplineKnots::from_unconstrained(
            &as_slice(&self.widths, "widths")?,
            &as_slice(&self.heights, "heights")?,
            &as_slice(&self.derivs, "derivs")?,
            self.interval,
            self.min_derivative,
            self.softmax_adjust,
        )
    }
}

impl Bijection for RationalQuadraticSpline {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        Ok(self.transform_and_log_det(x, condition)?.0)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        Ok(self.inverse_and_log_det(y, condition)?.0)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, x)?;
        check_condition(None, condition)?;
        let (y, log_det) = self.knot_positions()?.forward(x[IxDyn(&[])]);
        Ok((ArrayD::from_elem(IxDyn(&[]), y), log_det))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, y)?;
        check_condition(None, condition)?;
        let (x, fwd_log_det) = self.knot_positions()?.inverse(y[IxDyn(&[])]);
        Ok((ArrayD::from_elem(IxDyn(&[]), x), -fwd_log_det))
    }
}

impl ParamLeaves for RationalQuadraticSpline {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("widths", self.widths.view());
        f("heights", self.heights.view());
        f("derivs", self.derivs.view());
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            knots: self.knots,
            interval: self.interval,
            min_derivative: self.min_derivative,
            softmax_adjust: self.softmax_adjust,
            widths: f("widths", self.widths.view()),
            heights: f("heights", self.heights.view()),
            derivs: f("derivs", self.derivs.view()),
            shape: self.shape.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_spline(seed: u64) -> RationalQuadraticSpline {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut draw = |n: usize| {
            Array::from_iter((0..n).map(|_| rng.gen_range(-1.0..1.0))).into_dyn()
        };
        RationalQuadraticSpline::with_params(draw(6), draw(6), draw(5), 3.0).unwrap()
    }

    fn scalar(v: f64) -> ArrayD<f64> {
        ArrayD::from_elem(IxDyn(&[]), v)
    }

    #[test]
    fn test_identity_init() {
        let b = RationalQuadraticSpline::new(8, 4.0).unwrap();
        for x in [-3.9, -1.0, 0.0, 0.5, 3.9] {
            let (y, ld) = b.transform_and_log_det(&scalar(x), None).unwrap();
            assert_abs_diff_eq!(y[IxDyn(&[])], x, epsilon = 1e-8);
            assert_abs_diff_eq!(ld, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_round_trip() {
        let b = random_spline(3);
        for x in [-2.9, -1.3, 0.0, 0.4, 2.2, 5.0, -8.0] {
            let (y, ld) = b.transform_and_log_det(&scalar(x), None).unwrap();
            let (back, ld_inv) = b.inverse_and_log_det(&y, None).unwrap();
            assert_abs_diff_eq!(back[IxDyn(&[])], x, epsilon = 1e-8);
            assert_abs_diff_eq!(ld_inv, -ld, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_identity_outside_interval() {
        let b = random_spline(5);
        let (y, ld) = b.transform_and_log_det(&scalar(4.5), None).unwrap();
        assert_eq!(y[IxDyn(&[])], 4.5);
        assert_eq!(ld, 0.0);
    }

    #[test]
    fn test_monotone_increasing() {
        let b = random_spline(7);
        let mut prev = f64::NEG_INFINITY;
        let mut x = -3.0;
        while x <= 3.0 {
            let y = b.transform(&scalar(x), None).unwrap()[IxDyn(&[])];
            assert!(y > prev, "spline must be strictly increasing");
            prev = y;
            x += 0.05;
        }
    }

    #[test]
    fn test_log_det_matches_numeric() {
        let b = random_spline(11);
        let eps = 1e-6;
        for x in [-2.5, -0.7, 0.1, 1.9] {
            let (_, ld) = b.transform_and_log_det(&scalar(x), None).unwrap();
            let yp = b.transform(&scalar(x + eps), None).unwrap()[IxDyn(&[])];
            let ym = b.transform(&scalar(x - eps), None).unwrap()[IxDyn(&[])];
            let numeric = ((yp - ym) / (2.0 * eps)).ln();
            assert_abs_diff_eq!(ld, numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_rejects_too_few_knots() {
        assert!(RationalQuadraticSpline::new(1, 4.0).is_err());
    }
}
