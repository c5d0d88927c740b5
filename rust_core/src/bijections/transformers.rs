//! Elementwise transformers parameterized per element by a conditioner
//! network. `Coupling` and `MaskedAutoregressive` are generic over this
//! trait, so the same plumbing yields affine and spline variants.

use crate::bijections::spline::SplineKnots;
use crate::errors::{FlowError, Result};

/// A scalar bijection driven by a flat parameter slice.
///
/// `forward` returns `(y, log dy/dx)`; `inverse` returns `(x, log dy/dx at
/// x)`, the same quantity, so the caller chooses the sign.
pub trait Transformer: Send + Sync {
    /// Number of parameters consumed per element.
    fn num_params(&self) -> usize;

    fn forward(&self, x: f64, params: &[f64]) -> Result<(f64, f64)>;

    fn inverse(&self, y: f64, params: &[f64]) -> Result<(f64, f64)>;
}

fn check_params(expected: usize, params: &[f64]) -> Result<()> {
    if params.len() != expected {
        return Err(FlowError::Internal(format!(
            "transformer expected {expected} parameters, got {}",
            params.len()
        )));
    }
    Ok(())
}

/// Shift-and-scale transformer, `y = exp(clamped log_scale) * x + shift`.
///
/// The log-scale is clamped so an untrained conditioner cannot produce
/// overflowing scales.
#[derive(Debug, Clone)]
pub struct AffineTransformer {
    log_scale_clamp: f64,
}

impl Default for AffineTransformer {
    fn default() -> Self {
        Self {
            log_scale_clamp: 5.0,
        }
    }
}

impl AffineTransformer {
    pub fn new(log_scale_clamp: f64) -> Self {
        Self { log_scale_clamp }
    }

    fn log_scale(&self, raw: f64) -> f64 {
        raw.clamp(-self.log_scale_clamp, self.log_scale_clamp)
    }
}

impl Transformer for AffineTransformer {
    fn num_params(&self) -> usize {
        2
    }

    fn forward(&self, x: f64, params: &[f64]) -> Result<(f64, f64)> {
        check_params(2, params)?;
        let (shift, log_scale) = (params[0], self.log_scale(params[1]));
        Ok((log_scale.exp() * x + shift, log_scale))
    }

    fn inverse(&self, y: f64, params: &[f64]) -> Result<(f64, f64)> {
        check_params(2, params)?;
        let (shift, log_scale) = (params[0], self.log_scale(params[1]));
        Ok(((y - shift) * (-log_scale).exp(), log_scale))
    }
}

/// Rational quadratic spline transformer with `knots` bins on
/// `[-interval, interval]`; consumes `3 * knots - 1` parameters per
/// element (widths, heights, interior derivatives).
#[derive(Debug, Clone)]
pub struct SplineTransformer {
    knots: usize,
    interval: f64,
    min_derivative: f64,
    softmax_adjust: f64,
}

impl SplineTransformer {
    pub fn new(knots: usize, interval: f64) -> Result<Self> {
        if knots < 2 {
            return Err(FlowError::Config(format!(
                "spline transformer needs at least 2 knots, got {knots}"
            )));
        }
        if !(interval.is_finite() && interval > 0.0) {
            return Err(FlowError::Config(format!(
                "spline interval must be positive and finite, got {interval}"
            )));
        }
        Ok(Self {
            knots,
            interval,
            min_derivative: 1e-3,
            softmax_adjust: 1e-2,
        })
    }

    fn knot_positions(&self, params: &[f64]) -> Result<SplineKnots> {
        let k = self.knots;
        SplineKnots::from_unconstrained(
            &params[..k],
            &params[k..2 * k],
            &params[2 * k..],
            self.interval,
            self.min_derivative,
            self.softmax_adjust,
        )
    }
}

impl Default for SplineTransformer {
    fn default() -> Self {
        Self {
            knots: 8,
            interval: 4.0,
            min_derivative: 1e-3,
            softmax_adjust: 1e-2,
        }
    }
}

impl Transformer for SplineTransformer {
    fn num_params(&self) -> usize {
        3 * self.knots - 1
    }

    fn forward(&self, x: f64, params: &[f64]) -> Result<(f64, f64)> {
        check_params(self.num_params(), params)?;
        Ok(self.knot_positions(params)?.forward(x))
    }

    fn inverse(&self, y: f64, params: &[f64]) -> Result<(f64, f64)> {
        check_params(self.num_params(), params)?;
        Ok(self.knot_positions(params)?.inverse(y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_affine_transformer_round_trip() {
        let t = AffineTransformer::default();
        let params = [0.7, -0.4];
        let (y, ld) = t.forward(2.0, &params).unwrap();
        assert_abs_diff_eq!(y, (-0.4f64).exp() * 2.0 + 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(ld, -0.4, epsilon = 1e-12);
        let (x, ld_inv) = t.inverse(y, &params).unwrap();
        assert_abs_diff_eq!(x, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ld_inv, ld, epsilon = 1e-12);
    }

    #[test]
    fn test_affine_transformer_clamps_scale() {
        let t = AffineTransformer::default();
        let (_, ld) = t.forward(1.0, &[0.0, 40.0]).unwrap();
        assert_eq!(ld, 5.0);
    }

    #[test]
    fn test_spline_transformer_round_trip() {
        let t = SplineTransformer::new(6, 3.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let params: Vec<f64> = (0..t.num_params()).map(|_| rng.gen_range(-1.0..1.0)).collect();
        for x in [-2.5, 0.0, 0.8, 4.0] {
            let (y, ld) = t.forward(x, &params).unwrap();
            let (back, ld_inv) = t.inverse(y, &params).unwrap();
            assert_abs_diff_eq!(back, x, epsilon = 1e-8);
            assert_abs_diff_eq!(ld_inv, ld, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_param_count_mismatch_is_rejected() {
        let t = SplineTransformer::default();
        assert!(t.forward(0.0, &[0.0; 3]).is_err());
    }
}
