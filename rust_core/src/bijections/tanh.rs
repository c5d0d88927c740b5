//! Tanh with matched-slope linear tails.

use ndarray::{ArrayD, ArrayViewD};

use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::params::ParamLeaves;

/// `tanh(x)` on `[-max_val, max_val]`, continued linearly outside with the
/// slope of tanh at the cut point. Unlike plain tanh the image is all of
/// the reals, so the inverse is defined everywhere.
#[derive(Debug, Clone)]
pub struct LeakyTanh {
    max_val: f64,
    tail_slope: f64,
    intercept: f64,
    shape: Vec<usize>,
}

impl LeakyTanh {
    pub fn new(max_val: f64, shape: &[usize]) -> Result<Self> {
        if !(max_val.is_finite() && max_val > 0.0) {
            return Err(FlowError::Config(format!(
                "max_val must be positive and finite, got {max_val}"
            )));
        }
        let tail_slope = 1.0 / max_val.cosh().powi(2);
        let intercept = max_val.tanh() - tail_slope * max_val;
        Ok(Self {
            max_val,
            tail_slope,
            intercept,
            shape: shape.to_vec(),
        })
    }

    pub fn max_val(&self) -> f64 {
        self.max_val
    }

    pub(crate) fn forward_scalar(&self, x: f64) -> (f64, f64) {
        if x.abs() >= self.max_val {
            let y = self.tail_slope * x + x.signum() * self.intercept;
            (y, self.tail_slope.ln())
        } else {
            // d tanh / dx = sech^2 = exp(-2 log cosh)
            (x.tanh(), -2.0 * x.cosh().ln())
        }
    }

    fn inverse_scalar(&self, y: f64) -> (f64, f64) {
        let cut = self.max_val.tanh();
        if y.abs() >= cut {
            let x = (y - y.signum() * self.intercept) / self.tail_slope;
            (x, self.tail_slope.ln())
        } else {
            let x = y.atanh();
            (x, -2.0 * x.cosh().ln())
        }
    }
}

impl Bijection for LeakyTanh {
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
        let mut log_det = 0.0;
        let y = x.mapv(|v| {
            let (out, lg) = self.forward_scalar(v);
            log_det += lg;
            out
        });
        Ok((y, log_det))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, y)?;
        check_condition(None, condition)?;
        let mut log_det = 0.0;
        let x = y.mapv(|v| {
            let (out, lg) = self.inverse_scalar(v);
            log_det += lg;
            out
        });
        Ok((x, -log_det))
    }
}

impl ParamLeaves for LeakyTanh {
    fn for_each_leaf(&self, _f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {}

    fn map_leaves(&self, _f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        self.clone()
    }
}
