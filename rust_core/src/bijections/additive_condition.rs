//! Condition-dependent shift.

use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};

use crate::bijections::coupling::flatten;
use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::nn::{Linear, Mlp};
use crate::params::ParamLeaves;

/// A module mapping a flattened condition to a shift vector.
pub trait Conditioner: Send + Sync {
    fn output(&self, condition: &Array1<f64>) -> Result<Array1<f64>>;
}

impl Conditioner for Linear {
    fn output(&self, condition: &Array1<f64>) -> Result<Array1<f64>> {
        self.forward(condition)
    }
}

impl Conditioner for Mlp {
    fn output(&self, condition: &Array1<f64>) -> Result<Array1<f64>> {
        self.forward(condition)
    }
}

/// `y = x + f(condition)`: a pure condition-dependent translation, so the
/// log-det is zero in both directions. Always conditional.
#[derive(Clone)]
pub struct AdditiveCondition<M> {
    module: M,
    shape: Vec<usize>,
    cond_shape: Vec<usize>,
}

impl<M: Conditioner> AdditiveCondition<M> {
    pub fn new(module: M, shape: &[usize], cond_shape: &[usize]) -> Self {
        Self {
            module,
            shape: shape.to_vec(),
            cond_shape: cond_shape.to_vec(),
        }
    }

    fn shift(&self, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        // check_condition has established the condition is present.
        let c = condition.ok_or_else(|| FlowError::Internal("condition missing".into()))?;
        let out = self.module.output(&flatten(c))?;
        let expected: usize = self.shape.iter().product();
        if out.len() != expected {
            return Err(FlowError::Internal(format!(
                "conditioner produced {} values for shape {:?}",
                out.len(),
                self.shape
            )));
        }
        ArrayD::from_shape_vec(IxDyn(&self.shape), out.to_vec())
            .map_err(|e| FlowError::Internal(e.to_string()))
    }
}

impl<M: Conditioner + 'static> Bijection for AdditiveCondition<M> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        Some(&self.cond_shape)
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, x)?;
        check_condition(self.cond_shape(), condition)?;
        Ok(x + &self.shift(condition)?)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, y)?;
        check_condition(self.cond_shape(), condition)?;
        Ok(y - &self.shift(condition)?)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        Ok((self.transform(x, condition)?, 0.0))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        Ok((self.inverse(y, condition)?, 0.0))
    }
}

impl<M: Conditioner + ParamLeaves> ParamLeaves for AdditiveCondition<M> {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        self.module
            .for_each_leaf(&mut |name, leaf| f(&format!("module.{name}"), leaf));
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            module: self
                .module
                .map_leaves(&mut |name, leaf| f(&format!("module.{name}"), leaf)),
            shape: self.shape.clone(),
            cond_shape: self.cond_shape.clone(),
        }
    }
}
