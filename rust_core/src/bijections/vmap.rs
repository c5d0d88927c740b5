//! Batched application of a bijection along a new leading axis.

use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis};
use rayon::prelude::*;

use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::params::{select_batch, ParamLeaves};

/// Which axis of each parameter leaf is the batch axis.
#[derive(Clone)]
pub enum InAxes {
    /// Every leaf is mapped along the same axis.
    All(usize),
    /// Per-leaf rule: `None` marks a leaf as shared across the batch.
    Rule(Arc<dyn Fn(&str, &ArrayViewD<'_, f64>) -> Option<usize> + Send + Sync>),
}

impl InAxes {
    fn axis_for(&self, name: &str, leaf: &ArrayViewD<'_, f64>) -> Option<usize> {
        match self {
            InAxes::All(ax) => Some(*ax),
            InAxes::Rule(rule) => rule(name, leaf),
        }
    }
}

/// Vectorizes a bijection over a batch axis, the way `jax.vmap` style
/// batching is usually emulated without a tracer: explicit slicing of the
/// input rows, the mapped parameter leaves, and (optionally) the
/// condition, with the per-row work distributed by rayon.
///
/// Exactly one of `in_axes` (mapped parameter leaves, batch size inferred
/// from them) and `axis_size` (shared parameters, explicit size) must be
/// given. `shape` gains a leading batch dim; with `in_axis_condition` the
/// condition gains one at that position too. The batch of per-row log-det
/// scalars is reduced by summation.
#[derive(Clone)]
pub struct Vmap<B> {
    child: B,
    in_axes: Option<InAxes>,
    in_axis_condition: Option<usize>,
    axis_size: usize,
    shape: Vec<usize>,
    cond_shape: Option<Vec<usize>>,
}

impl<B> Vmap<B>
where
    B: Bijection + ParamLeaves + Clone + Sync + 'static,
{
    pub fn new(
        child: B,
        in_axes: Option<InAxes>,
        axis_size: Option<usize>,
        in_axis_condition: Option<usize>,
    ) -> Result<Self> {
        let axis_size = match (&in_axes, axis_size) {
            (Some(_), Some(_)) => {
                return Err(FlowError::Config(
                    "in_axes and axis_size are mutually exclusive".into(),
                ))
            }
            (None, None) => {
                return Err(FlowError::Config(
                    "one of in_axes or axis_size is required".into(),
                ))
            }
            (None, Some(n)) => n,
            (Some(axes), None) => Self::infer_axis_size(&child, axes)?,
        };
        if axis_size == 0 {
            return Err(FlowError::Config("batch axis must be non-empty".into()));
        }
        let mut shape = vec![axis_size];
        shape.extend_from_slice(child.shape());
        let cond_shape = match (in_axis_condition, child.cond_shape()) {
            (None, cs) => cs.map(|c| c.to_vec()),
            (Some(_), None) => {
                return Err(FlowError::Config(
                    "in_axis_condition requires a conditional child".into(),
                ))
            }
            (Some(ax), Some(cs)) => {
                if ax > cs.len() {
                    return Err(FlowError::Config(format!(
                        "in_axis_condition {ax} out of range for condition rank {}",
                        cs.len()
                    )));
                }
                let mut with_batch = cs.to_vec();
                with_batch.insert(ax, axis_size);
                Some(with_batch)
            }
        };
        Ok(Self {
            child,
            in_axes,
            in_axis_condition,
            axis_size,
            shape,
            cond_shape,
        })
    }

    pub fn axis_size(&self) -> usize {
        self.axis_size
    }

    fn infer_axis_size(child: &B, axes: &InAxes) -> Result<usize> {
        let mut size: Option<usize> = None;
        let mut err: Option<FlowError> = None;
        child.for_each_leaf(&mut |name, leaf| {
            if err.is_some() {
                return;
            }
            let Some(ax) = axes.axis_for(name, &leaf) else {
                return;
            };
            if ax >= leaf.ndim() {
                err = Some(FlowError::Config(format!(
                    "in_axes maps axis {ax} of leaf `{name}` with rank {}",
                    leaf.ndim()
                )));
                return;
            }
            let n = leaf.shape()[ax];
            match size {
                None => size = Some(n),
                Some(prev) if prev != n => {
                    err = Some(FlowError::Config(format!(
                        "leaf `{name}` has batch size {n} along its mapped axis, expected {prev}"
                    )));
                }
                Some(_) => {}
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
        size.ok_or_else(|| {
            FlowError::Config("in_axes matched no leaves; give axis_size instead".into())
        })
    }

    fn row_child(&self, i: usize) -> B {
        match &self.in_axes {
            Some(axes) => select_batch(&self.child, &|name, leaf| axes.axis_for(name, leaf), i),
            None => self.child.clone(),
        }
    }

    fn row_condition<'a>(
        &self,
        condition: Option<&'a ArrayD<f64>>,
        i: usize,
    ) -> Option<ArrayD<f64>> {
        match (self.in_axis_condition, condition) {
            (Some(ax), Some(c)) => Some(c.index_axis(Axis(ax), i).to_owned()),
            (None, Some(c)) => Some(c.clone()),
            (_, None) => None,
        }
    }

    fn apply<F>(&self, v: &ArrayD<f64>, condition: Option<&ArrayD<f64>>, f: F) -> Result<(ArrayD<f64>, f64)>
    where
        F: Fn(&B, &ArrayD<f64>, Option<&ArrayD<f64>>) -> Result<(ArrayD<f64>, f64)> + Sync,
    {
        check_input(&self.shape, v)?;
        check_condition(self.cond_shape(), condition)?;
        let rows: Vec<(ArrayD<f64>, f64)> = (0..self.axis_size)
            .into_par_iter()
            .map(|i| {
                let child = self.row_child(i);
                let row = v.index_axis(Axis(0), i).to_owned();
                let cond = self.row_condition(condition, i);
                f(&child, &row, cond.as_ref())
            })
            .collect::<Result<_>>()?;
        let views: Vec<ArrayViewD<'_, f64>> = rows.iter().map(|(y, _)| y.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views)
            .map_err(|e| FlowError::Internal(e.to_string()))?;
        let log_det = rows.iter().map(|(_, ld)| ld).sum();
        Ok((stacked, log_det))
    }
}

impl<B> Bijection for Vmap<B>
where
    B: Bijection + ParamLeaves + Clone + Sync + 'static,
{
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.cond_shape.as_deref()
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
        self.apply(x, condition, |child, row, cond| {
            child.transform_and_log_det(row, cond)
        })
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        self.apply(y, condition, |child, row, cond| {
            child.inverse_and_log_det(row, cond)
        })
    }
}

impl<B: ParamLeaves + Clone> ParamLeaves for Vmap<B> {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        self.child
            .for_each_leaf(&mut |name, leaf| f(&format!("child.{name}"), leaf));
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            child: self
                .child
                .map_leaves(&mut |name, leaf| f(&format!("child.{name}"), leaf)),
            in_axes: self.in_axes.clone(),
            in_axis_condition: self.in_axis_condition,
            axis_size: self.axis_size,
            shape: self.shape.clone(),
            cond_shape: self.cond_shape.clone(),
        }
    }
}
