//! Invertible, differentiable transforms with exact Jacobian log
//! determinants, plus the composition operators that combine them.
//!
//! Every bijection declares a fixed target `shape` and an optional
//! conditioning `cond_shape`. Inputs are validated eagerly against those
//! contracts at every call boundary; numeric work only starts on
//! well-shaped data. Log determinants follow a single sign convention:
//! `transform_and_log_det` returns `log|det J_transform(x)|` and
//! `inverse_and_log_det` returns `log|det J_inverse(y)|`, so the two are
//! negatives of each other at corresponding points and either can be summed
//! directly along a chain.

pub mod additive_condition;
pub mod affine;
pub mod block_autoregressive;
pub mod chain;
pub mod coupling;
pub mod invert;
pub mod masked_autoregressive;
pub mod permute;
pub mod planar;
pub mod scan;
pub mod spline;
pub mod tanh;
pub mod transformers;
pub mod vmap;

use std::any::Any;

use ndarray::ArrayD;

use crate::errors::{FlowError, Result};

pub use additive_condition::{AdditiveCondition, Conditioner};
pub use affine::{Affine, TriangularAffine};
pub use block_autoregressive::BlockAutoregressiveNetwork;
pub use chain::{Chain, Then};
pub use coupling::Coupling;
pub use invert::Invert;
pub use masked_autoregressive::MaskedAutoregressive;
pub use permute::{Flip, Permute};
pub use planar::Planar;
pub use scan::Scan;
pub use spline::RationalQuadraticSpline;
pub use tanh::LeakyTanh;
pub use transformers::{AffineTransformer, SplineTransformer, Transformer};
pub use vmap::{InAxes, Vmap};

/// Blanket upcast to `Any`, used by `Chain::merge_chains` to recognize
/// nested chains without per-type boilerplate.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A diffeomorphism with a fixed shape contract.
///
/// `transform` and `inverse` are mutual inverses over the declared shape,
/// and the `_and_log_det` variants return exactly the same primal output as
/// their plain counterparts. Implementations are immutable once
/// constructed; the composition operators below wrap them without mutation.
pub trait Bijection: AsAny + Send + Sync {
    /// Target (output) shape.
    fn shape(&self) -> &[usize];

    /// Conditioning shape, or `None` for unconditional bijections.
    fn cond_shape(&self) -> Option<&[usize]>;

    /// Map `x` forward to `y`.
    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>>;

    /// Map `y` back to `x`.
    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>>;

    /// Forward map plus `log|det J_transform(x)|`.
    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)>;

    /// Inverse map plus `log|det J_inverse(y)|`.
    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)>;
}

// Type-erased bijections compose like concrete ones; flow presets return
// these. Note `Chain::merge_chains` must downcast through the deref'd
// trait object, never through the box itself.
impl Bijection for Box<dyn Bijection> {
    fn shape(&self) -> &[usize] {
        (**self).shape()
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        (**self).cond_shape()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        (**self).transform(x, condition)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        (**self).inverse(y, condition)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        (**self).transform_and_log_det(x, condition)
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        (**self).inverse_and_log_det(y, condition)
    }
}

/// Validate a primal input against the declared shape.
pub(crate) fn check_input(shape: &[usize], x: &ArrayD<f64>) -> Result<()> {
    if x.shape() != shape {
        return Err(FlowError::ShapeMismatch {
            expected: shape.to_vec(),
            got: x.shape().to_vec(),
        });
    }
    Ok(())
}

/// Validate presence and shape of a condition against `cond_shape`.
pub(crate) fn check_condition(
    cond_shape: Option<&[usize]>,
    condition: Option<&ArrayD<f64>>,
) -> Result<()> {
    match (cond_shape, condition) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(FlowError::ConditionMismatch(
            "condition given to an unconditional bijection".into(),
        )),
        (Some(_), None) => Err(FlowError::ConditionMismatch(
            "conditional bijection called without a condition".into(),
        )),
        (Some(cs), Some(c)) => {
            if c.shape() != cs {
                return Err(FlowError::ConditionMismatch(format!(
                    "expected condition shape {:?}, got {:?}",
                    cs,
                    c.shape()
                )));
            }
            Ok(())
        }
    }
}

/// Forward a condition to a child bijection: unconditional children never
/// see the parent's condition.
pub(crate) fn child_condition<'a>(
    child: &dyn Bijection,
    condition: Option<&'a ArrayD<f64>>,
) -> Option<&'a ArrayD<f64>> {
    if child.cond_shape().is_some() {
        condition
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Numerical checks shared by the bijection tests: finite-difference
    //! Jacobians and dense log-determinants.

    use ndarray::{Array1, Array2, ArrayD, IxDyn};

    use super::Bijection;

    /// Central-difference Jacobian of a rank-1 bijection's forward map.
    pub fn numeric_jacobian(
        bijection: &dyn Bijection,
        x: &Array1<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Array2<f64> {
        let dim = x.len();
        let eps = 1e-5;
        let mut jac = Array2::zeros((dim, dim));
        for j in 0..dim {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let yp = bijection
                .transform(&plus.into_dyn(), condition)
                .expect("forward at x+eps");
            let ym = bijection
                .transform(&minus.into_dyn(), condition)
                .expect("forward at x-eps");
            for i in 0..dim {
                jac[[i, j]] = (yp[IxDyn(&[i])] - ym[IxDyn(&[i])]) / (2.0 * eps);
            }
        }
        jac
    }

    /// log|det| of a dense matrix via LU with partial pivoting.
    pub fn log_abs_det(m: &Array2<f64>) -> f64 {
        let n = m.nrows();
        let mut a = m.clone();
        let mut log_det = 0.0;
        for k in 0..n {
            let mut pivot = k;
            for r in k + 1..n {
                if a[[r, k]].abs() > a[[pivot, k]].abs() {
                    pivot = r;
                }
            }
            if pivot != k {
                for c in 0..n {
                    let tmp = a[[k, c]];
                    a[[k, c]] = a[[pivot, c]];
                    a[[pivot, c]] = tmp;
                }
            }
            let p = a[[k, k]];
            assert!(p.abs() > 1e-12, "numerically singular Jacobian");
            log_det += p.abs().ln();
            for r in k + 1..n {
                let factor = a[[r, k]] / p;
                for c in k..n {
                    a[[r, c]] -= factor * a[[k, c]];
                }
            }
        }
        log_det
    }

    /// Finite-difference `log|det J_transform(x)|` for a rank-1 bijection.
    pub fn numeric_log_det(
        bijection: &dyn Bijection,
        x: &Array1<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> f64 {
        log_abs_det(&numeric_jacobian(bijection, x, condition))
    }
}
