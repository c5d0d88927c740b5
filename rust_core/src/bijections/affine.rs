//! Elementwise and triangular affine bijections.

use ndarray::{ArrayD, ArrayViewD, Ix1, Ix2, IxDyn};

use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::params::ParamLeaves;
use crate::shapes::broadcast_shapes;

/// Elementwise affine transform `y = loc + scale * x`.
///
/// `loc` and `scale` are broadcast against each other at construction and
/// baked to the resulting shape. Scales must be non-zero.
#[derive(Debug, Clone)]
pub struct Affine {
    loc: ArrayD<f64>,
    scale: ArrayD<f64>,
    shape: Vec<usize>,
}

impl Affine {
    pub fn new(loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Self> {
        let shape = broadcast_shapes(loc.shape(), scale.shape())?;
        let loc = loc
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| FlowError::Config("loc does not broadcast to target shape".into()))?
            .to_owned();
        let scale = scale
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| FlowError::Config("scale does not broadcast to target shape".into()))?
            .to_owned();
        if scale.iter().any(|&s| s == 0.0 || !s.is_finite()) {
            return Err(FlowError::NonInvertible(
                "affine scale must be finite and non-zero".into(),
            ));
        }
        Ok(Self { loc, scale, shape })
    }

    /// Identity-initialized affine over `shape`.
    pub fn identity(shape: &[usize]) -> Self {
        Self {
            loc: ArrayD::zeros(IxDyn(shape)),
            scale: ArrayD::ones(IxDyn(shape)),
            shape: shape.to_vec(),
        }
    }

    pub fn loc(&self) -> &ArrayD<f64> {
        &self.loc
    }

    pub fn scale(&self) -> &ArrayD<f64> {
        &self.scale
    }

    fn forward_log_det(&self) -> f64 {
        self.scale.mapv(|s| s.abs().ln()).sum()
    }
}

impl Bijection for Affine {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, x)?;
        check_condition(None, condition)?;
        Ok(&self.loc + &(&self.scale * x))
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, y)?;
        check_condition(None, condition)?;
        Ok(&(y - &self.loc) / &self.scale)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        let y = self.transform(x, condition)?;
        Ok((y, self.forward_log_det()))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        let x = self.inverse(y, condition)?;
        Ok((x, -self.forward_log_det()))
    }
}

impl ParamLeaves for Affine {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("loc", self.loc.view());
        f("scale", self.scale.view());
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            loc: f("loc", self.loc.view()),
            scale: f("scale", self.scale.view()),
            shape: self.shape.clone(),
        }
    }
}

/// Affine transform with a lower-triangular weight matrix,
/// `y = W x + loc`, inverted by forward substitution.
///
/// With `weight_normalization` each row of `W` is rescaled to unit norm and
/// multiplied by a learned per-row scale, which keeps the triangular
/// structure while decoupling direction from magnitude.
#[derive(Debug, Clone)]
pub struct TriangularAffine {
    loc: ArrayD<f64>,
    tri: ArrayD<f64>,
    row_scale: ArrayD<f64>,
    normalize: bool,
    shape: Vec<usize>,
}

impl TriangularAffine {
    pub fn new(loc: ArrayD<f64>, tri: ArrayD<f64>, weight_normalization: bool) -> Result<Self> {
        let dim = loc.len();
        if loc.ndim() != 1 {
            return Err(FlowError::Config("loc must be rank-1".into()));
        }
        if tri.ndim() != 2 || tri.shape() != [dim, dim] {
            return Err(FlowError::Config(format!(
                "triangular weights must have shape [{dim}, {dim}], got {:?}",
                tri.shape()
            )));
        }
        for i in 0..dim {
            if tri[[i, i]] == 0.0 || !tri[[i, i]].is_finite() {
                return Err(FlowError::NonInvertible(format!(
                    "triangular weight diagonal entry {i} must be finite and non-zero"
                )));
            }
        }
        // Lower-triangular part only; anything above the diagonal is dropped.
        let tri = ArrayD::from_shape_fn(IxDyn(&[dim, dim]), |ix| {
            if ix[1] <= ix[0] {
                tri[[ix[0], ix[1]]]
            } else {
                0.0
            }
        });
        Ok(Self {
            loc,
            tri,
            row_scale: ArrayD::ones(IxDyn(&[dim])),
            normalize: weight_normalization,
            shape: vec![dim],
        })
    }

    fn dim(&self) -> usize {
        self.shape[0]
    }

    /// Effective weight matrix after optional row normalization.
    fn weights(&self) -> Result<ndarray::Array2<f64>> {
        let tri = self
            .tri
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| FlowError::Internal(format!("triangular weights rank: {e}")))?;
        if !self.normalize {
            return Ok(tri.to_owned());
        }
        let dim = self.dim();
        let mut w = tri.to_owned();
        for r in 0..dim {
            let norm = w.row(r).mapv(|v| v * v).sum().sqrt();
            if norm == 0.0 {
                return Err(FlowError::NonInvertible(format!(
                    "triangular weight row {r} has zero norm"
                )));
            }
            let s = self.row_scale[[r]] / norm;
            for c in 0..dim {
                w[[r, c]] *= s;
            }
        }
        Ok(w)
    }

    fn forward_log_det(&self, w: &ndarray::Array2<f64>) -> f64 {
        (0..self.dim()).map(|i| w[[i, i]].abs().ln()).sum()
    }
}

impl Bijection for TriangularAffine {
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
        let w = self.weights()?;
        let xv = x
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| FlowError::Internal(format!("input rank: {e}")))?;
        let loc = self
            .loc
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| FlowError::Internal(format!("loc rank: {e}")))?;
        let y = w.dot(&xv) + &loc;
        let log_det = self.forward_log_det(&w);
        Ok((y.into_dyn(), log_det))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, y)?;
        check_condition(None, condition)?;
        let w = self.weights()?;
        let dim = self.dim();
        let mut x = vec![0.0; dim];
        for i in 0..dim {
            let mut acc = y[IxDyn(&[i])] - self.loc[[i]];
            for j in 0..i {
                acc -= w[[i, j]] * x[j];
            }
            x[i] = acc / w[[i, i]];
        }
        let log_det = -self.forward_log_det(&w);
        Ok((ArrayD::from_shape_vec(IxDyn(&[dim]), x)
            .map_err(|e| FlowError::Internal(e.to_string()))?, log_det))
    }
}

impl ParamLeaves for TriangularAffine {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("loc", self.loc.view());
        f("tri", self.tri.view());
        f("row_scale", self.row_scale.view());
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            loc: f("loc", self.loc.view()),
            tri: f("tri", self.tri.view()),
            row_scale: f("row_scale", self.row_scale.view()),
            normalize: self.normalize,
            shape: self.shape.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::testing::numeric_log_det;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    #[test]
    fn test_affine_round_trip() {
        let b = Affine::new(
            array![1.0, -2.0, 0.5].into_dyn(),
            array![2.0, 0.3, -1.5].into_dyn(),
        )
        .unwrap();
        let x = array![0.4, -1.2, 3.3].into_dyn();
        let y = b.transform(&x, None).unwrap();
        let back = b.inverse(&y, None).unwrap();
        for (a, e) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_affine_log_det_matches_scales() {
        let b = Affine::new(
            array![0.0, 0.0].into_dyn(),
            array![2.0, -0.5].into_dyn(),
        )
        .unwrap();
        let x = array![1.0, 1.0].into_dyn();
        let (y, ld) = b.transform_and_log_det(&x, None).unwrap();
        assert_eq!(y, b.transform(&x, None).unwrap());
        assert_abs_diff_eq!(ld, 2.0f64.ln() + 0.5f64.ln(), epsilon = 1e-12);
        let (_, ld_inv) = b.inverse_and_log_det(&y, None).unwrap();
        assert_abs_diff_eq!(ld_inv, -ld, epsilon = 1e-12);
    }

    #[test]
    fn test_affine_scalar_broadcast() {
        let b = Affine::new(
            ArrayD::zeros(IxDyn(&[])),
            array![1.0, 2.0, 3.0].into_dyn(),
        )
        .unwrap();
        assert_eq!(b.shape(), &[3]);
    }

    #[test]
    fn test_affine_rejects_zero_scale() {
        let err = Affine::new(array![0.0].into_dyn(), array![0.0].into_dyn());
        assert!(matches!(err, Err(FlowError::NonInvertible(_))));
    }

    #[test]
    fn test_affine_rejects_wrong_shape() {
        let b = Affine::identity(&[3]);
        let err = b.transform(&array![[1.0, 2.0]].into_dyn(), None);
        assert!(matches!(err, Err(FlowError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_affine_rejects_unexpected_condition() {
        let b = Affine::identity(&[2]);
        let cond = array![1.0].into_dyn();
        let err = b.transform(&array![0.0, 0.0].into_dyn(), Some(&cond));
        assert!(matches!(err, Err(FlowError::ConditionMismatch(_))));
    }

    fn lower_triangular() -> TriangularAffine {
        TriangularAffine::new(
            array![0.3, -0.1, 0.7].into_dyn(),
            array![[1.5, 0.0, 0.0], [0.4, -0.8, 0.0], [-0.2, 0.9, 1.1]].into_dyn(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_triangular_round_trip() {
        let b = lower_triangular();
        let x = array![0.5, -1.0, 2.0].into_dyn();
        let (y, ld) = b.transform_and_log_det(&x, None).unwrap();
        let (back, ld_inv) = b.inverse_and_log_det(&y, None).unwrap();
        for (a, e) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(ld_inv, -ld, epsilon = 1e-12);
    }

    #[test]
    fn test_triangular_log_det_matches_numeric() {
        let b = lower_triangular();
        let x = Array1::from(vec![0.5, -1.0, 2.0]);
        let (_, ld) = b.transform_and_log_det(&x.clone().into_dyn(), None).unwrap();
        assert_abs_diff_eq!(ld, numeric_log_det(&b, &x, None), epsilon = 1e-6);
    }

    #[test]
    fn test_triangular_normalized_round_trip() {
        let b = TriangularAffine::new(
            array![0.0, 0.0].into_dyn(),
            array![[2.0, 0.0], [1.0, 3.0]].into_dyn(),
            true,
        )
        .unwrap();
        let x = array![1.0, -2.0].into_dyn();
        let y = b.transform(&x, None).unwrap();
        let back = b.inverse(&y, None).unwrap();
        for (a, e) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_triangular_rejects_zero_diagonal() {
        let err = TriangularAffine::new(
            array![0.0, 0.0].into_dyn(),
            array![[0.0, 0.0], [1.0, 1.0]].into_dyn(),
            false,
        );
        assert!(matches!(err, Err(FlowError::NonInvertible(_))));
    }
}
