//! Direction-swapping wrapper.

use ndarray::{ArrayD, ArrayViewD};

use crate::bijections::Bijection;
use crate::errors::Result;
use crate::params::ParamLeaves;

/// Swaps the forward and inverse passes of the wrapped bijection.
///
/// Flows are usually fit by density evaluation, which runs the inverse
/// pass; wrapping a one-pass-fast bijection in `Invert` puts the fast
/// direction where `log_prob` needs it. Shapes are unchanged.
#[derive(Clone)]
pub struct Invert<B>(pub B);

impl<B: Bijection> Invert<B> {
    pub fn inner(&self) -> &B {
        &self.0
    }
}

impl<B: Bijection + 'static> Bijection for Invert<B> {
    fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.0.cond_shape()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        self.0.inverse(x, condition)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        self.0.transform(y, condition)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        self.0.inverse_and_log_det(x, condition)
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        self.0.transform_and_log_det(y, condition)
    }
}

impl<B: ParamLeaves> ParamLeaves for Invert<B> {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        self.0.for_each_leaf(f);
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Invert(self.0.map_leaves(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::Affine;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_invert_swaps_directions() {
        let inner = Affine::new(array![1.0].into_dyn(), array![2.0].into_dyn()).unwrap();
        let inverted = Invert(inner.clone());
        let x = array![3.0].into_dyn();
        let (fwd, ld_fwd) = inverted.transform_and_log_det(&x, None).unwrap();
        let (expected, ld_expected) = inner.inverse_and_log_det(&x, None).unwrap();
        assert_abs_diff_eq!(fwd[[0]], expected[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(ld_fwd, ld_expected, epsilon = 1e-12);
        let (back, ld_back) = inverted.inverse_and_log_det(&fwd, None).unwrap();
        assert_abs_diff_eq!(back[[0]], x[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(ld_back, -ld_fwd, epsilon = 1e-12);
    }
}
