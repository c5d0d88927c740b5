//! Repeated application of a stacked bijection.

use ndarray::{ArrayD, ArrayViewD};

use crate::bijections::{check_condition, check_input, child_condition, Bijection};
use crate::errors::Result;
use crate::params::{leading_len, select_layer, ParamLeaves};

/// Applies the layers of a stacked bijection in sequence.
///
/// The wrapped value holds `L` layers' parameters along the leading axis
/// of every leaf (see [`stack`](crate::params::stack)); `Scan` slices out
/// layer `i` and applies it, forward in order, inverse in reverse,
/// summing log-dets. Numerically identical to the equivalent `Chain` of
/// sliced layers while storing the parameters contiguously.
#[derive(Clone)]
pub struct Scan<B> {
    stacked: B,
    layers: usize,
}

impl<B> Scan<B>
where
    B: Bijection + ParamLeaves + Clone + 'static,
{
    pub fn new(stacked: B) -> Result<Self> {
        let layers = leading_len(&stacked)?;
        Ok(Self { stacked, layers })
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    fn layer(&self, i: usize) -> B {
        select_layer(&self.stacked, i)
    }
}

impl<B> Bijection for Scan<B>
where
    B: Bijection + ParamLeaves + Clone + 'static,
{
    fn shape(&self) -> &[usize] {
        self.stacked.shape()
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.stacked.cond_shape()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(self.shape(), x)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = x.clone();
        for i in 0..self.layers {
            let layer = self.layer(i);
            current = layer.transform(&current, child_condition(&layer, condition))?;
        }
        Ok(current)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(self.shape(), y)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = y.clone();
        for i in (0..self.layers).rev() {
            let layer = self.layer(i);
            current = layer.inverse(&current, child_condition(&layer, condition))?;
        }
        Ok(current)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(self.shape(), x)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = x.clone();
        let mut log_det = 0.0;
        for i in 0..self.layers {
            let layer = self.layer(i);
            let (next, ld) =
                layer.transform_and_log_det(&current, child_condition(&layer, condition))?;
            current = next;
            log_det += ld;
        }
        Ok((current, log_det))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(self.shape(), y)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = y.clone();
        let mut log_det = 0.0;
        for i in (0..self.layers).rev() {
            let layer = self.layer(i);
            let (next, ld) =
                layer.inverse_and_log_det(&current, child_condition(&layer, condition))?;
            current = next;
            log_det += ld;
        }
        Ok((current, log_det))
    }
}

impl<B: ParamLeaves> ParamLeaves for Scan<B> {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        self.stacked
            .for_each_leaf(&mut |name, leaf| f(&format!("stacked.{name}"), leaf));
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            stacked: self
                .stacked
                .map_leaves(&mut |name, leaf| f(&format!("stacked.{name}"), leaf)),
            layers: self.layers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::{Affine, Chain};
    use crate::params::stack;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn layers() -> Vec<Affine> {
        vec![
            Affine::new(array![0.5, -0.5].into_dyn(), array![2.0, 3.0].into_dyn()).unwrap(),
            Affine::new(array![1.0, 0.0].into_dyn(), array![0.5, -1.0].into_dyn()).unwrap(),
            Affine::new(array![-2.0, 0.1].into_dyn(), array![1.5, 0.2].into_dyn()).unwrap(),
        ]
    }

    #[test]
    fn test_scan_matches_chain() {
        let scan = Scan::new(stack(&layers()).unwrap()).unwrap();
        assert_eq!(scan.layers(), 3);
        let chain = Chain::new(
            layers()
                .into_iter()
                .map(|a| Box::new(a) as Box<dyn crate::bijections::Bijection>)
                .collect(),
        )
        .unwrap();
        let x = array![0.7, -1.3].into_dyn();
        let (ys, lds) = scan.transform_and_log_det(&x, None).unwrap();
        let (yc, ldc) = chain.transform_and_log_det(&x, None).unwrap();
        assert_abs_diff_eq!(ys[[0]], yc[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(ys[[1]], yc[[1]], epsilon = 1e-12);
        assert_abs_diff_eq!(lds, ldc, epsilon = 1e-12);
        let (xs, ld_inv) = scan.inverse_and_log_det(&ys, None).unwrap();
        assert_abs_diff_eq!(xs[[0]], x[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(xs[[1]], x[[1]], epsilon = 1e-12);
        assert_abs_diff_eq!(ld_inv, -lds, epsilon = 1e-12);
    }

    #[test]
    fn test_scan_rejects_rank0_leaves() {
        // A scalar affine has rank-0 leaves, so there is no layer axis.
        assert!(Scan::new(Affine::identity(&[])).is_err());
    }

    #[test]
    fn test_single_layer_scan() {
        let one = stack(&layers()[..1]).unwrap();
        let scan = Scan::new(one).unwrap();
        assert_eq!(scan.layers(), 1);
        let x = array![0.2, 0.4].into_dyn();
        let direct = layers()[0].transform(&x, None).unwrap();
        let scanned = scan.transform(&x, None).unwrap();
        assert_abs_diff_eq!(scanned[[0]], direct[[0]], epsilon = 1e-12);
    }
}
