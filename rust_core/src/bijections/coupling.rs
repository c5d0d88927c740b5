//! Coupling layer (RealNVP style).

use ndarray::{Array1, ArrayD, ArrayViewD, Ix1};
use rand_chacha::ChaCha8Rng;

use crate::bijections::transformers::Transformer;
use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::nn::Mlp;
use crate::params::ParamLeaves;

pub(crate) fn flatten(a: &ArrayD<f64>) -> Array1<f64> {
    Array1::from_iter(a.iter().cloned())
}

pub(crate) fn as_rank1(a: &ArrayD<f64>) -> Result<Array1<f64>> {
    a.view()
        .into_dimensionality::<Ix1>()
        .map(|v| v.to_owned())
        .map_err(|_| FlowError::Internal(format!("expected rank-1 input, got rank {}", a.ndim())))
}

/// Transforms the trailing partition of a vector elementwise, with the
/// transformer parameters produced by an MLP on the untransformed leading
/// partition (plus the condition, when present).
///
/// Both directions only ever feed the untransformed partition to the
/// conditioner, so forward and inverse are each a single pass.
#[derive(Clone)]
pub struct Coupling<T: Transformer> {
    transformer: T,
    conditioner: Mlp,
    untransformed_dim: usize,
    shape: Vec<usize>,
    cond_shape: Option<Vec<usize>>,
}

impl<T: Transformer> Coupling<T> {
    pub fn new(
        rng: &mut ChaCha8Rng,
        transformer: T,
        dim: usize,
        untransformed_dim: usize,
        cond_shape: Option<&[usize]>,
        nn_width: usize,
        nn_depth: usize,
    ) -> Result<Self> {
        if untransformed_dim == 0 || untransformed_dim >= dim {
            return Err(FlowError::Config(format!(
                "untransformed_dim must split the vector into two non-empty \
                 parts, got {untransformed_dim} of {dim}"
            )));
        }
        let cond_dim: usize = cond_shape.map_or(0, |cs| cs.iter().product());
        let out_dim = (dim - untransformed_dim) * transformer.num_params();
        let conditioner = Mlp::new(
            rng,
            untransformed_dim + cond_dim,
            out_dim,
            nn_width,
            nn_depth,
        )?;
        Ok(Self {
            transformer,
            conditioner,
            untransformed_dim,
            shape: vec![dim],
            cond_shape: cond_shape.map(|cs| cs.to_vec()),
        })
    }

    pub fn untransformed_dim(&self) -> usize {
        self.untransformed_dim
    }

    fn params(&self, untransformed: &[f64], condition: Option<&ArrayD<f64>>) -> Result<Array1<f64>> {
        let mut input = Array1::zeros(
            untransformed.len() + condition.map_or(0, |c| c.len()),
        );
        for (i, &v) in untransformed.iter().enumerate() {
            input[i] = v;
        }
        if let Some(c) = condition {
            let flat = flatten(c);
            input
                .slice_mut(ndarray::s![untransformed.len()..])
                .assign(&flat);
        }
        self.conditioner.forward(&input)
    }

    fn apply(
        &self,
        v: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
        invert: bool,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, v)?;
        check_condition(self.cond_shape.as_deref(), condition)?;
        let v = as_rank1(v)?;
        let split = self.untransformed_dim;
        let head = v.slice(ndarray::s![..split]).to_vec();
        let params = self.params(&head, condition)?;
        let p = self.transformer.num_params();
        let mut out = v.clone();
        let mut log_det = 0.0;
        for (i, &value) in v.iter().skip(split).enumerate() {
            let block = params.slice(ndarray::s![i * p..(i + 1) * p]).to_vec();
            let (mapped, lg) = if invert {
                self.transformer.inverse(value, &block)?
            } else {
                self.transformer.forward(value, &block)?
            };
            out[split + i] = mapped;
            log_det += lg;
        }
        if invert {
            log_det = -log_det;
        }
        Ok((out.into_dyn(), log_det))
    }
}

impl<T: Transformer + Clone + 'static> Bijection for Coupling<T> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.cond_shape.as_deref()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        Ok(self.apply(x, condition, false)?.0)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        Ok(self.apply(y, condition, true)?.0)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        self.apply(x, condition, false)
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        self.apply(y, condition, true)
    }
}

impl<T: Transformer + Clone> ParamLeaves for Coupling<T> {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        self.conditioner
            .for_each_leaf(&mut |name, leaf| f(&format!("conditioner.{name}"), leaf));
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            transformer: self.transformer.clone(),
            conditioner: self
                .conditioner
                .map_leaves(&mut |name, leaf| f(&format!("conditioner.{name}"), leaf)),
            untransformed_dim: self.untransformed_dim,
            shape: self.shape.clone(),
            cond_shape: self.cond_shape.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::transformers::{AffineTransformer, SplineTransformer};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, IxDyn};
    use rand::{Rng, SeedableRng};

    fn random_vec(rng: &mut ChaCha8Rng, n: usize) -> ArrayD<f64> {
        Array::from_iter((0..n).map(|_| rng.gen_range(-2.0..2.0))).into_dyn()
    }

    #[test]
    fn test_round_trip_100_draws() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let b = Coupling::new(&mut rng, AffineTransformer::default(), 4, 2, None, 16, 1).unwrap();
        for _ in 0..100 {
            let x = random_vec(&mut rng, 4);
            let (y, ld) = b.transform_and_log_det(&x, None).unwrap();
            let (back, ld_inv) = b.inverse_and_log_det(&y, None).unwrap();
            for (a, e) in back.iter().zip(x.iter()) {
                assert_abs_diff_eq!(a, e, epsilon = 1e-8);
            }
            assert_abs_diff_eq!(ld_inv, -ld, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_untransformed_partition_passes_through() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let b = Coupling::new(&mut rng, AffineTransformer::default(), 5, 3, None, 16, 1).unwrap();
        let x = random_vec(&mut rng, 5);
        let y = b.transform(&x, None).unwrap();
        for i in 0..3 {
            assert_eq!(y[IxDyn(&[i])], x[IxDyn(&[i])]);
        }
    }

    #[test]
    fn test_log_det_matches_numeric() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let b = Coupling::new(&mut rng, AffineTransformer::default(), 3, 1, None, 16, 1).unwrap();
        let x = Array::from(vec![0.3, -0.9, 1.1]);
        let (_, ld) = b.transform_and_log_det(&x.clone().into_dyn(), None).unwrap();
        let numeric = crate::bijections::testing::numeric_log_det(&b, &x, None);
        assert_abs_diff_eq!(ld, numeric, epsilon = 1e-5);
    }

    #[test]
    fn test_conditional_coupling_uses_condition() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let b = Coupling::new(
            &mut rng,
            SplineTransformer::new(5, 3.0).unwrap(),
            4,
            2,
            Some(&[2]),
            16,
            1,
        )
        .unwrap();
        let x = random_vec(&mut rng, 4);
        let c0 = Array::from(vec![0.0, 0.0]).into_dyn();
        let c1 = Array::from(vec![1.5, -0.5]).into_dyn();
        let y0 = b.transform(&x, Some(&c0)).unwrap();
        let y1 = b.transform(&x, Some(&c1)).unwrap();
        assert_ne!(y0, y1);
        let back = b.inverse(&y1, Some(&c1)).unwrap();
        for (a, e) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_missing_condition_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let b = Coupling::new(
            &mut rng,
            AffineTransformer::default(),
            4,
            2,
            Some(&[3]),
            8,
            1,
        )
        .unwrap();
        let x = random_vec(&mut rng, 4);
        assert!(matches!(
            b.transform(&x, None),
            Err(FlowError::ConditionMismatch(_))
        ));
    }

    #[test]
    fn test_degenerate_partition_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert!(Coupling::new(&mut rng, AffineTransformer::default(), 4, 0, None, 8, 1).is_err());
        assert!(Coupling::new(&mut rng, AffineTransformer::default(), 4, 4, None, 8, 1).is_err());
    }
}
