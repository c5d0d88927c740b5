//! Planar transform (Rezende and Mohamed).

use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::bijections::coupling::{as_rank1, flatten};
use crate::bijections::spline::softplus;
use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::nn::Mlp;
use crate::params::ParamLeaves;

/// `y = x + u_hat * tanh(w . x + b)`, a rank-one perturbation of the
/// identity.
///
/// `u` is reparameterized so `w . u_hat > -1`, which makes the Jacobian
/// determinant strictly positive for any parameter values. In the
/// conditional variant an MLP on the condition shifts `(u, w, b)` away
/// from their trainable base values. Neither variant has an analytic
/// inverse; `inverse*` return `NoAnalyticInverse`.
#[derive(Clone)]
pub struct Planar {
    u: ArrayD<f64>,
    w: ArrayD<f64>,
    bias: ArrayD<f64>,
    conditioner: Option<Mlp>,
    shape: Vec<usize>,
    cond_shape: Option<Vec<usize>>,
}

impl Planar {
    pub fn new(rng: &mut ChaCha8Rng, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(FlowError::Config("dimension must be non-zero".into()));
        }
        let draw = |rng: &mut ChaCha8Rng| {
            ArrayD::from_shape_fn(IxDyn(&[dim]), |_| {
                let z: f64 = rng.sample(StandardNormal);
                z * 0.1
            })
        };
        Ok(Self {
            u: draw(rng),
            w: draw(rng),
            bias: ArrayD::zeros(IxDyn(&[1])),
            conditioner: None,
            shape: vec![dim],
            cond_shape: None,
        })
    }

    /// Conditional planar transform: an MLP of the condition shifts
    /// `(u, w, b)`.
    pub fn conditional(
        rng: &mut ChaCha8Rng,
        dim: usize,
        cond_shape: &[usize],
        nn_width: usize,
        nn_depth: usize,
    ) -> Result<Self> {
        let mut planar = Self::new(rng, dim)?;
        let cond_dim: usize = cond_shape.iter().product();
        planar.conditioner = Some(Mlp::new(rng, cond_dim, 2 * dim + 1, nn_width, nn_depth)?);
        planar.cond_shape = Some(cond_shape.to_vec());
        Ok(planar)
    }

    fn params(&self, condition: Option<&ArrayD<f64>>) -> Result<(Array1<f64>, Array1<f64>, f64)> {
        let u = as_rank1(&self.u)?;
        let w = as_rank1(&self.w)?;
        let b = self.bias[IxDyn(&[0])];
        match (&self.conditioner, condition) {
            (Some(mlp), Some(c)) => {
                // The conditioner perturbs the trainable parameters rather
                // than replacing them, so `w` stays nonzero for the zero
                // condition (the MLP has zero-initialized biases).
                let dim = self.shape[0];
                let out = mlp.forward(&flatten(c))?;
                Ok((
                    u + &out.slice(ndarray::s![..dim]),
                    w + &out.slice(ndarray::s![dim..2 * dim]),
                    b + out[2 * dim],
                ))
            }
            _ => Ok((u, w, b)),
        }
    }

    /// Reparameterized `u` with `w . u_hat = softplus(w . u) - 1 > -1`.
    fn u_hat(u: &Array1<f64>, w: &Array1<f64>) -> Result<Array1<f64>> {
        let norm_sq = w.dot(w);
        if norm_sq == 0.0 {
            return Err(FlowError::NonInvertible("planar weight vector is zero".into()));
        }
        let wu = w.dot(u);
        let m = softplus(wu) - 1.0;
        Ok(u + &(w * ((m - wu) / norm_sq)))
    }
}

impl Bijection for Planar {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.cond_shape.as_deref()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        Ok(self.transform_and_log_det(x, condition)?.0)
    }

    fn inverse(&self, _y: &ArrayD<f64>, _condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        Err(FlowError::NoAnalyticInverse)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, x)?;
        check_condition(self.cond_shape(), condition)?;
        let x = as_rank1(x)?;
        let (u, w, b) = self.params(condition)?;
        let u_hat = Self::u_hat(&u, &w)?;
        let t = (w.dot(&x) + b).tanh();
        let y = &x + &(&u_hat * t);
        let det = 1.0 + (1.0 - t * t) * w.dot(&u_hat);
        Ok((y.into_dyn(), det.abs().ln()))
    }

    fn inverse_and_log_det(
        &self,
        _y: &ArrayD<f64>,
        _condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        Err(FlowError::NoAnalyticInverse)
    }
}

impl ParamLeaves for Planar {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("u", self.u.view());
        f("w", self.w.view());
        f("bias", self.bias.view());
        if let Some(mlp) = &self.conditioner {
            mlp.for_each_leaf(&mut |name, leaf| f(&format!("conditioner.{name}"), leaf));
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            u: f("u", self.u.view()),
            w: f("w", self.w.view()),
            bias: f("bias", self.bias.view()),
            conditioner: self
                .conditioner
                .as_ref()
                .map(|mlp| mlp.map_leaves(&mut |name, leaf| f(&format!("conditioner.{name}"), leaf))),
            shape: self.shape.clone(),
            cond_shape: self.cond_shape.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::testing::numeric_log_det;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::SeedableRng;

    #[test]
    fn test_log_det_matches_numeric() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let b = Planar::new(&mut rng, 3).unwrap();
        let x = Array::from(vec![0.4, -1.1, 0.8]);
        let (_, ld) = b.transform_and_log_det(&x.clone().into_dyn(), None).unwrap();
        assert_abs_diff_eq!(ld, numeric_log_det(&b, &x, None), epsilon = 1e-5);
    }

    #[test]
    fn test_determinant_positive_even_for_adversarial_u() {
        // Without the reparameterization w . u = -2 would cross zero.
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut b = Planar::new(&mut rng, 2).unwrap();
        b.u = ndarray::array![-2.0, 0.0].into_dyn();
        b.w = ndarray::array![1.0, 0.0].into_dyn();
        for xv in [-3.0, -0.5, 0.0, 0.5, 3.0] {
            let x = ndarray::array![xv, 1.0].into_dyn();
            let (_, ld) = b.transform_and_log_det(&x, None).unwrap();
            assert!(ld.is_finite());
        }
    }

    #[test]
    fn test_inverse_is_unsupported() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let b = Planar::new(&mut rng, 2).unwrap();
        let y = ndarray::array![0.0, 0.0].into_dyn();
        assert_eq!(b.inverse(&y, None), Err(FlowError::NoAnalyticInverse));
        assert!(matches!(
            b.inverse_and_log_det(&y, None),
            Err(FlowError::NoAnalyticInverse)
        ));
    }

    #[test]
    fn test_conditional_zero_condition_is_invertible() {
        let mut rng = ChaCha8Rng::seed_from_u64(10);
        let b = Planar::conditional(&mut rng, 3, &[2], 16, 1).unwrap();
        let x = ndarray::array![0.2, -0.4, 1.0].into_dyn();
        let zero = ndarray::array![0.0, 0.0].into_dyn();
        let (y, ld) = b.transform_and_log_det(&x, Some(&zero)).unwrap();
        assert_eq!(y.shape(), &[3]);
        assert!(ld.is_finite());
        // The zero condition leaves the base parameters untouched.
        let unconditional = Planar {
            conditioner: None,
            cond_shape: None,
            ..b.clone()
        };
        let (y_base, ld_base) = unconditional.transform_and_log_det(&x, None).unwrap();
        for (a, e) in y.iter().zip(y_base.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(ld, ld_base, epsilon = 1e-12);
    }

    #[test]
    fn test_conditional_params_respond_to_condition() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let b = Planar::conditional(&mut rng, 2, &[3], 16, 1).unwrap();
        let x = ndarray::array![0.5, -0.5].into_dyn();
        let y0 = b
            .transform(&x, Some(&ndarray::array![0.0, 0.0, 0.0].into_dyn()))
            .unwrap();
        let y1 = b
            .transform(&x, Some(&ndarray::array![2.0, -1.0, 0.5].into_dyn()))
            .unwrap();
        assert_ne!(y0, y1);
    }
}
