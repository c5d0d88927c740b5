//! Small feed-forward conditioner networks.
//!
//! These are not a deep-learning framework: just the dense and
//! degree-masked layers the conditional bijections need, with weights
//! exposed as parameter leaves so stacked flows carry them along.

use ndarray::{Array1, Array2, ArrayD, ArrayViewD, Ix1, Ix2, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::errors::{FlowError, Result};
use crate::params::ParamLeaves;

fn relu(v: &mut Array1<f64>) {
    v.mapv_inplace(|x| x.max(0.0));
}

fn as_matrix(a: &ArrayD<f64>, name: &str) -> Result<Array2<f64>> {
    a.view()
        .into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| {
            FlowError::Internal(format!(
                "`{name}` must be rank-2 at apply time, got rank {}",
                a.ndim()
            ))
        })
}

fn as_vector(a: &ArrayD<f64>, name: &str) -> Result<Array1<f64>> {
    a.view()
        .into_dimensionality::<Ix1>()
        .map(|v| v.to_owned())
        .map_err(|_| {
            FlowError::Internal(format!(
                "`{name}` must be rank-1 at apply time, got rank {}",
                a.ndim()
            ))
        })
}

/// Draw an `out x in` weight matrix with `N(0, 1/in)` entries.
fn init_weight(rng: &mut ChaCha8Rng, out_dim: usize, in_dim: usize) -> ArrayD<f64> {
    let scale = 1.0 / (in_dim.max(1) as f64).sqrt();
    ArrayD::from_shape_fn(IxDyn(&[out_dim, in_dim]), |_| {
        let z: f64 = rng.sample(StandardNormal);
        z * scale
    })
}

/// Dense layer `y = W x + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: ArrayD<f64>,
    bias: ArrayD<f64>,
}

impl Linear {
    pub fn new(rng: &mut ChaCha8Rng, in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: init_weight(rng, out_dim, in_dim),
            bias: ArrayD::zeros(IxDyn(&[out_dim])),
        }
    }

    pub fn forward(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        let w = as_matrix(&self.weight, "weight")?;
        let b = as_vector(&self.bias, "bias")?;
        if x.len() != w.ncols() {
            return Err(FlowError::ShapeMismatch {
                expected: vec![w.ncols()],
                got: vec![x.len()],
            });
        }
        Ok(w.dot(x) + &b)
    }
}

impl ParamLeaves for Linear {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("weight", self.weight.view());
        f("bias", self.bias.view());
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            weight: f("weight", self.weight.view()),
            bias: f("bias", self.bias.view()),
        }
    }
}

/// ReLU multilayer perceptron with `depth` hidden layers of `width` units.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn new(
        rng: &mut ChaCha8Rng,
        in_dim: usize,
        out_dim: usize,
        width: usize,
        depth: usize,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 || width == 0 {
            return Err(FlowError::Config(
                "mlp dimensions must be non-zero".into(),
            ));
        }
        let mut layers = Vec::with_capacity(depth + 1);
        let mut prev = in_dim;
        for _ in 0..depth {
            layers.push(Linear::new(rng, prev, width));
            prev = width;
        }
        layers.push(Linear::new(rng, prev, out_dim));
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        let mut h = x.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i != last {
                relu(&mut h);
            }
        }
        Ok(h)
    }
}

impl ParamLeaves for Mlp {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.for_each_leaf(&mut |name, leaf| f(&format!("{i}.{name}"), leaf));
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            layers: self
                .layers
                .iter()
                .enumerate()
                .map(|(i, layer)| layer.map_leaves(&mut |name, leaf| f(&format!("{i}.{name}"), leaf)))
                .collect(),
        }
    }
}

/// Dense layer whose weight is multiplied elementwise by a fixed 0/1 mask.
///
/// The mask is structural: it never appears as a parameter leaf.
#[derive(Debug, Clone)]
pub struct MaskedLinear {
    weight: ArrayD<f64>,
    bias: ArrayD<f64>,
    mask: Array2<f64>,
}

impl MaskedLinear {
    fn new(rng: &mut ChaCha8Rng, mask: Array2<f64>) -> Self {
        let (out_dim, in_dim) = mask.dim();
        Self {
            weight: init_weight(rng, out_dim, in_dim),
            bias: ArrayD::zeros(IxDyn(&[out_dim])),
            mask,
        }
    }

    fn forward(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        let w = as_matrix(&self.weight, "weight")?;
        let b = as_vector(&self.bias, "bias")?;
        if x.len() != w.ncols() {
            return Err(FlowError::ShapeMismatch {
                expected: vec![w.ncols()],
                got: vec![x.len()],
            });
        }
        Ok((&w * &self.mask).dot(x) + &b)
    }
}

impl ParamLeaves for MaskedLinear {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("weight", self.weight.view());
        f("bias", self.bias.view());
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            weight: f("weight", self.weight.view()),
            bias: f("bias", self.bias.view()),
            mask: self.mask.clone(),
        }
    }
}

/// MADE-style autoregressive MLP.
///
/// Produces `params_per_dim` outputs for each of `dim` elements, laid out
/// contiguously per element. Output block `i` depends only on inputs
/// `x[..i]` and on the condition; condition inputs carry rank -1 so every
/// output may use them.
#[derive(Debug, Clone)]
pub struct MaskedMlp {
    layers: Vec<MaskedLinear>,
    dim: usize,
    cond_dim: usize,
    params_per_dim: usize,
}

/// `allowed[i][j]` = `in[j] <= out[i]` (non-strict) or `<` (strict, used
/// for the final layer so no output touches its own input).
fn rank_mask(in_ranks: &[i64], out_ranks: &[i64], strict: bool) -> Array2<f64> {
    Array2::from_shape_fn((out_ranks.len(), in_ranks.len()), |(i, j)| {
        let ok = if strict {
            in_ranks[j] < out_ranks[i]
        } else {
            in_ranks[j] <= out_ranks[i]
        };
        if ok {
            1.0
        } else {
            0.0
        }
    })
}

impl MaskedMlp {
    pub fn new(
        rng: &mut ChaCha8Rng,
        dim: usize,
        cond_dim: usize,
        width: usize,
        depth: usize,
        params_per_dim: usize,
    ) -> Result<Self> {
        if dim == 0 || width == 0 || depth == 0 || params_per_dim == 0 {
            return Err(FlowError::Config(
                "masked mlp dimensions must be non-zero".into(),
            ));
        }
        let mut in_ranks: Vec<i64> = (0..dim as i64).collect();
        in_ranks.extend(std::iter::repeat(-1).take(cond_dim));
        // Hidden ranks cycle from -1 (condition rank) to dim - 2, so the
        // first element's output block keeps a path from the condition.
        let hidden_ranks: Vec<i64> = (0..width).map(|i| (i % dim) as i64 - 1).collect();
        let out_ranks: Vec<i64> = (0..dim as i64)
            .flat_map(|r| std::iter::repeat(r).take(params_per_dim))
            .collect();

        let mut layers = Vec::with_capacity(depth + 1);
        let mut prev = in_ranks;
        for _ in 0..depth {
            layers.push(MaskedLinear::new(
                rng,
                rank_mask(&prev, &hidden_ranks, false),
            ));
            prev = hidden_ranks.clone();
        }
        layers.push(MaskedLinear::new(rng, rank_mask(&prev, &out_ranks, true)));
        Ok(Self {
            layers,
            dim,
            cond_dim,
            params_per_dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn params_per_dim(&self) -> usize {
        self.params_per_dim
    }

    /// Parameters for all elements; block `i` is
    /// `out[i * params_per_dim .. (i + 1) * params_per_dim]`.
    pub fn forward(&self, x: &Array1<f64>, condition: Option<&Array1<f64>>) -> Result<Array1<f64>> {
        let cond_len = condition.map_or(0, |c| c.len());
        if cond_len != self.cond_dim {
            return Err(FlowError::ConditionMismatch(format!(
                "masked mlp expects condition length {}, got {cond_len}",
                self.cond_dim
            )));
        }
        let mut h = Array1::zeros(self.dim + self.cond_dim);
        h.slice_mut(ndarray::s![..self.dim]).assign(x);
        if let Some(c) = condition {
            h.slice_mut(ndarray::s![self.dim..]).assign(c);
        }
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i != last {
                relu(&mut h);
            }
        }
        Ok(h)
    }
}

impl ParamLeaves for MaskedMlp {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.for_each_leaf(&mut |name, leaf| f(&format!("{i}.{name}"), leaf));
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            layers: self
                .layers
                .iter()
                .enumerate()
                .map(|(i, layer)| layer.map_leaves(&mut |name, leaf| f(&format!("{i}.{name}"), leaf)))
                .collect(),
            dim: self.dim,
            cond_dim: self.cond_dim,
            params_per_dim: self.params_per_dim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::leaf_count;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_linear_applies_weight_and_bias() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut layer = Linear::new(&mut rng, 2, 2);
        layer.weight = array![[1.0, 2.0], [0.0, -1.0]].into_dyn();
        layer.bias = array![0.5, 0.0].into_dyn();
        let y = layer.forward(&array![3.0, 1.0]).unwrap();
        assert_eq!(y, array![5.5, -1.0]);
    }

    #[test]
    fn test_mlp_shapes_and_leaves() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mlp = Mlp::new(&mut rng, 3, 5, 16, 2).unwrap();
        let y = mlp.forward(&Array1::zeros(3)).unwrap();
        assert_eq!(y.len(), 5);
        // 2 hidden + 1 output layer, weight and bias each.
        assert_eq!(leaf_count(&mlp), 6);
    }

    #[test]
    fn test_masked_mlp_is_autoregressive() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let made = MaskedMlp::new(&mut rng, 4, 0, 32, 2, 2).unwrap();
        let x = array![0.3, -0.8, 1.2, 0.5];
        let base = made.forward(&x, None).unwrap();
        // Perturbing x[j] must leave parameter blocks 0..=j unchanged.
        for j in 0..4 {
            let mut bumped = x.clone();
            bumped[j] += 1.0;
            let out = made.forward(&bumped, None).unwrap();
            for i in 0..=j {
                for p in 0..2 {
                    assert_eq!(out[i * 2 + p], base[i * 2 + p]);
                }
            }
        }
    }

    #[test]
    fn test_masked_mlp_condition_reaches_every_output() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let made = MaskedMlp::new(&mut rng, 3, 2, 32, 2, 1).unwrap();
        let x = array![0.1, 0.2, 0.3];
        let a = made.forward(&x, Some(&array![0.0, 0.0])).unwrap();
        let b = made.forward(&x, Some(&array![1.0, -1.0])).unwrap();
        for i in 0..3 {
            assert_ne!(a[i], b[i], "output {i} should depend on the condition");
        }
    }

    #[test]
    fn test_masked_mlp_rejects_missing_condition() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let made = MaskedMlp::new(&mut rng, 3, 2, 8, 1, 1).unwrap();
        assert!(made.forward(&Array1::zeros(3), None).is_err());
    }
}
