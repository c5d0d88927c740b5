//! Volume-preserving index rearrangements.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::bijections::{check_condition, check_input, Bijection};
use crate::errors::{FlowError, Result};
use crate::params::ParamLeaves;

/// Permutation of a rank-1 input, `y[i] = x[indices[i]]`. Log-det 0.
///
/// The indices are carried as an `f64` leaf so per-layer permutations of a
/// stacked flow ride along with the other parameters; the `usize` lookup
/// tables are recomputed whenever the leaf is rebuilt at its own rank.
#[derive(Debug, Clone)]
pub struct Permute {
    indices: ArrayD<f64>,
    forward: Vec<usize>,
    backward: Vec<usize>,
    shape: Vec<usize>,
}

impl Permute {
    pub fn new(indices: Vec<usize>) -> Result<Self> {
        let dim = indices.len();
        if dim == 0 {
            return Err(FlowError::Config("empty permutation".into()));
        }
        let mut seen = vec![false; dim];
        for &i in &indices {
            if i >= dim || seen[i] {
                return Err(FlowError::Config(format!(
                    "indices are not a permutation of 0..{dim}"
                )));
            }
            seen[i] = true;
        }
        let leaf = ArrayD::from_shape_vec(IxDyn(&[dim]), indices.iter().map(|&i| i as f64).collect())
            .map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(Self::from_tables(leaf, indices))
    }

    /// Uniformly random permutation drawn from `rng`.
    pub fn random(rng: &mut ChaCha8Rng, dim: usize) -> Result<Self> {
        let mut indices: Vec<usize> = (0..dim).collect();
        indices.shuffle(rng);
        Self::new(indices)
    }

    fn from_tables(indices: ArrayD<f64>, forward: Vec<usize>) -> Self {
        let dim = forward.len();
        let mut backward = vec![0usize; dim];
        for (i, &p) in forward.iter().enumerate() {
            backward[p] = i;
        }
        Self {
            indices,
            forward,
            backward,
            shape: vec![dim],
        }
    }

    fn from_leaf(indices: ArrayD<f64>) -> Self {
        if indices.ndim() == 1 {
            let forward: Vec<usize> = indices.iter().map(|&v| v as usize).collect();
            Self::from_tables(indices, forward)
        } else {
            // Stacked form (extra leading layer axis): lookup tables are
            // rebuilt once Scan slices a single layer back out.
            let dim = *indices.shape().last().unwrap_or(&0);
            Self {
                indices,
                forward: Vec::new(),
                backward: Vec::new(),
                shape: vec![dim],
            }
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.forward
    }

    fn tables(&self) -> Result<(&[usize], &[usize])> {
        if self.forward.len() != self.shape[0] {
            return Err(FlowError::Internal(
                "permutation is in stacked form and cannot be applied directly".into(),
            ));
        }
        Ok((&self.forward, &self.backward))
    }

    fn apply(&self, v: &ArrayD<f64>, table: &[usize]) -> Result<ArrayD<f64>> {
        let out: Vec<f64> = table.iter().map(|&i| v[IxDyn(&[i])]).collect();
        ArrayD::from_shape_vec(IxDyn(&self.shape), out)
            .map_err(|e| FlowError::Internal(e.to_string()))
    }
}

impl Bijection for Permute {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, x)?;
        check_condition(None, condition)?;
        let (forward, _) = self.tables()?;
        self.apply(x, forward)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, y)?;
        check_condition(None, condition)?;
        let (_, backward) = self.tables()?;
        self.apply(y, backward)
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

impl ParamLeaves for Permute {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        f("indices", self.indices.view());
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self::from_leaf(f("indices", self.indices.view()))
    }
}

/// Axis reversal. Log-det 0, self-inverse.
#[derive(Debug, Clone)]
pub struct Flip {
    shape: Vec<usize>,
}

impl Flip {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }

    fn reversed(&self, v: &ArrayD<f64>) -> ArrayD<f64> {
        let mut out = v.clone();
        for ax in 0..out.ndim() {
            out.invert_axis(Axis(ax));
        }
        out
    }
}

impl Bijection for Flip {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, x)?;
        check_condition(None, condition)?;
        Ok(self.reversed(x))
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        self.transform(y, condition)
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

impl ParamLeaves for Flip {
    fn for_each_leaf(&self, _f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {}

    fn map_leaves(&self, _f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{select_layer, stack};
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_permute_round_trip() {
        let p = Permute::new(vec![2, 0, 1]).unwrap();
        let x = array![10.0, 20.0, 30.0].into_dyn();
        let y = p.transform(&x, None).unwrap();
        assert_eq!(y, array![30.0, 10.0, 20.0].into_dyn());
        assert_eq!(p.inverse(&y, None).unwrap(), x);
    }

    #[test]
    fn test_permute_log_det_zero() {
        let p = Permute::new(vec![1, 0]).unwrap();
        let (_, ld) = p
            .transform_and_log_det(&array![1.0, 2.0].into_dyn(), None)
            .unwrap();
        assert_eq!(ld, 0.0);
    }

    #[test]
    fn test_permute_rejects_non_permutation() {
        assert!(matches!(
            Permute::new(vec![0, 0, 2]),
            Err(FlowError::Config(_))
        ));
        assert!(matches!(
            Permute::new(vec![0, 3]),
            Err(FlowError::Config(_))
        ));
    }

    #[test]
    fn test_permute_random_is_deterministic_per_seed() {
        let mut a = ChaCha8Rng::seed_from_u64(11);
        let mut b = ChaCha8Rng::seed_from_u64(11);
        let pa = Permute::random(&mut a, 6).unwrap();
        let pb = Permute::random(&mut b, 6).unwrap();
        assert_eq!(pa.indices(), pb.indices());
    }

    #[test]
    fn test_permute_stack_and_slice_restores_tables() {
        let layers = vec![
            Permute::new(vec![2, 0, 1]).unwrap(),
            Permute::new(vec![1, 2, 0]).unwrap(),
        ];
        let stacked = stack(&layers).unwrap();
        let second = select_layer(&stacked, 1);
        assert_eq!(second.indices(), &[1, 2, 0]);
        let x = array![1.0, 2.0, 3.0].into_dyn();
        assert_eq!(
            second.transform(&x, None).unwrap(),
            layers[1].transform(&x, None).unwrap()
        );
    }

    #[test]
    fn test_flip_is_self_inverse() {
        let f = Flip::new(&[4]);
        let x = array![1.0, 2.0, 3.0, 4.0].into_dyn();
        let y = f.transform(&x, None).unwrap();
        assert_eq!(y, array![4.0, 3.0, 2.0, 1.0].into_dyn());
        assert_eq!(f.inverse(&y, None).unwrap(), x);
    }
}
