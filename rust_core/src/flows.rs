//! Ready-made flow architectures.
//!
//! Each preset builds `flow_layers` independently initialized layers,
//! stacks their parameter leaves, iterates them with a [`Scan`], and by
//! default wraps the result in [`Invert`] so that `log_prob` runs through
//! the layers' fast analytic direction. Presets require a rank-1 base
//! distribution.

use ndarray::{Array2, ArrayD, ArrayViewD, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::bijections::{
    check_input, AdditiveCondition, Bijection, BlockAutoregressiveNetwork, Coupling, Flip, InAxes,
    Invert, LeakyTanh, MaskedAutoregressive, Permute, Planar, RationalQuadraticSpline, Scan, Then,
    Transformer, TriangularAffine, Vmap,
};
use crate::distributions::{Distribution, Transformed};
use crate::errors::{FlowError, Result};
use crate::params::{self, ParamLeaves};

/// A flow preset's return type: the base distribution pushed through a
/// type-erased stack of layers.
pub type Flow<D> = Transformed<D, Box<dyn Bijection>>;

// ── Inter-layer permutations ─────────────────────────────────────────────

/// The permutation inserted after each flow layer.
///
/// The default strategy depends on the dimension: dimension 1 has nothing
/// to permute, dimension 2 alternates the two coordinates with a [`Flip`],
/// and anything larger draws a random [`Permute`] per layer.
#[derive(Debug, Clone)]
pub enum LayerPermutation {
    Identity(Vec<usize>),
    Flipped(Flip),
    Random(Permute),
}

impl LayerPermutation {
    pub fn default_for(rng: &mut ChaCha8Rng, dim: usize) -> Result<Self> {
        match dim {
            1 => Ok(Self::Identity(vec![1])),
            2 => Ok(Self::Flipped(Flip::new(&[2]))),
            _ => Ok(Self::Random(Permute::random(rng, dim)?)),
        }
    }

    /// Strategy name for the given dimension, usable as preset metadata.
    pub fn strategy_for(dim: usize) -> &'static str {
        match dim {
            1 => "none",
            2 => "flip",
            _ => "random",
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Identity(_) => "none",
            Self::Flipped(_) => "flip",
            Self::Random(_) => "random",
        }
    }
}

impl Bijection for LayerPermutation {
    fn shape(&self) -> &[usize] {
        match self {
            Self::Identity(shape) => shape,
            Self::Flipped(f) => f.shape(),
            Self::Random(p) => p.shape(),
        }
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        match self {
            Self::Identity(shape) => {
                check_input(shape, x)?;
                Ok(x.clone())
            }
            Self::Flipped(f) => f.transform(x, condition),
            Self::Random(p) => p.transform(x, condition),
        }
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        match self {
            Self::Identity(shape) => {
                check_input(shape, y)?;
                Ok(y.clone())
            }
            Self::Flipped(f) => f.inverse(y, condition),
            Self::Random(p) => p.inverse(y, condition),
        }
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

impl ParamLeaves for LayerPermutation {
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        if let Self::Random(p) = self {
            p.for_each_leaf(f);
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        match self {
            Self::Identity(shape) => Self::Identity(shape.clone()),
            Self::Flipped(flip) => Self::Flipped(flip.map_leaves(f)),
            Self::Random(p) => Self::Random(p.map_leaves(f)),
        }
    }
}

// ── Shared plumbing ──────────────────────────────────────────────────────

fn vector_dim(shape: &[usize]) -> Result<usize> {
    match shape {
        [d] if *d > 0 => Ok(*d),
        other => Err(FlowError::Config(format!(
            "flow presets require a rank-1 base distribution, got shape {other:?}"
        ))),
    }
}

/// Stack the layers, wrap them in a `Scan`, flip the orientation if
/// requested, and attach the base distribution.
fn finish<D, L>(base: D, layers: Vec<L>, invert: bool) -> Result<Flow<D>>
where
    D: Distribution,
    L: Bijection + ParamLeaves + Clone + 'static,
{
    if layers.is_empty() {
        return Err(FlowError::Config("flow_layers must be non-zero".into()));
    }
    let scan = Scan::new(params::stack(&layers)?)?;
    let bijection: Box<dyn Bijection> = if invert {
        Box::new(Invert(scan))
    } else {
        Box::new(scan)
    };
    Transformed::new(base, bijection)
}

// ── Coupling flow (RealNVP-style) ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CouplingFlowConfig {
    pub flow_layers: usize,
    pub nn_width: usize,
    pub nn_depth: usize,
    /// Orient the flow so `log_prob` uses the analytic direction.
    pub invert: bool,
}

impl Default for CouplingFlowConfig {
    fn default() -> Self {
        Self {
            flow_layers: 8,
            nn_width: 40,
            nn_depth: 2,
            invert: true,
        }
    }
}

/// Coupling flow: each layer transforms half the coordinates element-wise
/// with parameters predicted from the other half, then permutes.
pub fn coupling_flow<D, T>(
    rng: &mut ChaCha8Rng,
    base: D,
    transformer: &T,
    cond_shape: Option<&[usize]>,
    config: &CouplingFlowConfig,
) -> Result<Flow<D>>
where
    D: Distribution,
    T: Transformer + Clone + 'static,
{
    let dim = vector_dim(base.shape())?;
    let mut layers = Vec::with_capacity(config.flow_layers);
    for _ in 0..config.flow_layers {
        let coupling = Coupling::new(
            rng,
            transformer.clone(),
            dim,
            dim / 2,
            cond_shape,
            config.nn_width,
            config.nn_depth,
        )?;
        layers.push(Then::new(coupling, LayerPermutation::default_for(rng, dim)?)?);
    }
    finish(base, layers, config.invert)
}

// ── Masked autoregressive flow ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MaskedAutoregressiveFlowConfig {
    pub flow_layers: usize,
    pub nn_width: usize,
    pub nn_depth: usize,
    pub invert: bool,
}

impl Default for MaskedAutoregressiveFlowConfig {
    fn default() -> Self {
        Self {
            flow_layers: 8,
            nn_width: 40,
            nn_depth: 2,
            invert: true,
        }
    }
}

/// Masked autoregressive flow: one masked MLP pass per layer produces
/// every element's transformer parameters at once.
pub fn masked_autoregressive_flow<D, T>(
    rng: &mut ChaCha8Rng,
    base: D,
    transformer: &T,
    cond_shape: Option<&[usize]>,
    config: &MaskedAutoregressiveFlowConfig,
) -> Result<Flow<D>>
where
    D: Distribution,
    T: Transformer + Clone + 'static,
{
    let dim = vector_dim(base.shape())?;
    let mut layers = Vec::with_capacity(config.flow_layers);
    for _ in 0..config.flow_layers {
        let maf = MaskedAutoregressive::new(
            rng,
            transformer.clone(),
            dim,
            cond_shape,
            config.nn_width,
            config.nn_depth,
        )?;
        layers.push(Then::new(maf, LayerPermutation::default_for(rng, dim)?)?);
    }
    finish(base, layers, config.invert)
}

// ── Block neural autoregressive flow ─────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BlockNeuralAutoregressiveFlowConfig {
    pub flow_layers: usize,
    pub nn_depth: usize,
    pub block_dim: usize,
    pub invert: bool,
}

impl Default for BlockNeuralAutoregressiveFlowConfig {
    fn default() -> Self {
        Self {
            flow_layers: 1,
            nn_depth: 1,
            block_dim: 8,
            invert: true,
        }
    }
}

/// Block neural autoregressive flow. The network itself is strictly
/// monotone, so with the default orientation the flow supports `log_prob`
/// but not sampling.
pub fn block_neural_autoregressive_flow<D>(
    rng: &mut ChaCha8Rng,
    base: D,
    cond_shape: Option<&[usize]>,
    config: &BlockNeuralAutoregressiveFlowConfig,
) -> Result<Flow<D>>
where
    D: Distribution,
{
    let dim = vector_dim(base.shape())?;
    let mut layers = Vec::with_capacity(config.flow_layers);
    for _ in 0..config.flow_layers {
        let network = BlockAutoregressiveNetwork::new(
            rng,
            dim,
            cond_shape,
            config.nn_depth,
            config.block_dim,
        )?;
        layers.push(Then::new(network, LayerPermutation::default_for(rng, dim)?)?);
    }
    finish(base, layers, config.invert)
}

// ── Planar flow ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PlanarFlowConfig {
    pub flow_layers: usize,
    /// Conditioner width and depth, used only for conditional flows.
    pub nn_width: usize,
    pub nn_depth: usize,
    pub invert: bool,
}

impl Default for PlanarFlowConfig {
    fn default() -> Self {
        Self {
            flow_layers: 8,
            nn_width: 40,
            nn_depth: 2,
            invert: true,
        }
    }
}

/// Planar flow. The planar map has no analytic inverse, so with the
/// default orientation the flow supports `log_prob` but not sampling.
pub fn planar_flow<D>(
    rng: &mut ChaCha8Rng,
    base: D,
    cond_shape: Option<&[usize]>,
    config: &PlanarFlowConfig,
) -> Result<Flow<D>>
where
    D: Distribution,
{
    let dim = vector_dim(base.shape())?;
    let mut layers = Vec::with_capacity(config.flow_layers);
    for _ in 0..config.flow_layers {
        let planar = match cond_shape {
            Some(cs) => Planar::conditional(rng, dim, cs, config.nn_width, config.nn_depth)?,
            None => Planar::new(rng, dim)?,
        };
        layers.push(Then::new(planar, LayerPermutation::default_for(rng, dim)?)?);
    }
    finish(base, layers, config.invert)
}

// ── Triangular spline flow ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TriangularSplineFlowConfig {
    pub flow_layers: usize,
    pub knots: usize,
    pub tanh_max_val: f64,
    pub invert: bool,
}

impl Default for TriangularSplineFlowConfig {
    fn default() -> Self {
        Self {
            flow_layers: 8,
            knots: 8,
            tanh_max_val: 3.0,
            invert: true,
        }
    }
}

type TriangularSplineCore = Then<
    Then<TriangularAffine, Invert<LeakyTanh>>,
    Then<Vmap<RationalQuadraticSpline>, Then<LeakyTanh, LayerPermutation>>,
>;

fn triangular_spline_core(
    rng: &mut ChaCha8Rng,
    dim: usize,
    config: &TriangularSplineFlowConfig,
) -> Result<TriangularSplineCore> {
    // Weight-normalized lower-triangular matrix near the identity.
    let tri = Array2::from_shape_fn((dim, dim), |(i, j)| {
        if i == j {
            1.0
        } else if j < i {
            0.1 * rng.sample::<f64, _>(rand_distr::StandardNormal)
        } else {
            0.0
        }
    })
    .into_dyn();
    let tri_affine = TriangularAffine::new(ArrayD::zeros(IxDyn(&[dim])), tri, true)?;

    // Identity-initialized splines on [-1, 1], one per coordinate, acting
    // between the tanh squash and its inverse.
    let splines: Vec<RationalQuadraticSpline> = (0..dim)
        .map(|_| RationalQuadraticSpline::new(config.knots, 1.0))
        .collect::<Result<_>>()?;
    let splines = Vmap::new(params::stack(&splines)?, Some(InAxes::All(0)), None, None)?;

    let squash = LeakyTanh::new(config.tanh_max_val, &[dim])?;
    let unsquash = Invert(LeakyTanh::new(config.tanh_max_val, &[dim])?);
    Then::new(
        Then::new(tri_affine, unsquash)?,
        Then::new(
            splines,
            Then::new(squash, LayerPermutation::default_for(rng, dim)?)?,
        )?,
    )
}

/// Triangular spline flow: a dense triangular affine map, a per-coordinate
/// rational quadratic spline applied in tanh space, and a permutation. For
/// conditional flows each layer first adds a learned shift of the
/// condition.
pub fn triangular_spline_flow<D>(
    rng: &mut ChaCha8Rng,
    base: D,
    cond_shape: Option<&[usize]>,
    config: &TriangularSplineFlowConfig,
) -> Result<Flow<D>>
where
    D: Distribution,
{
    let dim = vector_dim(base.shape())?;
    match cond_shape {
        Some(cs) => {
            let cond_dim: usize = cs.iter().product();
            let mut layers = Vec::with_capacity(config.flow_layers);
            for _ in 0..config.flow_layers {
                let shift = AdditiveCondition::new(
                    crate::nn::Linear::new(rng, cond_dim, dim),
                    &[dim],
                    cs,
                );
                layers.push(Then::new(shift, triangular_spline_core(rng, dim, config)?)?);
            }
            finish(base, layers, config.invert)
        }
        None => {
            let mut layers = Vec::with_capacity(config.flow_layers);
            for _ in 0..config.flow_layers {
                layers.push(triangular_spline_core(rng, dim, config)?);
            }
            finish(base, layers, config.invert)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::AffineTransformer;
    use crate::distributions::StandardNormal;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    #[test]
    fn test_default_permutation_strategy() {
        assert_eq!(LayerPermutation::strategy_for(1), "none");
        assert_eq!(LayerPermutation::strategy_for(2), "flip");
        assert_eq!(LayerPermutation::strategy_for(5), "random");
        let perm = LayerPermutation::default_for(&mut rng(0), 5).unwrap();
        assert_eq!(perm.strategy(), "random");
    }

    #[test]
    fn test_presets_require_rank1_base() {
        let base = StandardNormal::new(&[2, 2]);
        let err = coupling_flow(
            &mut rng(0),
            base,
            &AffineTransformer::default(),
            None,
            &CouplingFlowConfig::default(),
        );
        assert!(matches!(err, Err(FlowError::Config(_))));
    }

    #[test]
    fn test_coupling_flow_sample_and_density_agree() {
        let flow = coupling_flow(
            &mut rng(1),
            StandardNormal::new(&[4]),
            &AffineTransformer::default(),
            None,
            &CouplingFlowConfig {
                flow_layers: 3,
                nn_width: 16,
                nn_depth: 1,
                invert: true,
            },
        )
        .unwrap();
        let (samples, lps) = flow.sample_and_log_prob(&mut rng(2), None, &[6]).unwrap();
        assert_eq!(samples.shape(), &[6, 4]);
        let recomputed = flow.log_prob(&samples, None).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(
                lps[IxDyn(&[i])],
                recomputed[IxDyn(&[i])],
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn test_coupling_flow_is_reproducible() {
        let build = |seed| {
            coupling_flow(
                &mut rng(seed),
                StandardNormal::new(&[3]),
                &AffineTransformer::default(),
                None,
                &CouplingFlowConfig {
                    flow_layers: 2,
                    nn_width: 8,
                    nn_depth: 1,
                    invert: true,
                },
            )
            .unwrap()
        };
        let a = build(9).sample(&mut rng(5), None, &[4]).unwrap();
        let b = build(9).sample(&mut rng(5), None, &[4]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_coupling_flow_conditional_broadcasting() {
        let flow = coupling_flow(
            &mut rng(13),
            StandardNormal::new(&[2]),
            &AffineTransformer::default(),
            Some(&[4]),
            &CouplingFlowConfig {
                flow_layers: 2,
                nn_width: 8,
                nn_depth: 1,
                invert: true,
            },
        )
        .unwrap();
        let condition =
            ArrayD::from_shape_fn(IxDyn(&[5, 4]), |ix| ix[0] as f64 * 0.3 - ix[1] as f64 * 0.1);
        let s = flow.sample(&mut rng(14), Some(&condition), &[3]).unwrap();
        assert_eq!(s.shape(), &[3, 5, 2]);
        let lp = flow.log_prob(&s, Some(&condition)).unwrap();
        assert_eq!(lp.shape(), &[3, 5]);
        assert!(lp.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_masked_autoregressive_flow_conditional() {
        let flow = masked_autoregressive_flow(
            &mut rng(3),
            StandardNormal::new(&[3]),
            &AffineTransformer::default(),
            Some(&[2]),
            &MaskedAutoregressiveFlowConfig {
                flow_layers: 2,
                nn_width: 16,
                nn_depth: 1,
                invert: true,
            },
        )
        .unwrap();
        let condition = ndarray::array![0.4, -1.0].into_dyn();
        let s = flow.sample(&mut rng(4), Some(&condition), &[5]).unwrap();
        assert_eq!(s.shape(), &[5, 3]);
        let lp = flow.log_prob(&s, Some(&condition)).unwrap();
        assert_eq!(lp.shape(), &[5]);
        assert!(lp.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_bnaf_density_only() {
        let flow = block_neural_autoregressive_flow(
            &mut rng(5),
            StandardNormal::new(&[2]),
            None,
            &BlockNeuralAutoregressiveFlowConfig::default(),
        )
        .unwrap();
        let x = ndarray::array![0.3, -0.7].into_dyn();
        let lp = flow.log_prob(&x, None).unwrap();
        assert!(lp[IxDyn(&[] as &[usize])].is_finite());
        assert!(matches!(
            flow.sample(&mut rng(6), None, &[1]),
            Err(FlowError::NoAnalyticInverse)
        ));
    }

    #[test]
    fn test_planar_flow_density_only() {
        let flow = planar_flow(
            &mut rng(7),
            StandardNormal::new(&[2]),
            None,
            &PlanarFlowConfig {
                flow_layers: 3,
                nn_width: 8,
                nn_depth: 1,
                invert: true,
            },
        )
        .unwrap();
        let x = ndarray::array![0.1, 0.2].into_dyn();
        assert!(flow.log_prob(&x, None).unwrap()[IxDyn(&[] as &[usize])].is_finite());
        assert!(matches!(
            flow.sample(&mut rng(8), None, &[1]),
            Err(FlowError::NoAnalyticInverse)
        ));
    }

    #[test]
    fn test_triangular_spline_flow_round_trip() {
        let flow = triangular_spline_flow(
            &mut rng(9),
            StandardNormal::new(&[3]),
            None,
            &TriangularSplineFlowConfig {
                flow_layers: 2,
                knots: 6,
                tanh_max_val: 3.0,
                invert: true,
            },
        )
        .unwrap();
        let (samples, lps) = flow.sample_and_log_prob(&mut rng(10), None, &[4]).unwrap();
        assert_eq!(samples.shape(), &[4, 3]);
        let recomputed = flow.log_prob(&samples, None).unwrap();
        for i in 0..4 {
            assert_abs_diff_eq!(
                lps[IxDyn(&[i])],
                recomputed[IxDyn(&[i])],
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_triangular_spline_flow_conditional_shapes() {
        let flow = triangular_spline_flow(
            &mut rng(11),
            StandardNormal::new(&[2]),
            Some(&[3]),
            &TriangularSplineFlowConfig {
                flow_layers: 2,
                knots: 5,
                tanh_max_val: 3.0,
                invert: true,
            },
        )
        .unwrap();
        let condition = ArrayD::from_shape_fn(IxDyn(&[4, 3]), |ix| ix[1] as f64 * 0.2);
        let s = flow.sample(&mut rng(12), Some(&condition), &[2]).unwrap();
        assert_eq!(s.shape(), &[2, 4, 2]);
        let lp = flow.log_prob(&s, Some(&condition)).unwrap();
        assert_eq!(lp.shape(), &[2, 4]);
    }

    #[test]
    fn test_zero_layers_rejected() {
        let err = planar_flow(
            &mut rng(0),
            StandardNormal::new(&[2]),
            None,
            &PlanarFlowConfig {
                flow_layers: 0,
                ..PlanarFlowConfig::default()
            },
        );
        assert!(matches!(err, Err(FlowError::Config(_))));
    }
}
