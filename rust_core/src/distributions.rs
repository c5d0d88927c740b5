//! Probability distributions with trailing-shape contracts, numpy-style
//! batch broadcasting, and exact change-of-variables through bijections.
//!
//! Sampling is driven by a caller-seeded `ChaCha8Rng`; the library never
//! constructs or reseeds an RNG internally, so runs are reproducible from
//! a single seed.

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{
    Cauchy as CauchyDist, Continuous, Normal as NormalDist, StudentsT as StudentsTDist,
    Uniform as UniformDist,
};

use crate::bijections::{Affine, Bijection, Chain};
use crate::errors::{FlowError, Result};
use crate::shapes::{
    broadcast_index, broadcast_shapes, for_each_index, index_leading, index_leading_mut,
    leading_dims,
};

// ── Trait ────────────────────────────────────────────────────────────────

/// A distribution over arrays of a fixed trailing `shape`, optionally
/// conditional on arrays of trailing `cond_shape`.
///
/// Implementors provide the single-point `*_raw` methods; the provided
/// `sample`/`log_prob` wrappers add the broadcasting contract: a condition
/// may carry extra leading (batch) dimensions, samples gain
/// `sample_shape + cond_leading` in front of `shape`, and `log_prob`
/// broadcasts the input's leading dimensions against the condition's.
pub trait Distribution: Send + Sync {
    fn shape(&self) -> &[usize];

    fn cond_shape(&self) -> Option<&[usize]>;

    /// One draw under a single (unbatched) condition.
    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>>;

    /// Log density of a single point under a single condition.
    fn log_prob_raw(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<f64>;

    /// One draw together with its log density. Overridden by
    /// [`Transformed`] to avoid the inverse pass.
    fn sample_and_log_prob_raw(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        let x = self.sample_raw(rng, condition)?;
        let lp = self.log_prob_raw(&x, condition)?;
        Ok((x, lp))
    }

    /// Draw `sample_shape` independent samples per condition batch
    /// element; output shape is `sample_shape + cond_leading + shape`.
    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
        sample_shape: &[usize],
    ) -> Result<ArrayD<f64>> {
        let cond_leading = self.condition_leading(condition)?;
        let mut out_shape = sample_shape.to_vec();
        out_shape.extend_from_slice(&cond_leading);
        out_shape.extend_from_slice(self.shape());
        let mut out = ArrayD::zeros(IxDyn(&out_shape));
        for s_idx in collect_indices(sample_shape) {
            for c_idx in collect_indices(&cond_leading) {
                let cond = slice_condition(condition, &c_idx);
                let draw = self.sample_raw(rng, cond.as_ref())?;
                let mut full = s_idx.clone();
                full.extend_from_slice(&c_idx);
                index_leading_mut(&mut out, &full).assign(&draw);
            }
        }
        Ok(out)
    }

    /// Log density of a (possibly batched) input under a (possibly
    /// batched) condition; the output carries the broadcast leading dims.
    fn log_prob(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        let cond_leading = self.condition_leading(condition)?;
        let x_leading = leading_dims(x.shape(), self.shape())?.to_vec();
        let out_leading = broadcast_shapes(&x_leading, &cond_leading)?;
        let mut out = ArrayD::zeros(IxDyn(&out_leading));
        for idx in collect_indices(&out_leading) {
            let xi = index_leading(x, &broadcast_index(&idx, &x_leading)).to_owned();
            let cond = slice_condition(condition, &broadcast_index(&idx, &cond_leading));
            out[IxDyn(&idx)] = self.log_prob_raw(&xi, cond.as_ref())?;
        }
        Ok(out)
    }

    /// Samples plus their log densities in one pass; the log-prob array
    /// has shape `sample_shape + cond_leading`.
    fn sample_and_log_prob(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
        sample_shape: &[usize],
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let cond_leading = self.condition_leading(condition)?;
        let mut lead = sample_shape.to_vec();
        lead.extend_from_slice(&cond_leading);
        let mut out_shape = lead.clone();
        out_shape.extend_from_slice(self.shape());
        let mut samples = ArrayD::zeros(IxDyn(&out_shape));
        let mut log_probs = ArrayD::zeros(IxDyn(&lead));
        for s_idx in collect_indices(sample_shape) {
            for c_idx in collect_indices(&cond_leading) {
                let cond = slice_condition(condition, &c_idx);
                let (draw, lp) = self.sample_and_log_prob_raw(rng, cond.as_ref())?;
                let mut full = s_idx.clone();
                full.extend_from_slice(&c_idx);
                index_leading_mut(&mut samples, &full).assign(&draw);
                log_probs[IxDyn(&full)] = lp;
            }
        }
        Ok((samples, log_probs))
    }

    /// Leading (batch) dims of the condition, after validating presence
    /// and trailing shape.
    fn condition_leading(&self, condition: Option<&ArrayD<f64>>) -> Result<Vec<usize>> {
        match (self.cond_shape(), condition) {
            (None, None) => Ok(Vec::new()),
            (None, Some(_)) => Err(FlowError::ConditionMismatch(
                "condition given to an unconditional distribution".into(),
            )),
            (Some(_), None) => Err(FlowError::ConditionMismatch(
                "conditional distribution called without a condition".into(),
            )),
            (Some(cs), Some(c)) => leading_dims(c.shape(), cs)
                .map(|l| l.to_vec())
                .map_err(|_| {
                    FlowError::ConditionMismatch(format!(
                        "expected condition trailing shape {:?}, got {:?}",
                        cs,
                        c.shape()
                    ))
                }),
        }
    }
}

fn collect_indices(shape: &[usize]) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    // Only fails if the closure fails.
    let _ = for_each_index(shape, |idx| {
        out.push(idx.to_vec());
        Ok(())
    });
    out
}

fn slice_condition(condition: Option<&ArrayD<f64>>, idx: &[usize]) -> Option<ArrayD<f64>> {
    condition.map(|c| index_leading(c, idx).to_owned())
}

/// Forward the condition to a sub-object only if that part is conditional.
fn conditional_only<'a>(
    cond_shape: Option<&[usize]>,
    condition: Option<&'a ArrayD<f64>>,
) -> Option<&'a ArrayD<f64>> {
    if cond_shape.is_some() {
        condition
    } else {
        None
    }
}

fn check_point(shape: &[usize], x: &ArrayD<f64>) -> Result<()> {
    if x.shape() != shape {
        return Err(FlowError::ShapeMismatch {
            expected: shape.to_vec(),
            got: x.shape().to_vec(),
        });
    }
    Ok(())
}

// ── Standard base distributions ──────────────────────────────────────────

/// Independent standard normal entries over `shape`.
#[derive(Debug, Clone)]
pub struct StandardNormal {
    shape: Vec<usize>,
}

impl StandardNormal {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }
}

impl Distribution for StandardNormal {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        _condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(ArrayD::from_shape_fn(IxDyn(&self.shape), |_| {
            rng.sample::<f64, _>(rand_distr::StandardNormal)
        }))
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, _condition: Option<&ArrayD<f64>>) -> Result<f64> {
        check_point(&self.shape, x)?;
        let normal = NormalDist::new(0.0, 1.0).map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(x.iter().map(|&v| normal.ln_pdf(v)).sum())
    }
}

/// Independent uniform entries on `[0, 1)` over `shape`.
#[derive(Debug, Clone)]
pub struct StandardUniform {
    shape: Vec<usize>,
}

impl StandardUniform {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }
}

impl Distribution for StandardUniform {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        _condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        Ok(ArrayD::from_shape_fn(IxDyn(&self.shape), |_| {
            rng.gen::<f64>()
        }))
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, _condition: Option<&ArrayD<f64>>) -> Result<f64> {
        check_point(&self.shape, x)?;
        let uniform =
            UniformDist::new(0.0, 1.0).map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(x.iter().map(|&v| uniform.ln_pdf(v)).sum())
    }
}

/// Independent standard Gumbel entries over `shape`.
///
/// statrs has no Gumbel density, so the closed form `-(x + exp(-x))` is
/// used directly.
#[derive(Debug, Clone)]
pub struct StandardGumbel {
    shape: Vec<usize>,
}

impl StandardGumbel {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }
}

impl Distribution for StandardGumbel {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        _condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        let gumbel =
            rand_distr::Gumbel::new(0.0, 1.0).map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(ArrayD::from_shape_fn(IxDyn(&self.shape), |_| {
            rng.sample(gumbel)
        }))
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, _condition: Option<&ArrayD<f64>>) -> Result<f64> {
        check_point(&self.shape, x)?;
        Ok(x.iter().map(|&v| -(v + (-v).exp())).sum())
    }
}

/// Independent standard Cauchy entries over `shape`.
#[derive(Debug, Clone)]
pub struct StandardCauchy {
    shape: Vec<usize>,
}

impl StandardCauchy {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }
}

impl Distribution for StandardCauchy {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        _condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        let cauchy =
            rand_distr::Cauchy::new(0.0, 1.0).map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(ArrayD::from_shape_fn(IxDyn(&self.shape), |_| {
            rng.sample(cauchy)
        }))
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, _condition: Option<&ArrayD<f64>>) -> Result<f64> {
        check_point(&self.shape, x)?;
        let cauchy = CauchyDist::new(0.0, 1.0).map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(x.iter().map(|&v| cauchy.ln_pdf(v)).sum())
    }
}

/// Independent Student-t entries over `shape` with broadcastable degrees
/// of freedom.
#[derive(Debug, Clone)]
pub struct StandardStudentT {
    df: ArrayD<f64>,
    shape: Vec<usize>,
}

impl StandardStudentT {
    pub fn new(df: ArrayD<f64>, shape: &[usize]) -> Result<Self> {
        let df = df
            .broadcast(IxDyn(shape))
            .ok_or_else(|| {
                FlowError::Config("degrees of freedom do not broadcast to shape".into())
            })?
            .to_owned();
        if df.iter().any(|&d| !(d.is_finite() && d > 0.0)) {
            return Err(FlowError::Config(
                "degrees of freedom must be positive and finite".into(),
            ));
        }
        Ok(Self {
            df,
            shape: shape.to_vec(),
        })
    }

    pub fn df(&self) -> &ArrayD<f64> {
        &self.df
    }
}

impl Distribution for StandardStudentT {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        _condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        let mut out = ArrayD::zeros(IxDyn(&self.shape));
        for (o, &nu) in out.iter_mut().zip(self.df.iter()) {
            let t =
                rand_distr::StudentT::new(nu).map_err(|e| FlowError::Internal(e.to_string()))?;
            *o = rng.sample(t);
        }
        Ok(out)
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, _condition: Option<&ArrayD<f64>>) -> Result<f64> {
        check_point(&self.shape, x)?;
        let mut total = 0.0;
        for (&v, &nu) in x.iter().zip(self.df.iter()) {
            let t = StudentsTDist::new(0.0, 1.0, nu)
                .map_err(|e| FlowError::Internal(e.to_string()))?;
            total += t.ln_pdf(v);
        }
        Ok(total)
    }
}

// ── Transformed ──────────────────────────────────────────────────────────

/// Pushforward of `base` through `bijection` (change of variables).
///
/// `log_prob(x) = base.log_prob(inverse(x)) + log|det J_inverse(x)|`, and
/// sampling transforms base draws forward. A condition is routed to
/// whichever of the two parts declares a `cond_shape`.
#[derive(Clone)]
pub struct Transformed<D, B> {
    base: D,
    bijection: B,
    cond_shape: Option<Vec<usize>>,
}

impl<D: Distribution, B: Bijection> Transformed<D, B> {
    pub fn new(base: D, bijection: B) -> Result<Self> {
        if base.shape() != bijection.shape() {
            return Err(FlowError::ShapeMismatch {
                expected: base.shape().to_vec(),
                got: bijection.shape().to_vec(),
            });
        }
        let cond_shape = match (base.cond_shape(), bijection.cond_shape()) {
            (None, None) => None,
            (Some(cs), None) | (None, Some(cs)) => Some(cs.to_vec()),
            (Some(a), Some(b)) => {
                if a != b {
                    return Err(FlowError::ConditionMismatch(format!(
                        "base and bijection disagree on condition shape: {:?} vs {:?}",
                        a, b
                    )));
                }
                Some(a.to_vec())
            }
        };
        Ok(Self {
            base,
            bijection,
            cond_shape,
        })
    }

    pub fn base(&self) -> &D {
        &self.base
    }

    pub fn bijection(&self) -> &B {
        &self.bijection
    }
}

impl<D, B2, B> Transformed<Transformed<D, B2>, B>
where
    D: Distribution,
    B2: Bijection + 'static,
    B: Bijection + 'static,
{
    /// Collapse a transformed base into a single `Transformed` whose
    /// bijection is the chain `[inner, outer]`.
    pub fn merge_transforms(self) -> Result<Transformed<D, Chain>> {
        let Transformed {
            base: inner,
            bijection: outer,
            ..
        } = self;
        let chain = Chain::new(vec![Box::new(inner.bijection), Box::new(outer)])?;
        Transformed::new(inner.base, chain)
    }
}

impl<D: Distribution, B: Bijection> Distribution for Transformed<D, B> {
    fn shape(&self) -> &[usize] {
        self.base.shape()
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.cond_shape.as_deref()
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        let z = self
            .base
            .sample_raw(rng, conditional_only(self.base.cond_shape(), condition))?;
        self.bijection
            .transform(&z, conditional_only(self.bijection.cond_shape(), condition))
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<f64> {
        check_point(self.shape(), x)?;
        let (z, inv_log_det) = self
            .bijection
            .inverse_and_log_det(x, conditional_only(self.bijection.cond_shape(), condition))?;
        let base_lp = self
            .base
            .log_prob_raw(&z, conditional_only(self.base.cond_shape(), condition))?;
        Ok(base_lp + inv_log_det)
    }

    fn sample_and_log_prob_raw(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        // One forward pass; no inverse needed, which matters for flows
        // whose inverse is iterative or unavailable.
        let (z, base_lp) = self
            .base
            .sample_and_log_prob_raw(rng, conditional_only(self.base.cond_shape(), condition))?;
        let (x, fwd_log_det) = self.bijection.transform_and_log_det(
            &z,
            conditional_only(self.bijection.cond_shape(), condition),
        )?;
        Ok((x, base_lp - fwd_log_det))
    }
}

// ── Location-scale families ──────────────────────────────────────────────

fn loc_scale_affine(loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Affine> {
    if scale.iter().any(|&s| s <= 0.0) {
        return Err(FlowError::Config("scale must be strictly positive".into()));
    }
    Affine::new(loc, scale)
}

macro_rules! loc_scale_family {
    ($(#[$doc:meta])* $name:ident, $base:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            inner: Transformed<$base, Affine>,
        }

        impl $name {
            pub fn loc(&self) -> &ArrayD<f64> {
                self.inner.bijection().loc()
            }

            pub fn scale(&self) -> &ArrayD<f64> {
                self.inner.bijection().scale()
            }
        }

        impl Distribution for $name {
            fn shape(&self) -> &[usize] {
                self.inner.shape()
            }

            fn cond_shape(&self) -> Option<&[usize]> {
                None
            }

            fn sample_raw(
                &self,
                rng: &mut ChaCha8Rng,
                condition: Option<&ArrayD<f64>>,
            ) -> Result<ArrayD<f64>> {
                self.inner.sample_raw(rng, condition)
            }

            fn log_prob_raw(
                &self,
                x: &ArrayD<f64>,
                condition: Option<&ArrayD<f64>>,
            ) -> Result<f64> {
                self.inner.log_prob_raw(x, condition)
            }
        }
    };
}

loc_scale_family!(
    /// `Normal(loc, scale)` with independent entries; loc and scale
    /// broadcast against each other.
    Normal,
    StandardNormal
);

loc_scale_family!(
    /// `Gumbel(loc, scale)` with independent entries.
    Gumbel,
    StandardGumbel
);

loc_scale_family!(
    /// `Cauchy(loc, scale)` with independent entries.
    Cauchy,
    StandardCauchy
);

impl Normal {
    pub fn new(loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Self> {
        let affine = loc_scale_affine(loc, scale)?;
        let base = StandardNormal::new(affine.shape());
        Ok(Self {
            inner: Transformed::new(base, affine)?,
        })
    }
}

impl Gumbel {
    pub fn new(loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Self> {
        let affine = loc_scale_affine(loc, scale)?;
        let base = StandardGumbel::new(affine.shape());
        Ok(Self {
            inner: Transformed::new(base, affine)?,
        })
    }
}

impl Cauchy {
    pub fn new(loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Self> {
        let affine = loc_scale_affine(loc, scale)?;
        let base = StandardCauchy::new(affine.shape());
        Ok(Self {
            inner: Transformed::new(base, affine)?,
        })
    }
}

/// `Uniform(min, max)` with independent entries, built as an affine
/// pushforward of `StandardUniform`.
#[derive(Clone)]
pub struct Uniform {
    inner: Transformed<StandardUniform, Affine>,
}

impl Uniform {
    pub fn new(min: ArrayD<f64>, max: ArrayD<f64>) -> Result<Self> {
        let shape = broadcast_shapes(min.shape(), max.shape())?;
        let min = min
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| FlowError::Config("min does not broadcast".into()))?
            .to_owned();
        let max = max
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| FlowError::Config("max does not broadcast".into()))?
            .to_owned();
        if min.iter().zip(max.iter()).any(|(&lo, &hi)| lo >= hi) {
            return Err(FlowError::Config("uniform requires min < max".into()));
        }
        let width = &max - &min;
        let affine = Affine::new(min, width)?;
        let base = StandardUniform::new(affine.shape());
        Ok(Self {
            inner: Transformed::new(base, affine)?,
        })
    }

    pub fn min(&self) -> &ArrayD<f64> {
        self.inner.bijection().loc()
    }
}

impl Distribution for Uniform {
    fn shape(&self) -> &[usize] {
        self.inner.shape()
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        self.inner.sample_raw(rng, condition)
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<f64> {
        self.inner.log_prob_raw(x, condition)
    }
}

/// `StudentT(df, loc, scale)` with independent entries.
#[derive(Clone)]
pub struct StudentT {
    inner: Transformed<StandardStudentT, Affine>,
}

impl StudentT {
    pub fn new(df: ArrayD<f64>, loc: ArrayD<f64>, scale: ArrayD<f64>) -> Result<Self> {
        let affine = loc_scale_affine(loc, scale)?;
        let base = StandardStudentT::new(df, affine.shape())?;
        Ok(Self {
            inner: Transformed::new(base, affine)?,
        })
    }

    pub fn df(&self) -> &ArrayD<f64> {
        self.inner.base().df()
    }

    pub fn loc(&self) -> &ArrayD<f64> {
        self.inner.bijection().loc()
    }

    pub fn scale(&self) -> &ArrayD<f64> {
        self.inner.bijection().scale()
    }
}

impl Distribution for StudentT {
    fn shape(&self) -> &[usize] {
        self.inner.shape()
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        None
    }

    fn sample_raw(
        &self,
        rng: &mut ChaCha8Rng,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<ArrayD<f64>> {
        self.inner.sample_raw(rng, condition)
    }

    fn log_prob_raw(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<f64> {
        self.inner.log_prob_raw(x, condition)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
