//! Sequential composition of heterogeneous bijections.

use ndarray::{ArrayD, ArrayViewD};

use crate::bijections::{check_condition, check_input, child_condition, Bijection};
use crate::errors::{FlowError, Result};
use crate::params::ParamLeaves;

fn unify_cond_shapes<'a>(
    shapes: impl Iterator<Item = Option<&'a [usize]>>,
) -> Result<Option<Vec<usize>>> {
    let mut unified: Option<Vec<usize>> = None;
    for cs in shapes.flatten() {
        match &unified {
            None => unified = Some(cs.to_vec()),
            Some(prev) if prev.as_slice() != cs => {
                return Err(FlowError::ConditionMismatch(format!(
                    "children disagree on condition shape: {:?} vs {:?}",
                    prev, cs
                )));
            }
            Some(_) => {}
        }
    }
    Ok(unified)
}

/// A chain applies its children in order on the forward pass and in reverse
/// order on the inverse pass, summing log determinants either way.
///
/// All children must share the chain's shape. Conditional children must
/// agree on a single condition shape, which becomes the chain's; the
/// condition is forwarded only to the children that declare one.
pub struct Chain {
    children: Vec<Box<dyn Bijection>>,
    shape: Vec<usize>,
    cond_shape: Option<Vec<usize>>,
}

impl Chain {
    pub fn new(children: Vec<Box<dyn Bijection>>) -> Result<Self> {
        let first = children
            .first()
            .ok_or_else(|| FlowError::Config("chain needs at least one bijection".into()))?;
        let shape = first.shape().to_vec();
        for child in &children {
            if child.shape() != shape.as_slice() {
                return Err(FlowError::ShapeMismatch {
                    expected: shape.clone(),
                    got: child.shape().to_vec(),
                });
            }
        }
        let cond_shape = unify_cond_shapes(children.iter().map(|c| c.cond_shape()))?;
        Ok(Self {
            children,
            shape,
            cond_shape,
        })
    }

    pub fn children(&self) -> &[Box<dyn Bijection>] {
        &self.children
    }

    /// Flatten nested chains into a single level, preserving order.
    ///
    /// The downcast sees one level of boxing: a chain hidden behind a
    /// re-boxed `Box<dyn Bijection>` child stays a single child. No
    /// in-crate constructor produces that nesting, and an unmerged child
    /// still applies correctly.
    pub fn merge_chains(self) -> Self {
        let mut flat: Vec<Box<dyn Bijection>> = Vec::new();
        let mut stack: Vec<Box<dyn Bijection>> = self.children.into_iter().rev().collect();
        while let Some(mut child) = stack.pop() {
            let nested = (&mut *child)
                .as_any_mut()
                .downcast_mut::<Chain>()
                .map(|inner| std::mem::take(&mut inner.children));
            match nested {
                Some(grandchildren) => {
                    for c in grandchildren.into_iter().rev() {
                        stack.push(c);
                    }
                }
                None => flat.push(child),
            }
        }
        Self {
            children: flat,
            shape: self.shape,
            cond_shape: self.cond_shape,
        }
    }
}

impl Bijection for Chain {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.cond_shape.as_deref()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, x)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = x.clone();
        for child in &self.children {
            current = child.transform(&current, child_condition(child.as_ref(), condition))?;
        }
        Ok(current)
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, y)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = y.clone();
        for child in self.children.iter().rev() {
            current = child.inverse(&current, child_condition(child.as_ref(), condition))?;
        }
        Ok(current)
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, x)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = x.clone();
        let mut log_det = 0.0;
        for child in &self.children {
            let (next, ld) =
                child.transform_and_log_det(&current, child_condition(child.as_ref(), condition))?;
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
        check_input(&self.shape, y)?;
        check_condition(self.cond_shape(), condition)?;
        let mut current = y.clone();
        let mut log_det = 0.0;
        for child in self.children.iter().rev() {
            let (next, ld) =
                child.inverse_and_log_det(&current, child_condition(child.as_ref(), condition))?;
            current = next;
            log_det += ld;
        }
        Ok((current, log_det))
    }
}

/// Statically typed two-stage composition.
///
/// Unlike [`Chain`] this keeps both stages as concrete types, so a layer
/// built as `Then<Coupling, Permute>` still exposes its parameter leaves
/// and can be stacked for a [`Scan`](crate::bijections::Scan).
#[derive(Clone)]
pub struct Then<A, B> {
    first: A,
    second: B,
    shape: Vec<usize>,
    cond_shape: Option<Vec<usize>>,
}

impl<A, B> Then<A, B>
where
    A: Bijection + 'static,
    B: Bijection + 'static,
{
    pub fn new(first: A, second: B) -> Result<Self> {
        if first.shape() != second.shape() {
            return Err(FlowError::ShapeMismatch {
                expected: first.shape().to_vec(),
                got: second.shape().to_vec(),
            });
        }
        let shape = first.shape().to_vec();
        let cond_shape =
            unify_cond_shapes([first.cond_shape(), second.cond_shape()].into_iter())?;
        Ok(Self {
            first,
            second,
            shape,
            cond_shape,
        })
    }

    pub fn first(&self) -> &A {
        &self.first
    }

    pub fn second(&self) -> &B {
        &self.second
    }
}

impl<A, B> Bijection for Then<A, B>
where
    A: Bijection + 'static,
    B: Bijection + 'static,
{
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn cond_shape(&self) -> Option<&[usize]> {
        self.cond_shape.as_deref()
    }

    fn transform(&self, x: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, x)?;
        check_condition(self.cond_shape(), condition)?;
        let mid = self
            .first
            .transform(x, child_condition(&self.first, condition))?;
        self.second
            .transform(&mid, child_condition(&self.second, condition))
    }

    fn inverse(&self, y: &ArrayD<f64>, condition: Option<&ArrayD<f64>>) -> Result<ArrayD<f64>> {
        check_input(&self.shape, y)?;
        check_condition(self.cond_shape(), condition)?;
        let mid = self
            .second
            .inverse(y, child_condition(&self.second, condition))?;
        self.first
            .inverse(&mid, child_condition(&self.first, condition))
    }

    fn transform_and_log_det(
        &self,
        x: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, x)?;
        check_condition(self.cond_shape(), condition)?;
        let (mid, ld1) = self
            .first
            .transform_and_log_det(x, child_condition(&self.first, condition))?;
        let (out, ld2) = self
            .second
            .transform_and_log_det(&mid, child_condition(&self.second, condition))?;
        Ok((out, ld1 + ld2))
    }

    fn inverse_and_log_det(
        &self,
        y: &ArrayD<f64>,
        condition: Option<&ArrayD<f64>>,
    ) -> Result<(ArrayD<f64>, f64)> {
        check_input(&self.shape, y)?;
        check_condition(self.cond_shape(), condition)?;
        let (mid, ld2) = self
            .second
            .inverse_and_log_det(y, child_condition(&self.second, condition))?;
        let (out, ld1) = self
            .first
            .inverse_and_log_det(&mid, child_condition(&self.first, condition))?;
        Ok((out, ld1 + ld2))
    }
}

impl<A, B> ParamLeaves for Then<A, B>
where
    A: Bijection + ParamLeaves + 'static,
    B: Bijection + ParamLeaves + 'static,
{
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
        self.first
            .for_each_leaf(&mut |name, leaf| f(&format!("first.{name}"), leaf));
        self.second
            .for_each_leaf(&mut |name, leaf| f(&format!("second.{name}"), leaf));
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self {
        Self {
            first: self
                .first
                .map_leaves(&mut |name, leaf| f(&format!("first.{name}"), leaf)),
            second: self
                .second
                .map_leaves(&mut |name, leaf| f(&format!("second.{name}"), leaf)),
            shape: self.shape.clone(),
            cond_shape: self.cond_shape.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijections::Affine;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn affine(loc: f64, scale: f64) -> Affine {
        Affine::new(
            array![loc, loc].into_dyn(),
            array![scale, scale].into_dyn(),
        )
        .unwrap()
    }

    #[test]
    fn test_chain_applies_in_order() {
        // y = 3 * (2x + 1) requires order [scale-shift, scale].
        let chain = Chain::new(vec![
            Box::new(affine(1.0, 2.0)),
            Box::new(affine(0.0, 3.0)),
        ])
        .unwrap();
        let x = array![1.0, -1.0].into_dyn();
        let y = chain.transform(&x, None).unwrap();
        assert_abs_diff_eq!(y[[0]], 9.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[[1]], -3.0, epsilon = 1e-12);
        let back = chain.inverse(&y, None).unwrap();
        assert_abs_diff_eq!(back[[0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[[1]], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_chain_log_det_sums_children() {
        let chain = Chain::new(vec![
            Box::new(affine(0.5, 2.0)),
            Box::new(affine(0.0, 0.25)),
        ])
        .unwrap();
        let x = array![0.3, 0.7].into_dyn();
        let (_, ld) = chain.transform_and_log_det(&x, None).unwrap();
        let expected = 2.0 * 2.0f64.ln() + 2.0 * 0.25f64.ln();
        assert_abs_diff_eq!(ld, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_chain_rejects_mixed_shapes() {
        let err = Chain::new(vec![
            Box::new(affine(0.0, 1.0)),
            Box::new(Affine::identity(&[3])),
        ]);
        assert!(matches!(err, Err(FlowError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_merge_chains_flattens_nesting() {
        let inner = Chain::new(vec![
            Box::new(affine(0.0, 2.0)),
            Box::new(affine(1.0, 1.0)),
        ])
        .unwrap();
        let outer = Chain::new(vec![Box::new(inner), Box::new(affine(0.0, 3.0))]).unwrap();
        let x = array![0.5, -0.5].into_dyn();
        let before = outer.transform(&x, None).unwrap();
        let merged = outer.merge_chains();
        assert_eq!(merged.children().len(), 3);
        let after = merged.transform(&x, None).unwrap();
        assert_abs_diff_eq!(before[[0]], after[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(before[[1]], after[[1]], epsilon = 1e-12);
    }

    #[test]
    fn test_merge_chains_keeps_reboxed_child_whole() {
        let inner = Chain::new(vec![
            Box::new(affine(0.0, 2.0)),
            Box::new(affine(1.0, 1.0)),
        ])
        .unwrap();
        let reboxed: Box<dyn Bijection> = Box::new(Box::new(inner) as Box<dyn Bijection>);
        let outer = Chain::new(vec![reboxed, Box::new(affine(0.0, 3.0))]).unwrap();
        let x = array![0.5, -0.5].into_dyn();
        let before = outer.transform(&x, None).unwrap();
        let merged = outer.merge_chains();
        // The doubly boxed chain is opaque to the downcast.
        assert_eq!(merged.children().len(), 2);
        let after = merged.transform(&x, None).unwrap();
        assert_abs_diff_eq!(before[[0]], after[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(before[[1]], after[[1]], epsilon = 1e-12);
    }

    #[test]
    fn test_then_matches_chain() {
        let then = Then::new(affine(1.0, 2.0), affine(0.0, 3.0)).unwrap();
        let chain = Chain::new(vec![
            Box::new(affine(1.0, 2.0)),
            Box::new(affine(0.0, 3.0)),
        ])
        .unwrap();
        let x = array![0.2, -1.4].into_dyn();
        let (y1, ld1) = then.transform_and_log_det(&x, None).unwrap();
        let (y2, ld2) = chain.transform_and_log_det(&x, None).unwrap();
        assert_abs_diff_eq!(y1[[0]], y2[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(y1[[1]], y2[[1]], epsilon = 1e-12);
        assert_abs_diff_eq!(ld1, ld2, epsilon = 1e-12);
        let (x1, ldi) = then.inverse_and_log_det(&y1, None).unwrap();
        assert_abs_diff_eq!(x1[[0]], x[[0]], epsilon = 1e-12);
        assert_abs_diff_eq!(ldi, -ld1, epsilon = 1e-12);
    }
}
