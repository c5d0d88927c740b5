//! Tagged split between a bijection's array-valued parameter leaves and its
//! structural fields.
//!
//! Composite bijections (`Scan`, `Vmap`) need to know what varies per layer
//! or per batch element and what is shared. Rather than generic tree
//! recursion over arbitrary nested structures, each parameterized bijection
//! implements [`ParamLeaves`]: a deterministic visit/rebuild pair over its
//! named `f64` array leaves. Structural fields (dimensions, flags, masks'
//! shapes) are carried over unchanged by `map_leaves`.

use ndarray::{ArrayD, ArrayViewD, Axis};

use crate::errors::{FlowError, Result};

/// Deterministic decomposition of a value into named array leaves.
///
/// `for_each_leaf` and `map_leaves` must visit the same leaves in the same
/// order, with stable names unique within the value.
pub trait ParamLeaves: Sized {
    /// Visit each array leaf together with its field path.
    fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>));

    /// Rebuild the value with every array leaf replaced by `f`'s output;
    /// structural fields are reused as-is.
    fn map_leaves(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>) -> Self;
}

/// Number of array leaves.
pub fn leaf_count<B: ParamLeaves>(b: &B) -> usize {
    let mut n = 0;
    b.for_each_leaf(&mut |_, _| n += 1);
    n
}

/// The common leading-axis length of every array leaf.
///
/// This is the layer count a `Scan` iterates over. Fails if there are no
/// leaves, a leaf is rank-0, or the leading lengths disagree.
pub fn leading_len<B: ParamLeaves>(b: &B) -> Result<usize> {
    let mut len: Option<usize> = None;
    let mut err: Option<FlowError> = None;
    b.for_each_leaf(&mut |name, leaf| {
        if err.is_some() {
            return;
        }
        if leaf.ndim() == 0 {
            err = Some(FlowError::Config(format!(
                "leaf `{name}` is rank-0 and has no leading layer axis"
            )));
            return;
        }
        let l = leaf.shape()[0];
        match len {
            None => len = Some(l),
            Some(prev) if prev != l => {
                err = Some(FlowError::Config(format!(
                    "leaf `{name}` has leading length {l}, expected {prev}"
                )));
            }
            Some(_) => {}
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    len.ok_or_else(|| FlowError::Config("bijection has no array leaves to scan over".into()))
}

/// Slice out layer `i` by indexing the leading axis of every leaf.
pub fn select_layer<B: ParamLeaves>(b: &B, i: usize) -> B {
    b.map_leaves(&mut |_, leaf| leaf.index_axis(Axis(0), i).to_owned())
}

/// Slice out batch element `i`, taking `axes(name, leaf)` as the mapped axis
/// per leaf (`None` leaves are shared/broadcast).
pub fn select_batch<B: ParamLeaves>(
    b: &B,
    axes: &dyn Fn(&str, &ArrayViewD<'_, f64>) -> Option<usize>,
    i: usize,
) -> B {
    b.map_leaves(&mut |name, leaf| match axes(name, &leaf) {
        Some(ax) => leaf.index_axis(Axis(ax), i).to_owned(),
        None => leaf.to_owned(),
    })
}

/// Stack structurally identical values along a new leading axis, leaf by
/// leaf. The result is only meaningful as input to `Scan`.
///
/// This is the explicit counterpart of building the stacked parameter set
/// with a vectorized constructor.
pub fn stack<B: ParamLeaves>(items: &[B]) -> Result<B> {
    let first = items
        .first()
        .ok_or_else(|| FlowError::Config("cannot stack an empty list of bijections".into()))?;
    if items.len() == 1 {
        // Still gain the leading axis of length 1.
        return Ok(first.map_leaves(&mut |_, leaf| leaf.to_owned().insert_axis(Axis(0))));
    }
    let mut failure: Option<FlowError> = None;
    let stacked = first.map_leaves(&mut |name, leaf| {
        let mut gathered: Vec<ArrayD<f64>> = Vec::with_capacity(items.len());
        for item in items {
            match leaf_by_name(item, name) {
                Some(a) => gathered.push(a),
                None => {
                    failure = Some(FlowError::Config(format!(
                        "leaf `{name}` missing from a stacked bijection"
                    )));
                    return leaf.to_owned();
                }
            }
        }
        let views: Vec<ArrayViewD<'_, f64>> = gathered.iter().map(|a| a.view()).collect();
        match ndarray::stack(Axis(0), &views) {
            Ok(a) => a,
            Err(e) => {
                failure = Some(FlowError::Config(format!(
                    "cannot stack leaf `{name}`: {e}"
                )));
                leaf.to_owned()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(stacked),
    }
}

fn leaf_by_name<B: ParamLeaves>(b: &B, name: &str) -> Option<ArrayD<f64>> {
    let mut out = None;
    b.for_each_leaf(&mut |n, leaf| {
        if n == name {
            out = Some(leaf.to_owned());
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    struct Toy {
        a: ArrayD<f64>,
        b: ArrayD<f64>,
        tag: usize,
    }

    impl ParamLeaves for Toy {
        fn for_each_leaf(&self, f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>)) {
            f("a", self.a.view());
            f("b", self.b.view());
        }

        fn map_leaves(
            &self,
            f: &mut dyn FnMut(&str, ArrayViewD<'_, f64>) -> ArrayD<f64>,
        ) -> Self {
            Toy {
                a: f("a", self.a.view()),
                b: f("b", self.b.view()),
                tag: self.tag,
            }
        }
    }

    fn toy(offset: f64) -> Toy {
        Toy {
            a: ArrayD::from_shape_fn(IxDyn(&[3]), |ix| offset + ix[0] as f64),
            b: ArrayD::from_elem(IxDyn(&[2, 2]), offset),
            tag: 7,
        }
    }

    #[test]
    fn test_stack_then_select_layer_round_trips() {
        let stacked = stack(&[toy(0.0), toy(10.0)]).unwrap();
        assert_eq!(leading_len(&stacked).unwrap(), 2);
        let second = select_layer(&stacked, 1);
        assert_eq!(second.a.shape(), &[3]);
        assert_eq!(second.a[[1]], 11.0);
        assert_eq!(second.b[[0, 1]], 10.0);
        assert_eq!(second.tag, 7);
    }

    #[test]
    fn test_stack_single_item_gains_axis() {
        let stacked = stack(&[toy(1.0)]).unwrap();
        assert_eq!(leading_len(&stacked).unwrap(), 1);
        assert_eq!(stacked.a.shape(), &[1, 3]);
    }

    #[test]
    fn test_stack_empty_fails() {
        assert!(stack::<Toy>(&[]).is_err());
    }

    #[test]
    fn test_leading_len_mismatch_fails() {
        let bad = Toy {
            a: ArrayD::zeros(IxDyn(&[3, 2])),
            b: ArrayD::zeros(IxDyn(&[4, 2])),
            tag: 0,
        };
        assert!(leading_len(&bad).is_err());
    }

    #[test]
    fn test_select_batch_broadcast_vs_mapped() {
        let t = Toy {
            a: ArrayD::from_shape_fn(IxDyn(&[4, 3]), |ix| (ix[0] * 10 + ix[1]) as f64),
            b: ArrayD::from_elem(IxDyn(&[2, 2]), 5.0),
            tag: 1,
        };
        let picked = select_batch(
            &t,
            &|name, _| if name == "a" { Some(0) } else { None },
            2,
        );
        assert_eq!(picked.a.shape(), &[3]);
        assert_eq!(picked.a[[1]], 21.0);
        assert_eq!(picked.b.shape(), &[2, 2]);
    }
}
