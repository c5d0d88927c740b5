//! Shape bookkeeping shared by bijections and distributions: trailing-shape
//! validation, numpy-style broadcasting of leading (batch) dimensions, and
//! iteration over multi-indices of a dynamic shape.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis};

use crate::errors::{FlowError, Result};

/// Split `full` into leading dims and the declared `trailing` shape,
/// returning the leading part. Fails if `full` does not end with `trailing`.
pub fn leading_dims<'a>(full: &'a [usize], trailing: &[usize]) -> Result<&'a [usize]> {
    if full.len() < trailing.len() || &full[full.len() - trailing.len()..] != trailing {
        return Err(FlowError::ShapeMismatch {
            expected: trailing.to_vec(),
            got: full.to_vec(),
        });
    }
    Ok(&full[..full.len() - trailing.len()])
}

/// Numpy-style broadcast of two shapes (right-aligned, size-1 dims stretch).
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let n = a.len().max(b.len());
    let mut out = vec![0usize; n];
    for i in 0..n {
        let da = if i < n - a.len() { 1 } else { a[i - (n - a.len())] };
        let db = if i < n - b.len() { 1 } else { b[i - (n - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(FlowError::ShapeMismatch {
                    expected: a.to_vec(),
                    got: b.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

/// Map a multi-index in broadcast space back to an index into an array whose
/// leading dims are `target` (right-aligned; size-1 dims pin to 0).
pub fn broadcast_index(idx: &[usize], target: &[usize]) -> Vec<usize> {
    let offset = idx.len() - target.len();
    target
        .iter()
        .enumerate()
        .map(|(i, &d)| if d == 1 { 0 } else { idx[offset + i] })
        .collect()
}

/// Visit every multi-index of `shape` in row-major order. The empty shape
/// yields a single empty index.
pub fn for_each_index(shape: &[usize], mut f: impl FnMut(&[usize]) -> Result<()>) -> Result<()> {
    let total: usize = shape.iter().product();
    if shape.iter().any(|&d| d == 0) {
        return Ok(());
    }
    let mut idx = vec![0usize; shape.len()];
    for _ in 0..total {
        f(&idx)?;
        for axis in (0..shape.len()).rev() {
            idx[axis] += 1;
            if idx[axis] < shape[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
    Ok(())
}

/// View of `a` with the leading axes fixed at `idx`.
pub fn index_leading<'a>(a: &'a ArrayD<f64>, idx: &[usize]) -> ArrayViewD<'a, f64> {
    let mut view = a.view();
    for &i in idx {
        view = view.index_axis_move(Axis(0), i);
    }
    view
}

/// Mutable view of `a` with the leading axes fixed at `idx`.
pub fn index_leading_mut<'a>(
    a: &'a mut ArrayD<f64>,
    idx: &[usize],
) -> ArrayViewMutD<'a, f64> {
    let mut view = a.view_mut();
    for &i in idx {
        view = view.index_axis_move(Axis(0), i);
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_leading_dims_splits() {
        assert_eq!(leading_dims(&[5, 3, 2], &[2]).unwrap(), &[5, 3]);
        assert_eq!(leading_dims(&[2], &[2]).unwrap(), &[] as &[usize]);
        assert!(leading_dims(&[3, 2], &[4]).is_err());
        assert!(leading_dims(&[2], &[3, 2]).is_err());
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[5, 3], &[3]).unwrap(), vec![5, 3]);
        assert_eq!(broadcast_shapes(&[1, 3], &[5, 1]).unwrap(), vec![5, 3]);
        assert_eq!(broadcast_shapes(&[], &[2, 2]).unwrap(), vec![2, 2]);
        assert!(broadcast_shapes(&[4], &[3]).is_err());
    }

    #[test]
    fn test_broadcast_index_pins_size_one() {
        assert_eq!(broadcast_index(&[4, 2], &[1]), vec![0]);
        assert_eq!(broadcast_index(&[4, 2], &[3]), vec![2]);
        assert_eq!(broadcast_index(&[4, 2], &[]), Vec::<usize>::new());
    }

    #[test]
    fn test_for_each_index_row_major() {
        let mut seen = Vec::new();
        for_each_index(&[2, 3], |idx| {
            seen.push(idx.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![0, 0]);
        assert_eq!(seen[1], vec![0, 1]);
        assert_eq!(seen[5], vec![1, 2]);
    }

    #[test]
    fn test_for_each_index_empty_shape() {
        let mut count = 0;
        for_each_index(&[], |idx| {
            assert!(idx.is_empty());
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_index_leading_view() {
        let a = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |ix| {
            (ix[0] * 100 + ix[1] * 10 + ix[2]) as f64
        });
        let v = index_leading(&a, &[1, 2]);
        assert_eq!(v.shape(), &[4]);
        assert_eq!(v[[3]], 123.0);
    }
}
