// Index arithmetic for the CPU kernels
//
// All buffers are contiguous and row-major. Element-wise math runs on f64
// and is converted back to the output dtype, so one implementation serves
// every dtype.

use tidal_core::kernel::{BinaryOp, UnaryOp};
use tidal_core::shape::Shape;

/// For each element of `out_shape`, the flat index of the element of
/// `in_shape` it reads from under broadcasting.
pub(crate) fn broadcast_source_index(in_shape: &Shape, out_shape: &Shape) -> Vec<usize> {
    let out_dims = out_shape.dims();
    let in_dims = in_shape.dims();
    let in_strides = in_shape.stride_contiguous();
    let offset = out_dims.len() - in_dims.len();

    // Stride 0 on broadcast axes.
    let strides: Vec<usize> = (0..out_dims.len())
        .map(|axis| {
            if axis < offset || in_dims[axis - offset] == 1 {
                0
            } else {
                in_strides[axis - offset]
            }
        })
        .collect();

    let n = out_shape.elem_count();
    let mut index = Vec::with_capacity(n);
    let mut coords = vec![0usize; out_dims.len()];
    for _ in 0..n {
        index.push(coords.iter().zip(&strides).map(|(c, s)| c * s).sum::<usize>());
        for axis in (0..coords.len()).rev() {
            coords[axis] += 1;
            if coords[axis] < out_dims[axis] {
                break;
            }
            coords[axis] = 0;
        }
    }
    index
}

pub(crate) fn binary(
    op: BinaryOp,
    a: &[f64],
    a_shape: &Shape,
    b: &[f64],
    b_shape: &Shape,
    out_shape: &Shape,
) -> Vec<f64> {
    if a_shape == b_shape {
        return a.iter().zip(b).map(|(&x, &y)| op.apply(x, y)).collect();
    }
    let ai = broadcast_source_index(a_shape, out_shape);
    let bi = broadcast_source_index(b_shape, out_shape);
    ai.iter()
        .zip(&bi)
        .map(|(&i, &j)| op.apply(a[i], b[j]))
        .collect()
}

pub(crate) fn unary(op: UnaryOp, x: &[f64]) -> Vec<f64> {
    x.iter().map(|&v| op.apply(v)).collect()
}

pub(crate) fn broadcast_to(x: &[f64], in_shape: &Shape, out_shape: &Shape) -> Vec<f64> {
    broadcast_source_index(in_shape, out_shape)
        .into_iter()
        .map(|i| x[i])
        .collect()
}

/// Sum (or mean) over `axes`, which must be normalized. The result is laid
/// out row-major over the non-reduced axes; it is the same with or without
/// kept dims.
pub(crate) fn reduce(x: &[f64], in_shape: &Shape, axes: &[usize], mean: bool) -> Vec<f64> {
    let kept = in_shape.reduce_shape(axes, true);
    let out_strides = kept.stride_contiguous();
    let dims = in_shape.dims();
    let mut out = vec![0.0; kept.elem_count()];

    let mut coords = vec![0usize; dims.len()];
    for &v in x {
        let o: usize = coords
            .iter()
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(axis, c)| c * out_strides[axis])
            .sum();
        out[o] += v;
        for axis in (0..coords.len()).rev() {
            coords[axis] += 1;
            if coords[axis] < dims[axis] {
                break;
            }
            coords[axis] = 0;
        }
    }

    if mean {
        let count: usize = axes.iter().map(|&a| dims[a]).product();
        if count > 0 {
            for v in &mut out {
                *v /= count as f64;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_row_and_column() {
        let idx = broadcast_source_index(&Shape::from(3), &Shape::from((2, 3)));
        assert_eq!(idx, vec![0, 1, 2, 0, 1, 2]);
        let idx = broadcast_source_index(&Shape::from((2, 1)), &Shape::from((2, 3)));
        assert_eq!(idx, vec![0, 0, 0, 1, 1, 1]);
        let idx = broadcast_source_index(&Shape::scalar(), &Shape::from(4));
        assert_eq!(idx, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_reduce_axes() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let s = Shape::from((2, 3));
        assert_eq!(reduce(&x, &s, &[0], false), vec![5.0, 7.0, 9.0]);
        assert_eq!(reduce(&x, &s, &[1], false), vec![6.0, 15.0]);
        assert_eq!(reduce(&x, &s, &[0, 1], true), vec![3.5]);
    }

    #[test]
    fn test_binary_broadcast() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [10.0, 20.0];
        let out = binary(
            BinaryOp::Add,
            &a,
            &Shape::from((2, 2)),
            &b,
            &Shape::from(2),
            &Shape::from((2, 2)),
        );
        assert_eq!(out, vec![11.0, 22.0, 13.0, 24.0]);
    }
}
