use std::fmt;

use crate::error::{Error, Result};

// Shape: N-dimensional shape and the broadcasting rules
//
// A Shape describes the size of each dimension of a tensor:
//   - Scalar: Shape([])            0 dimensions, 1 element
//   - Vector: Shape([5])           1 dimension, 5 elements
//   - Batch:  Shape([2, 3, 4])     3 dimensions, 24 elements
//
// BROADCASTING
//
// Every binary kernel sizes its output with `broadcast_shape`. Shapes are
// aligned on their trailing dimensions; the shorter one is treated as if it
// had leading 1s. Each aligned pair must be equal or contain a 1.
//
// The backward pass needs the inverse: a gradient arrives with the broadcast
// output shape and must be summed back down to the input's shape. The axes
// to sum are given by `reduction_axes`; `broadcast_dims` is the forward view
// of the same information, expressed in the input's own axes.
//
//   in = [4, 1, 3], out = [5, 4, 3, 3]
//   broadcast_dims(in, out) = [1]        (axis 1 of `in` is replicated)
//   reduction_axes(in, out) = [0, 2]     (axis 0 is missing, axis 2 was 1)

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the rank-0 shape.
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element; any zero-sized dimension gives 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Compute the contiguous (row-major) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::AxisOutOfRange {
            axis: d,
            rank: self.rank(),
        })
    }

    // Broadcasting

    /// Compute the broadcast output shape of two input shapes.
    ///
    /// Examples:
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [4, 1, 3] and [5, 4, 3, 3] → [5, 4, 3, 3]
    ///   [3] and [4]          → ShapeMismatch
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            // Index from the right; a missing dimension counts as 1.
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::ShapeMismatch {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Axes of `in_shape` (indexed into its own rank) that are replicated to
    /// reach `out_shape`: the input has size 1 there while the right-aligned
    /// output dimension is larger. Sorted ascending.
    pub fn broadcast_dims(in_shape: &Shape, out_shape: &Shape) -> Vec<usize> {
        let in_dims = in_shape.dims();
        let out_dims = out_shape.dims();
        let mut dims = Vec::new();
        for i in 0..in_dims.len() {
            let dim = in_dims.len() - 1 - i;
            let a = in_dims[dim];
            let b = if i < out_dims.len() {
                out_dims[out_dims.len() - 1 - i]
            } else {
                1
            };
            if b > 1 && a == 1 {
                dims.push(dim);
            }
        }
        dims.reverse();
        dims
    }

    /// Axes of `out_shape` that must be summed to bring a tensor of
    /// `out_shape` back to `in_shape`. An axis is reduced when the input has
    /// no dimension there, or has size 1 while the output is larger.
    /// Sorted ascending.
    pub fn reduction_axes(in_shape: &Shape, out_shape: &Shape) -> Vec<usize> {
        let in_dims = in_shape.dims();
        let out_dims = out_shape.dims();
        let mut axes = Vec::new();
        for i in 0..out_dims.len() {
            let out_axis = out_dims.len() - 1 - i;
            let out_dim = out_dims[out_axis];
            let reduce = if i < in_dims.len() {
                in_dims[in_dims.len() - 1 - i] == 1 && out_dim > 1
            } else {
                true
            };
            if reduce {
                axes.push(out_axis);
            }
        }
        axes.reverse();
        axes
    }

    // Axis helpers

    /// Validate a list of reduction axes against this shape and return them
    /// sorted. An empty list means "all axes".
    pub fn normalize_axes(&self, axes: &[usize]) -> Result<Vec<usize>> {
        if axes.is_empty() {
            return Ok((0..self.rank()).collect());
        }
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        for (i, &axis) in sorted.iter().enumerate() {
            if axis >= self.rank() || (i > 0 && sorted[i - 1] == axis) {
                return Err(Error::AxisOutOfRange {
                    axis,
                    rank: self.rank(),
                });
            }
        }
        Ok(sorted)
    }

    /// The shape left after reducing `axes` (already normalized). With
    /// `keep_dims` the reduced axes stay as size 1.
    pub fn reduce_shape(&self, axes: &[usize], keep_dims: bool) -> Shape {
        let dims = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
                (false, _) => Some(d),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(d: &[usize]) -> Shape {
        Shape::from(d)
    }

    #[test]
    fn test_scalar_shape() {
        let sc = Shape::from(());
        assert_eq!(sc.rank(), 0);
        assert_eq!(sc.elem_count(), 1);
        assert!(sc.stride_contiguous().is_empty());
    }

    #[test]
    fn test_3d_strides() {
        let sh = Shape::from((2, 3, 4));
        assert_eq!(sh.stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(sh.elem_count(), 24);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }

    #[test]
    fn test_broadcast_mixed_rank() {
        let out = Shape::broadcast_shape(&s(&[4, 1, 3]), &s(&[5, 4, 3, 3])).unwrap();
        assert_eq!(out.dims(), &[5, 4, 3, 3]);
        assert_eq!(Shape::broadcast_dims(&s(&[4, 1, 3]), &out), vec![1]);
    }

    #[test]
    fn test_broadcast_scalar_against_anything() {
        let out = Shape::broadcast_shape(&Shape::scalar(), &s(&[2, 7])).unwrap();
        assert_eq!(out.dims(), &[2, 7]);
        assert_eq!(Shape::reduction_axes(&Shape::scalar(), &out), vec![0, 1]);
        assert!(Shape::broadcast_dims(&Shape::scalar(), &out).is_empty());
    }

    #[test]
    fn test_broadcast_mismatch_names_both_shapes() {
        let err = Shape::broadcast_shape(&s(&[2, 3]), &s(&[4, 5])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[2, 3]") && msg.contains("[4, 5]"), "{msg}");
    }

    #[test]
    fn test_ones_need_no_reduction() {
        let out = Shape::broadcast_shape(&s(&[1, 1]), &s(&[1])).unwrap();
        assert_eq!(out.dims(), &[1, 1]);
        assert!(Shape::reduction_axes(&s(&[1]), &out) == vec![0]);
        assert!(Shape::reduction_axes(&s(&[1, 1]), &out).is_empty());
    }

    #[test]
    fn test_broadcast_is_commutative() {
        let shapes = [
            s(&[]),
            s(&[1]),
            s(&[3]),
            s(&[2, 1]),
            s(&[1, 3]),
            s(&[4, 1, 3]),
            s(&[5, 4, 3, 3]),
            s(&[5, 1, 1, 1]),
        ];
        for a in &shapes {
            for b in &shapes {
                match (Shape::broadcast_shape(a, b), Shape::broadcast_shape(b, a)) {
                    (Ok(ab), Ok(ba)) => assert_eq!(ab, ba, "{a} vs {b}"),
                    (Err(_), Err(_)) => {}
                    _ => panic!("broadcast of {a} and {b} is not symmetric"),
                }
            }
        }
    }

    #[test]
    fn test_reduction_axes_recover_input_shape() {
        let cases = [
            (s(&[4, 1, 3]), s(&[5, 4, 3, 3])),
            (s(&[3]), s(&[2, 3])),
            (s(&[2, 1]), s(&[2, 6])),
            (s(&[]), s(&[2, 2])),
            (s(&[1, 1]), s(&[1, 1])),
        ];
        for (input, out) in cases {
            let axes = Shape::reduction_axes(&input, &out);
            let reduced = out.reduce_shape(&axes, false);
            assert_eq!(reduced.elem_count(), input.elem_count(), "{input} from {out}");
            // Reshape is legal only when non-reduced dims line up with the input's non-1 dims.
            let kept: Vec<usize> = reduced.dims().to_vec();
            let input_non_one: Vec<usize> = input.dims().iter().copied().filter(|&d| d != 1).collect();
            let kept_non_one: Vec<usize> = kept.into_iter().filter(|&d| d != 1).collect();
            assert_eq!(kept_non_one, input_non_one);
        }
    }

    #[test]
    fn test_normalize_axes() {
        let sh = s(&[2, 3, 4]);
        assert_eq!(sh.normalize_axes(&[]).unwrap(), vec![0, 1, 2]);
        assert_eq!(sh.normalize_axes(&[2, 0]).unwrap(), vec![0, 2]);
        assert!(sh.normalize_axes(&[3]).is_err());
        assert!(sh.normalize_axes(&[1, 1]).is_err());
    }

    #[test]
    fn test_reduce_shape() {
        let sh = s(&[2, 3, 4]);
        assert_eq!(sh.reduce_shape(&[1], false).dims(), &[2, 4]);
        assert_eq!(sh.reduce_shape(&[1], true).dims(), &[2, 1, 4]);
        assert!(sh.reduce_shape(&[0, 1, 2], false).is_scalar());
    }
}
