use std::fmt;
use std::ops::Index;

use crate::error::{Error, Result};

// Shape — N-dimensional shape representation
//
// A Shape describes the size of each dimension of a tensor:
//   - Scalar: Shape([])          — 0 dimensions, 1 element
//   - Vector: Shape([5])         — 1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      — 2 dimensions, 12 elements
//
// Shapes are values. Every manipulation (flatten, squeeze, transpose,
// reshape, ...) returns a new Shape and leaves the receiver untouched.
//
// RESHAPE WITH INFERENCE:
//
//   A reshape target may mark at most one dimension as Shape::INFER (-1).
//   Its size is whatever makes the element count match the original:
//     [2, 3, 4].reshape([-1, 4]) → [6, 4]
//     [2, 3, 4].reshape([5, -1]) → error (24 is not a multiple of 5)

/// N-dimensional shape of a tensor.
///
/// [`Shape::dim`] is the checked accessor: an out-of-range index returns
/// `DimOutOfRange`. Indexing with `shape[i]` is a convenience that panics
/// on an out-of-range index, for callers that have already validated it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Sentinel accepted by [`Shape::reshape`] for the one inferred dimension.
    pub const INFER: isize = -1;

    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element; any zero-sized dimension gives 0.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major (C-order) strides, computed right to left.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1]:
    ///   - Moving 1 step in dim 0 jumps 12 elements (3*4)
    ///   - Moving 1 step in dim 1 jumps 4 elements
    ///   - Moving 1 step in dim 2 jumps 1 element
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.ndim()];
        if self.ndim() > 0 {
            strides[self.ndim() - 1] = 1;
            for i in (0..self.ndim() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.ndim(),
        })
    }

    /// Collapse to a 1-D shape holding every element.
    pub fn flatten(&self) -> Shape {
        Shape(vec![self.size()])
    }

    /// Drop every dimension of size 1.
    pub fn squeeze(&self) -> Shape {
        Shape(self.0.iter().copied().filter(|&d| d != 1).collect())
    }

    /// Insert a dimension of size 1 before position `at`.
    /// `at == ndim()` appends a trailing dimension.
    pub fn unsqueeze(&self, at: usize) -> Result<Shape> {
        if at > self.ndim() {
            return Err(Error::DimOutOfRange {
                dim: at,
                rank: self.ndim(),
            });
        }
        let mut dims = self.0.clone();
        dims.insert(at, 1);
        Ok(Shape(dims))
    }

    /// Swap the last two dimensions. Shapes with fewer than two dimensions
    /// are returned unchanged.
    pub fn transpose(&self) -> Shape {
        let mut dims = self.0.clone();
        let n = dims.len();
        if n >= 2 {
            dims.swap(n - 2, n - 1);
        }
        Shape(dims)
    }

    /// Reorder dimensions: output dim `i` is input dim `axes[i]`.
    /// `axes` must be a permutation of `0..ndim()`.
    pub fn permute(&self, axes: &[usize]) -> Result<Shape> {
        if axes.len() != self.ndim() {
            return Err(Error::RankMismatch {
                expected: self.ndim(),
                got: axes.len(),
            });
        }
        let mut seen = vec![false; self.ndim()];
        let mut dims = Vec::with_capacity(axes.len());
        for &a in axes {
            if a >= self.ndim() {
                return Err(Error::DimOutOfRange {
                    dim: a,
                    rank: self.ndim(),
                });
            }
            if seen[a] {
                return Err(Error::RepeatedAxis {
                    axis: a,
                    axes: axes.to_vec(),
                });
            }
            seen[a] = true;
            dims.push(self.0[a]);
        }
        Ok(Shape(dims))
    }

    /// Reshape to `new_dims`, where at most one entry may be [`Shape::INFER`].
    ///
    /// Fails when more than one dimension is inferred, when an entry is a
    /// negative number other than the sentinel, or when the resulting element
    /// count differs from `self.size()`.
    pub fn reshape(&self, new_dims: &[isize]) -> Result<Shape> {
        let inferred = new_dims.iter().filter(|&&d| d == Self::INFER).count();
        if inferred > 1 {
            return Err(Error::MultipleInferredDims { count: inferred });
        }
        if let Some(&dim) = new_dims.iter().find(|&&d| d < 0 && d != Self::INFER) {
            return Err(Error::InvalidDim { dim });
        }

        let known: usize = new_dims
            .iter()
            .filter(|&&d| d != Self::INFER)
            .map(|&d| d as usize)
            .product();
        let fill = if inferred == 1 && known != 0 {
            self.size() / known
        } else {
            0
        };
        let dims: Vec<usize> = new_dims
            .iter()
            .map(|&d| if d == Self::INFER { fill } else { d as usize })
            .collect();

        let target = Shape(dims);
        if target.size() != self.size() {
            return Err(Error::ReshapeElementMismatch {
                src: self.size(),
                dst: target.size(),
                dst_shape: target,
            });
        }
        Ok(target)
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    /// Panics when `index >= ndim()`; use [`Shape::dim`] for a checked lookup.
    fn index(&self, index: usize) -> &usize {
        &self.0[index]
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

// Convenient From implementations
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
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.size(), 1);
        assert_eq!(s.strides(), Vec::<usize>::new());
    }

    #[test]
    fn test_3d_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.strides(), vec![12, 4, 1]);
        assert_eq!(s.size(), 24);
    }

    #[test]
    fn test_zero_sized_dim() {
        assert_eq!(Shape::from((3, 0)).size(), 0);
    }

    #[test]
    fn test_dim_out_of_range() {
        let s = Shape::from((2, 3));
        assert_eq!(s.dim(1).unwrap(), 3);
        assert_eq!(s[0], 2);
        assert_eq!(s.dim(2).unwrap_err().kind(), ErrorKind::Bounds);
    }

    #[test]
    fn test_dim_lookup() {
        let s = Shape::from((2, 3));
        assert_eq!(s.dim(1).unwrap(), 3);
        assert_eq!(s[0], 2);
        let err = s.dim(2).unwrap_err();
        assert!(matches!(err, Error::DimOutOfRange { dim: 2, rank: 2 }));
        assert_eq!(err.kind(), ErrorKind::Bounds);
    }

    #[test]
    #[should_panic]
    fn test_index_out_of_range_panics() {
        let s = Shape::from((2, 3));
        let _ = s[2];
    }

    #[test]
    fn test_flatten_squeeze_unsqueeze() {
        let s = Shape::from(vec![1, 3, 1, 4]);
        assert_eq!(s.flatten().dims(), &[12]);
        assert_eq!(s.squeeze().dims(), &[3, 4]);
        assert_eq!(s.squeeze().unsqueeze(0).unwrap().dims(), &[1, 3, 4]);
        assert_eq!(s.squeeze().unsqueeze(2).unwrap().dims(), &[3, 4, 1]);
        assert!(s.unsqueeze(5).is_err());
    }

    #[test]
    fn test_transpose_and_permute() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.transpose().dims(), &[2, 4, 3]);
        assert_eq!(s.permute(&[2, 0, 1]).unwrap().dims(), &[4, 2, 3]);
        let err = s.permute(&[0, 0, 1]).unwrap_err();
        assert!(matches!(err, Error::RepeatedAxis { axis: 0, .. }));
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert!(s.permute(&[0, 1]).is_err());
        // rank < 2 is left alone
        assert_eq!(Shape::from(5).transpose().dims(), &[5]);
    }

    #[test]
    fn test_reshape_infer() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.reshape(&[-1, 4]).unwrap().dims(), &[6, 4]);
        assert_eq!(s.reshape(&[2, -1]).unwrap().dims(), &[2, 12]);
        assert_eq!(s.reshape(&[24]).unwrap().dims(), &[24]);
    }

    #[test]
    fn test_reshape_errors() {
        let s = Shape::from((2, 3, 4));
        let err = s.reshape(&[5, -1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        let err = s.reshape(&[-1, -1]).unwrap_err();
        assert!(matches!(err, Error::MultipleInferredDims { count: 2 }));
        assert!(s.reshape(&[7, 3]).is_err());
        let err = s.reshape(&[-2, 12]).unwrap_err();
        assert!(matches!(err, Error::InvalidDim { dim: -2 }));
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }

    proptest! {
        #[test]
        fn prop_reshape_preserves_size(a in 1usize..8, b in 1usize..8, c in 1usize..8) {
            let s = Shape::from((a, b, c));
            let r = s.reshape(&[-1, c as isize]).unwrap();
            prop_assert_eq!(r.size(), s.size());
            let r = s.reshape(&[(a * b) as isize, c as isize]).unwrap();
            prop_assert_eq!(r.size(), s.size());
        }

        #[test]
        fn prop_double_transpose_is_identity(a in 0usize..16, b in 0usize..16) {
            let s = Shape::from((a, b));
            prop_assert_eq!(s.transpose().transpose(), s);
        }

        #[test]
        fn prop_squeeze_unsqueeze_preserve_size(dims in prop::collection::vec(1usize..5, 0..5)) {
            let s = Shape::new(dims);
            prop_assert_eq!(s.squeeze().size(), s.size());
            prop_assert_eq!(s.unsqueeze(0).unwrap().size(), s.size());
            prop_assert_eq!(s.transpose().size(), s.size());
        }
    }
}
