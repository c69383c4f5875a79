use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — Memory layout of a tensor (shape + strides + offset)
//
// The Layout decouples the *logical* shape of a tensor from where its
// elements sit in the flat storage buffer. Views (`view`, `slice`) are
// tensors that share a storage buffer with another tensor but carry a
// different Layout.
//
// KEY CONCEPTS:
//
// 1. **Strides**: How many elements to skip in the flat storage to move one
//    step along each dimension. A contiguous [2,3] matrix has strides [3,1].
//
// 2. **Slice**: Adjust the offset and shape, keep the strides.
//    slice(dim=1, 1..3) on [2,3] → shape [2,2], offset 1, strides [3,1].
//
// 3. **Contiguous check**: Kernels operate on dense row-major buffers. A
//    layout whose strides equal the row-major strides of its shape is a
//    dense window `storage[offset..offset + size]` and can be handed to a
//    kernel without a copy. Anything else is gathered first.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Offset into the storage buffer where this tensor's data starts.
    offset: usize,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.strides();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Strides are row-major for the shape and the data starts at offset 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.is_dense()
    }

    /// Strides are row-major for the shape; the offset may be non-zero.
    fn is_dense(&self) -> bool {
        // Size-1 dimensions never move the cursor, so their stride is free.
        let expected = self.shape.strides();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// The storage range covered by this layout, when it is one dense run.
    pub fn dense_range(&self) -> Option<std::ops::Range<usize>> {
        if self.is_dense() {
            Some(self.offset..self.offset + self.size())
        } else {
            None
        }
    }

    /// Restrict dimension `dim` to the half-open range `start..end`.
    ///
    /// Example: layout of shape [4, 6], slice(dim=1, 2..5)
    /// → shape [4, 3], offset += 2 * stride[1]
    pub fn slice(&self, dim: usize, start: usize, end: usize) -> Result<Layout> {
        let rank = self.shape.ndim();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.dims()[dim];
        if end <= start || end > dim_size {
            return Err(Error::SliceOutOfBounds {
                dim,
                start,
                end,
                dim_size,
            });
        }
        let mut new_dims = self.dims().to_vec();
        new_dims[dim] = end - start;
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// Flat storage index for a multi-dimensional index:
    /// offset + sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(self.strides.iter())
                .map(|(&i, &s)| i * s)
                .sum::<usize>()
    }

    /// Iterator over all flat storage indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter — Iterates over flat storage indices respecting strides
//
// For a dense layout this counts offset, offset+1, ... For a slice along an
// inner dimension it skips the elements that fall outside the window.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.dims().len()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.size(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        self.offset
            + self
                .current
                .iter()
                .zip(self.strides.iter())
                .map(|(&i, &s)| i * s)
                .sum::<usize>()
    }

    /// Advance the multi-dimensional index by one (rightmost dimension first).
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
