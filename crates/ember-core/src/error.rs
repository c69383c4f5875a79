use crate::shape::Shape;

/// All errors that can occur within ember.
///
/// Every failure mode of the shape algebra, the kernel layer, the device
/// context and the autograd engine is a variant here, so a single `?`
/// propagates any of them. [`Error::kind`] groups the variants into the
/// four broad categories callers usually branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., adding [2,3] to [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A reshape target marked more than one dimension as inferred.
    #[error("cannot reshape: only one dimension may be inferred, got {count}")]
    MultipleInferredDims { count: usize },

    /// A reshape target contains a negative size other than the inferred sentinel.
    #[error("cannot reshape: invalid dimension {dim}")]
    InvalidDim { dim: isize },

    /// A permutation names the same axis twice.
    #[error("permute: axis {axis} repeated in {axes:?}")]
    RepeatedAxis { axis: usize, axes: Vec<usize> },

    /// A view was requested over a layout that is not one dense run.
    #[error("{op} requires a contiguous tensor; call reshape() to copy")]
    NotContiguous { op: &'static str },

    /// Model width is not evenly divisible into attention heads.
    #[error("d_model ({d_model}) must be divisible by num_heads ({num_heads})")]
    HeadsMismatch { d_model: usize, num_heads: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Slice range is empty or runs past the end of the dimension.
    #[error("slice out of bounds: dim {dim}, range {start}..{end}, dim_size {dim_size}")]
    SliceOutOfBounds {
        dim: usize,
        start: usize,
        end: usize,
        dim_size: usize,
    },

    /// backward() was called on a tensor that does not track gradients.
    #[error("tensor does not require grad; call requires_grad_(true) before building the graph")]
    GradNotTracked,

    /// Tried to use a non-scalar tensor where a scalar is required.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating a tensor from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Caller-supplied scratch workspace is smaller than the kernel needs.
    #[error("workspace too small: {op} needs {required} floats, got {got}")]
    WorkspaceTooSmall {
        op: &'static str,
        required: usize,
        got: usize,
    },

    /// A kernel operand buffer is shorter than its stated dimensions.
    #[error("buffer `{name}` too small: need {required} floats, got {got}")]
    BufferTooSmall {
        name: &'static str,
        required: usize,
        got: usize,
    },

    /// The device memory pool cannot satisfy an allocation.
    #[error("out of device memory on {device}: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory {
        device: String,
        requested: usize,
        available: usize,
    },

    /// Operands live in different memory spaces.
    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: String, rhs: String },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// Broad error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operand shapes are incompatible for the requested operation.
    ShapeMismatch,
    /// A dimension index or slice range lies outside the valid range.
    Bounds,
    /// The computation graph is not in a state that allows the call.
    GraphState,
    /// Device allocation, transfer or workspace sizing failed.
    Resource,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ShapeMismatch { .. }
            | Error::RankMismatch { .. }
            | Error::MatmulShapeMismatch { .. }
            | Error::ReshapeElementMismatch { .. }
            | Error::MultipleInferredDims { .. }
            | Error::InvalidDim { .. }
            | Error::RepeatedAxis { .. }
            | Error::HeadsMismatch { .. }
            | Error::NotContiguous { .. }
            | Error::ElementCountMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::DimOutOfRange { .. } | Error::SliceOutOfBounds { .. } => ErrorKind::Bounds,
            Error::GradNotTracked | Error::NotAScalar { .. } => ErrorKind::GraphState,
            Error::WorkspaceTooSmall { .. }
            | Error::BufferTooSmall { .. }
            | Error::OutOfDeviceMemory { .. }
            | Error::DeviceMismatch { .. }
            | Error::Msg(_) => ErrorKind::Resource,
        }
    }
}

/// Convenience Result type used throughout ember.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let e = Error::MatmulShapeMismatch {
            m: 2,
            k1: 3,
            k2: 4,
            n: 5,
        };
        assert_eq!(e.kind(), ErrorKind::ShapeMismatch);
        let e = Error::SliceOutOfBounds {
            dim: 0,
            start: 2,
            end: 2,
            dim_size: 4,
        };
        assert_eq!(e.kind(), ErrorKind::Bounds);
        assert_eq!(Error::GradNotTracked.kind(), ErrorKind::GraphState);
        let e = Error::WorkspaceTooSmall {
            op: "attention",
            required: 16,
            got: 4,
        };
        assert_eq!(e.kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_display() {
        let e = Error::HeadsMismatch {
            d_model: 10,
            num_heads: 3,
        };
        assert_eq!(
            e.to_string(),
            "d_model (10) must be divisible by num_heads (3)"
        );
    }
}
