// Op — Computational graph node for automatic differentiation
//
// Every tensor produced by an operation records HOW it was created via the
// Op enum. The recorded ops form a directed acyclic graph that backward()
// walks in reverse topological order.
//
// Example: c = a.matmul(&b)
//   a.op = Op::None (leaf)
//   b.op = Op::None (leaf)
//   c.op = Op::Matmul { lhs: a, rhs: b }
//
// Each variant holds the input tensors themselves. A Tensor is an Arc
// handle, so this is a refcount bump, and the graph keeps its inputs alive
// for exactly as long as some output that may be differentiated exists.
// Edges only point from outputs to inputs, so no cycle can form.
//
// An op is recorded only when at least one input requires grad. Results of
// untracked inputs carry Op::None and hold no references.

use crate::tensor::Tensor;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (uses a global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Records the operation that produced a tensor, with its inputs.
pub enum Op {
    /// Leaf tensor: created directly, or produced without gradient tracking.
    None,

    /// result = lhs[M×K] · rhs[K×N]
    Matmul { lhs: Tensor, rhs: Tensor },

    /// result = lhs + rhs, same shape
    Add { lhs: Tensor, rhs: Tensor },

    /// result = lhs ⊙ rhs, same shape
    Mul { lhs: Tensor, rhs: Tensor },

    /// result = max(0, input)
    Relu { input: Tensor },

    /// result = input * factor
    Scale { input: Tensor, factor: f32 },

    /// result = inputᵀ for a 2-D input
    Transpose { input: Tensor },

    /// Row-wise softmax over the last dimension. `output` is a saved copy of
    /// the forward result, which the gradient is expressed in.
    Softmax { input: Tensor, output: Vec<f32> },

    /// Layer normalization over the last dimension.
    LayerNorm {
        input: Tensor,
        gamma: Tensor,
        beta: Tensor,
    },

    /// Sum of all elements, producing a scalar.
    Sum { input: Tensor },

    /// reshape() or view(): same elements in the same logical order.
    Reshape { input: Tensor },

    /// slice(start, end, dim)
    Slice {
        input: Tensor,
        dim: usize,
        start: usize,
        end: usize,
    },

    /// to_device() or to_host(): same values in another memory space.
    Transfer { input: Tensor },
}

impl Op {
    /// The tensors this op reads, in argument order.
    pub fn inputs(&self) -> Vec<&Tensor> {
        match self {
            Op::None => vec![],
            Op::Matmul { lhs, rhs } | Op::Add { lhs, rhs } | Op::Mul { lhs, rhs } => {
                vec![lhs, rhs]
            }
            Op::LayerNorm { input, gamma, beta } => vec![input, gamma, beta],
            Op::Relu { input }
            | Op::Scale { input, .. }
            | Op::Transpose { input }
            | Op::Softmax { input, .. }
            | Op::Sum { input }
            | Op::Reshape { input }
            | Op::Slice { input, .. }
            | Op::Transfer { input } => vec![input],
        }
    }

    /// Short name, used in logs and Debug output.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Matmul { .. } => "matmul",
            Op::Add { .. } => "add",
            Op::Mul { .. } => "mul",
            Op::Relu { .. } => "relu",
            Op::Scale { .. } => "scale",
            Op::Transpose { .. } => "transpose",
            Op::Softmax { .. } => "softmax",
            Op::LayerNorm { .. } => "layer_norm",
            Op::Sum { .. } => "sum",
            Op::Reshape { .. } => "reshape",
            Op::Slice { .. } => "slice",
            Op::Transfer { .. } => "transfer",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<TensorId> = self.inputs().iter().map(|t| t.id()).collect();
        write!(f, "Op::{}({:?})", self.name(), ids)
    }
}
