// Kernels — Stateless numeric routines over flat f32 buffers
//
// Every kernel takes raw row-major buffers plus explicit dimensions, writes
// only its output buffer(s), and knows nothing about tensors or the
// autograd graph.
//
// CONVENTIONS:
// - Buffers may be longer than the dimensions require; only the leading
//   `rows * cols` (etc.) elements are read or written.
// - Buffers shorter than required are rejected with BufferTooSmall before
//   anything is written. Workspaces are checked the same way and rejected
//   with WorkspaceTooSmall.
// - Kernels parallelise over output rows with rayon. Run through
//   `Device::launch` they execute on the device's worker pool.
//
// KERNEL LIST:
//   matmul, tiled_matmul (+ MatmulKernel: Naive, Tiled)
//   matmul_backward_a, matmul_backward_b
//   transpose, scale, relu, relu_backward, add_residual, mul
//   softmax_rows, softmax_rows_backward
//   layer_norm, layer_norm_backward
//   attention, multihead_attention

mod attention;
mod elementwise;
mod matmul;
mod norm;
mod softmax;

pub use attention::{
    attention, attention_workspace_len, multihead_attention, multihead_workspace_len,
};
pub use elementwise::{add_residual, mul, relu, relu_backward, scale, transpose};
pub use matmul::{
    matmul, matmul_backward_a, matmul_backward_b, tiled_matmul, MatmulKernel, Naive, Tiled,
};
pub use norm::{layer_norm, layer_norm_backward, LN_EPS};
pub use softmax::{softmax_rows, softmax_rows_backward};

use crate::error::{Error, Result};

/// Block edge length used by [`tiled_matmul`].
pub const TILE: usize = 16;

/// Reject a buffer shorter than `required` elements.
pub(crate) fn check_len(name: &'static str, len: usize, required: usize) -> Result<()> {
    if len < required {
        return Err(Error::BufferTooSmall {
            name,
            required,
            got: len,
        });
    }
    Ok(())
}
