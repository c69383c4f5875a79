//! # Ember
//!
//! A minimal tensor runtime: device-resident buffers, a handful of kernels,
//! reverse-mode autograd and a post-norm transformer block.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use ember::prelude::*;
//!
//! # fn main() -> ember::Result<()> {
//! let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2))?.requires_grad_(true);
//! let b = Tensor::from_vec(vec![0.5; 4], (2, 2))?;
//! let loss = a.matmul(&b)?.sum()?;
//! loss.backward()?;
//! assert_eq!(a.grad(), Some(vec![1.0; 4]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `ember-core` | Tensor, Shape, Layout, Device and memory pool, kernels, autograd |
//! | `ember-nn` | TransformerConfig, TransformerBlock, Workspace |

/// Re-export core types.
pub use ember_core::{
    bail,
    op::{Op, TensorId},
    Device, DeviceBuffer, DeviceConfig, Error, ErrorKind, GradStore, Layout, MemPool, PoolStats,
    Residency, Result, Shape, Storage, Tensor,
};

/// Re-export the kernel layer.
pub mod kernels {
    pub use ember_core::kernels::*;
}

/// Re-export the transformer block.
pub mod nn {
    pub use ember_nn::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::kernels::{MatmulKernel, Naive, Tiled};
    pub use crate::nn::{HostTransformerBlock, TransformerBlock, TransformerConfig, Workspace};
    pub use crate::{Device, DeviceConfig, Error, GradStore, Residency, Result, Shape, Tensor};
}
