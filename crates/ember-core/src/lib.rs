//! # ember-core
//!
//! Tensors, kernels, device contexts and reverse-mode autograd for Ember.
//!
//! This crate provides:
//! - [`Shape`] / [`Layout`] — dimensions, strides and views into storage
//! - [`kernels`] — stateless numeric routines over flat f32 buffers
//! - [`Device`] — an explicit accelerator context with a caching allocator
//! - [`Tensor`] — n-dimensional f32 array with automatic differentiation
//! - [`GradStore`] — the gradients of one `backward()` pass
// - Shape: dimension algebra (reshape with inference, transpose, squeeze)
// - Layout: shape + strides + offset for views
// - kernels: matmul, softmax, layer norm, attention, ... and their backwards
// - Device / pool: worker pool and memory pool behind device residency
// - Tensor / Op / backprop: the dynamic computation graph

pub mod backprop;
pub mod device;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod op;
pub mod pool;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use backprop::GradStore;
pub use device::{Device, DeviceBuffer, DeviceConfig, Residency};
pub use error::{Error, ErrorKind, Result};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use pool::{MemPool, PoolStats};
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;
