//! # ember-nn
//!
//! The transformer block for Ember, built directly on the kernel layer.
//!
//! 1. **TransformerConfig**: `d_model`, `num_heads`, `d_ff`
//! 2. **HostTransformerBlock**: host-memory template of a block's parameters
//! 3. **TransformerBlock**: device-resident parameters plus `forward`
//! 4. **Workspace**: caller-owned scratch memory for `forward`

pub mod config;
pub mod transformer;
pub mod workspace;

pub use config::TransformerConfig;
pub use transformer::{HostTransformerBlock, TransformerBlock};
pub use workspace::Workspace;
