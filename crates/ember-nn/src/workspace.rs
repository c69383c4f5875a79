use std::ops::{Deref, DerefMut};

use ember_core::{Device, DeviceBuffer, Result};

/// Caller-owned scratch memory for [`crate::TransformerBlock::forward`].
///
/// The block never allocates scratch space itself. A Workspace is sized once
/// (see [`crate::TransformerBlock::workspace_len`]) and reused across calls;
/// its memory comes from the device pool and returns there on drop.
pub struct Workspace {
    buf: DeviceBuffer,
}

impl Workspace {
    /// Allocate `len` floats of scratch memory on `device`.
    pub fn new(device: &Device, len: usize) -> Result<Self> {
        log::trace!("{}: workspace of {len} floats", device.name());
        Ok(Workspace {
            buf: device.alloc(len)?,
        })
    }

    pub fn device(&self) -> &Device {
        self.buf.device()
    }
}

impl Deref for Workspace {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.buf
    }
}

impl DerefMut for Workspace {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.buf
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Workspace(len={}, device={})", self.len(), self.device().name())
    }
}
