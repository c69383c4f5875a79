use crate::device::{Device, DeviceBuffer, Residency};
use crate::error::Result;

/// A flat f32 buffer in host or device memory.
///
/// A tensor's data buffer never changes length after allocation; views share
/// a Storage and differ only in their Layout.
#[derive(Debug)]
pub enum Storage {
    Host(Vec<f32>),
    Device(DeviceBuffer),
}

impl Storage {
    /// Zero-filled storage of `n` elements, on `device` if given, else on host.
    pub fn zeros(n: usize, device: Option<&Device>) -> Result<Self> {
        match device {
            Some(dev) => Ok(Storage::Device(dev.alloc_zeros(n)?)),
            None => Ok(Storage::Host(vec![0.0; n])),
        }
    }

    /// Storage holding `data`, uploaded to `device` if given.
    pub fn from_vec(data: Vec<f32>, device: Option<&Device>) -> Result<Self> {
        match device {
            Some(dev) => Ok(Storage::Device(dev.upload(&data)?)),
            None => Ok(Storage::Host(data)),
        }
    }

    pub fn residency(&self) -> Residency {
        match self {
            Storage::Host(_) => Residency::Host,
            Storage::Device(_) => Residency::Device,
        }
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            Storage::Host(_) => None,
            Storage::Device(buf) => Some(buf.device()),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[f32] {
        match self {
            Storage::Host(v) => v,
            Storage::Device(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        match self {
            Storage::Host(v) => v,
            Storage::Device(buf) => buf,
        }
    }
}
