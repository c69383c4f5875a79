// Device — Explicit accelerator context
//
// A Device is the handle every device allocation, transfer and kernel launch
// goes through. There is no ambient "current device": callers pass the
// handle they want, and two tensors live on the same device only when they
// hold clones of the same handle.
//
// ARCHITECTURE:
// - Each Device owns a dedicated rayon thread pool. Kernels are written as
//   data-parallel loops over output rows; `launch` runs them on that pool,
//   which plays the role of the massively parallel accelerator.
// - `launch` blocks until the kernel completes. Kernels issued from one
//   caller therefore execute in issue order, like a single default stream:
//   a dependent kernel never starts before its producer has finished writing.
// - Device memory comes from a MemPool caching allocator. DeviceBuffer is
//   the RAII handle for one allocation; dropping it returns the memory to
//   the pool on every exit path.
//
// USAGE:
//   let device = Device::new(DeviceConfig::default().with_threads(4))?;
//   let t = Tensor::device((2, 3), &device)?;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::{MemPool, PoolStats};

/// Where a tensor's buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Host,
    Device,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Host => write!(f, "host"),
            Residency::Device => write!(f, "device"),
        }
    }
}

/// Construction parameters for a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Human-readable name prefix (e.g., "ember").
    pub name: String,
    /// Ordinal distinguishing several devices with the same name.
    pub ordinal: usize,
    /// Worker threads for kernel execution. 0 means one per available core.
    pub threads: usize,
    /// Maximum bytes of device memory (live + cached). None is unbounded.
    pub memory_limit: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: "ember".to_string(),
            ordinal: 0,
            threads: 0,
            memory_limit: None,
        }
    }
}

impl DeviceConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
}

struct DeviceInner {
    config: DeviceConfig,
    workers: rayon::ThreadPool,
    pool: MemPool,
}

/// An accelerator context: a kernel thread pool plus a caching allocator.
/// Clonable (uses Arc internally); clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device from `config`.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let label = format!("{}:{}", config.name, config.ordinal);
        let thread_label = label.clone();
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(move |i| format!("{thread_label}-worker-{i}"))
            .build()
            .map_err(|e| Error::msg(format!("device {label}: thread pool creation failed: {e}")))?;

        log::debug!(
            "created device {label} with {} workers, memory limit {:?}",
            workers.current_num_threads(),
            config.memory_limit
        );

        Ok(Device {
            inner: Arc::new(DeviceInner {
                pool: MemPool::new(config.memory_limit),
                config,
                workers,
            }),
        })
    }

    /// A device with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(DeviceConfig::default())
    }

    /// A human-readable name for this device (e.g., "ember:0").
    pub fn name(&self) -> String {
        format!("{}:{}", self.inner.config.name, self.inner.config.ordinal)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Number of kernel worker threads.
    pub fn num_threads(&self) -> usize {
        self.inner.workers.current_num_threads()
    }

    /// Whether `other` is a handle to the same device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run a kernel on this device and wait for it to finish.
    pub fn launch<R, F>(&self, kernel: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.inner.workers.install(kernel)
    }

    // Memory

    /// Allocate `n` elements; contents are undefined.
    pub fn alloc(&self, n: usize) -> Result<DeviceBuffer> {
        let data = self.inner.pool.alloc(&self.name(), n)?;
        Ok(DeviceBuffer {
            data,
            device: self.clone(),
        })
    }

    /// Allocate `n` zero-initialised elements.
    pub fn alloc_zeros(&self, n: usize) -> Result<DeviceBuffer> {
        let data = self.inner.pool.alloc_zeros(&self.name(), n)?;
        Ok(DeviceBuffer {
            data,
            device: self.clone(),
        })
    }

    /// Copy a host slice into a fresh device buffer.
    pub fn upload(&self, host: &[f32]) -> Result<DeviceBuffer> {
        let mut buf = self.alloc(host.len())?;
        buf.copy_from_slice(host);
        log::trace!("{}: host -> device copy of {} floats", self.name(), host.len());
        Ok(buf)
    }

    /// Get the memory pool.
    pub fn pool(&self) -> &MemPool {
        &self.inner.pool
    }

    /// Return pool statistics (cached bytes, hits, misses, etc.).
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Release all cached device memory.
    pub fn empty_cache(&self) {
        let bytes = self.inner.pool.empty_cache();
        log::debug!("{}: released {bytes} cached bytes", self.name());
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.same_device(other)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.name())
    }
}

/// One device allocation. Derefs to the element slice; dropping it returns
/// the memory to the owning device's pool.
pub struct DeviceBuffer {
    data: Vec<f32>,
    device: Device,
}

impl DeviceBuffer {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Copy the contents back to a host vector.
    pub fn download(&self) -> Vec<f32> {
        log::trace!(
            "{}: device -> host copy of {} floats",
            self.device.name(),
            self.data.len()
        );
        self.data.clone()
    }
}

impl Deref for DeviceBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl DerefMut for DeviceBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.pool().reclaim(std::mem::take(&mut self.data));
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBuffer(len={}, device={})", self.data.len(), self.device.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(DeviceConfig::default().with_threads(2)).unwrap()
    }

    #[test]
    fn test_name_and_identity() {
        let a = device();
        let b = Device::new(DeviceConfig::default().with_ordinal(1)).unwrap();
        assert_eq!(a.name(), "ember:0");
        assert_eq!(b.name(), "ember:1");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.num_threads(), 2);
    }

    #[test]
    fn test_buffer_returns_to_pool_on_drop() {
        let dev = device();
        {
            let buf = dev.upload(&[1.0, 2.0, 3.0]).unwrap();
            assert_eq!(buf.download(), vec![1.0, 2.0, 3.0]);
            assert_eq!(dev.pool_stats().in_use_bytes, 12);
        }
        let stats = dev.pool_stats();
        assert_eq!(stats.in_use_bytes, 0);
        assert_eq!(stats.cached_buffers, 1);
        dev.empty_cache();
        assert_eq!(dev.pool_stats().cached_buffers, 0);
    }

    #[test]
    fn test_launch_runs_on_device_workers() {
        let dev = device();
        let name = dev.launch(|| std::thread::current().name().map(str::to_string));
        assert!(name.unwrap_or_default().starts_with("ember:0-worker-"));
    }

    #[test]
    fn test_memory_limit() {
        let dev = Device::new(DeviceConfig::default().with_memory_limit(16)).unwrap();
        let _a = dev.alloc(4).unwrap();
        let err = dev.alloc(1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Resource);
    }
}
