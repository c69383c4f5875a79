// Device Memory Pool — Caching allocator for device buffer reuse
//
// Avoids repeated allocate/free round-trips by keeping per-size free lists
// of previously released buffers. A buffer returned to the pool is not
// freed; the next allocation with the same element count reuses it.
//
// The pool also does the device's memory accounting. Bytes handed out to
// live buffers plus bytes parked in the cache may never exceed the device's
// memory limit. When an allocation would cross the limit the cache is
// dropped first, and only if that is still not enough does the allocation
// fail with OutOfDeviceMemory.
//
// Usage (through Device helpers):
//
//   let buf = device.alloc(1024)?;     // from pool, contents undefined
//   drop(buf);                         // returned to the pool
//   let stats = device.pool_stats();   // query
//   device.empty_cache();              // release cached buffers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

const ELEM_BYTES: usize = std::mem::size_of::<f32>();

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes currently held in the cache (not in use by tensors).
    pub cached_bytes: usize,
    /// Number of individual buffers currently in the cache.
    pub cached_buffers: usize,
    /// Bytes currently owned by live buffers.
    pub in_use_bytes: usize,
    /// Cumulative cache hits (allocations served from the cache).
    pub hits: u64,
    /// Cumulative cache misses (allocations that needed fresh memory).
    pub misses: u64,
}

/// A caching allocator for f32 device buffers.
pub struct MemPool {
    /// element count → stack of free buffers of exactly that length
    buckets: Mutex<HashMap<usize, Vec<Vec<f32>>>>,
    limit: Option<usize>,
    in_use: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemPool {
    /// Create a new empty pool. `limit` caps live plus cached bytes.
    pub fn new(limit: Option<usize>) -> Self {
        MemPool {
            buckets: Mutex::new(HashMap::new()),
            limit,
            in_use: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<usize, Vec<Vec<f32>>>>> {
        self.buckets
            .lock()
            .map_err(|_| Error::msg("memory pool lock poisoned"))
    }

    /// Allocate `n` elements, reusing a cached buffer if available.
    /// The returned buffer content is **undefined** (not zeroed).
    pub fn alloc(&self, device: &str, n: usize) -> Result<Vec<f32>> {
        let bytes = n * ELEM_BYTES;
        {
            let mut map = self.lock()?;
            if let Some(buf) = map.get_mut(&n).and_then(|stack| stack.pop()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.in_use.fetch_add(bytes, Ordering::Relaxed);
                return Ok(buf);
            }

            if let Some(limit) = self.limit {
                let in_use = self.in_use.load(Ordering::Relaxed);
                let cached = cached_elems(&map) * ELEM_BYTES;
                if in_use + cached + bytes > limit && cached > 0 {
                    log::warn!(
                        "{device}: dropping {cached} cached bytes to fit a {bytes}-byte allocation"
                    );
                    map.clear();
                }
                if in_use + bytes > limit {
                    return Err(Error::OutOfDeviceMemory {
                        device: device.to_string(),
                        requested: bytes,
                        available: limit.saturating_sub(in_use),
                    });
                }
            }
            // reserved under the lock: every limit check must see all live bytes
            self.in_use.fetch_add(bytes, Ordering::Relaxed);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(vec![0.0; n])
    }

    /// Allocate `n` zero-initialised elements.
    pub fn alloc_zeros(&self, device: &str, n: usize) -> Result<Vec<f32>> {
        let mut buf = self.alloc(device, n)?;
        buf.fill(0.0);
        Ok(buf)
    }

    /// Return a buffer to the cache.
    pub fn reclaim(&self, buf: Vec<f32>) {
        let n = buf.len();
        self.in_use.fetch_sub(n * ELEM_BYTES, Ordering::Relaxed);
        // A poisoned pool just frees the buffer instead of caching it.
        if let Ok(mut map) = self.buckets.lock() {
            map.entry(n).or_default().push(buf);
        }
    }

    /// Release all cached buffers. Returns the number of bytes released.
    pub fn empty_cache(&self) -> usize {
        match self.buckets.lock() {
            Ok(mut map) => {
                let bytes = cached_elems(&map) * ELEM_BYTES;
                map.clear();
                bytes
            }
            Err(_) => 0,
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (cached_buffers, cached_bytes) = match self.buckets.lock() {
            Ok(map) => (
                map.values().map(Vec::len).sum(),
                cached_elems(&map) * ELEM_BYTES,
            ),
            Err(_) => (0, 0),
        };
        PoolStats {
            cached_bytes,
            cached_buffers,
            in_use_bytes: self.in_use.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn cached_elems(map: &HashMap<usize, Vec<Vec<f32>>>) -> usize {
    map.iter().map(|(n, stack)| n * stack.len()).sum()
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}
