//! Device buffer pool.
//!
//! A fixed table of slots caching idle device regions so repeated
//! decode/compute cycles skip the allocator.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     BufferPool (N slots)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐             │
//! │  │ 4 MiB  │ │ empty  │ │ 64 KiB │ │ empty  │  ...        │
//! │  └────────┘ └────────┘ └────────┘ └────────┘             │
//! │        acquire: first occupied slot with size >= request │
//! │        release: first empty slot, else free the region   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The slot table sits behind a [`SpinLock`] held only for the scan. The
//! allocator is always called with the lock released.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::sync::SpinLock;
use crate::traits::DeviceAllocator;

/// One idle region and its usable size.
struct PoolEntry<R> {
    region: R,
    size: usize,
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    cached: AtomicU64,
    overflows: AtomicU64,
}

/// Fixed-capacity, first-fit cache of idle device regions.
pub struct BufferPool<A: DeviceAllocator> {
    allocator: A,
    slots: SpinLock<Vec<Option<PoolEntry<A::Region>>>>,
    counters: PoolCounters,
}

impl<A: DeviceAllocator> BufferPool<A> {
    /// Create a pool with `capacity` slots.
    pub fn new(allocator: A, capacity: usize) -> Result<Self> {
        Self::with_config(allocator, &PoolConfig::default().with_capacity(capacity))
    }

    /// Create a pool from configuration.
    pub fn with_config(allocator: A, config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.capacity).map(|_| None).collect();
        Ok(Self {
            allocator,
            slots: SpinLock::new(slots),
            counters: PoolCounters::default(),
        })
    }

    /// Get the underlying allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Take a region of at least `min_size` bytes.
    ///
    /// Returns the region and its actual size, which may exceed `min_size`
    /// on a cache hit. Pass the actual size back to [`release`](Self::release).
    /// On a miss exactly `min_size` bytes are requested from the allocator,
    /// including a zero-byte request for `min_size == 0`.
    pub fn acquire(&self, min_size: usize) -> Result<(A::Region, usize)> {
        let hit = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .find(|slot| matches!(slot, Some(entry) if entry.size >= min_size))
                .and_then(Option::take)
        };

        if let Some(entry) = hit {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(min_size, actual_size = entry.size, "buffer pool hit");
            return Ok((entry.region, entry.size));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(min_size, "buffer pool miss, allocating");
        let region = self.allocator.allocate(min_size)?;
        Ok((region, min_size))
    }

    /// Return a region for reuse.
    ///
    /// If every slot is occupied the region is freed immediately.
    pub fn release(&self, region: A::Region, size: usize) {
        let overflow = {
            let mut slots = self.slots.lock();
            match slots.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(PoolEntry { region, size });
                    None
                }
                None => Some(region),
            }
        };

        match overflow {
            None => {
                self.counters.cached.fetch_add(1, Ordering::Relaxed);
            }
            Some(region) => {
                self.counters.overflows.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    capacity = self.capacity(),
                    size,
                    "buffer pool full, freeing region; increase pool capacity"
                );
                self.allocator.free(region);
            }
        }
    }

    /// Acquire a region wrapped in a guard that releases it on drop.
    pub fn lease(&self, min_size: usize) -> Result<PooledBuffer<'_, A>> {
        let (region, size) = self.acquire(min_size)?;
        Ok(PooledBuffer {
            pool: self,
            region: ManuallyDrop::new(region),
            size,
        })
    }

    /// Free every idle region. Returns the number freed.
    pub fn clear(&self) -> usize {
        let drained: Vec<PoolEntry<A::Region>> = {
            let mut slots = self.slots.lock();
            slots.iter_mut().filter_map(Option::take).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.allocator.free(entry.region);
        }
        if count > 0 {
            tracing::debug!(count, "buffer pool cleared");
        }
        count
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (idle_buffers, idle_bytes, capacity) = {
            let slots = self.slots.lock();
            let idle = slots.iter().flatten();
            (
                idle.clone().count(),
                idle.map(|entry| entry.size).sum::<usize>(),
                slots.len(),
            )
        };
        PoolStats {
            capacity,
            idle_buffers,
            idle_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            cached: self.counters.cached.load(Ordering::Relaxed),
            overflows: self.counters.overflows.load(Ordering::Relaxed),
        }
    }
}

impl<A: DeviceAllocator> Drop for BufferPool<A> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        for entry in slots.iter_mut().filter_map(Option::take) {
            self.allocator.free(entry.region);
        }
    }
}

impl<A: DeviceAllocator> fmt::Debug for BufferPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A pooled region that goes back to its pool when dropped.
pub struct PooledBuffer<'a, A: DeviceAllocator> {
    pool: &'a BufferPool<A>,
    region: ManuallyDrop<A::Region>,
    size: usize,
}

impl<A: DeviceAllocator> PooledBuffer<'_, A> {
    /// Actual size of the region, which may exceed the requested size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Detach the region from the pool. The caller must release it.
    pub fn into_parts(self) -> (A::Region, usize) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the region is moved out once.
        let region = unsafe { ManuallyDrop::take(&mut this.region) };
        (region, this.size)
    }
}

impl<A: DeviceAllocator> Deref for PooledBuffer<'_, A> {
    type Target = A::Region;

    fn deref(&self) -> &A::Region {
        &self.region
    }
}

impl<A: DeviceAllocator> DerefMut for PooledBuffer<'_, A> {
    fn deref_mut(&mut self) -> &mut A::Region {
        &mut self.region
    }
}

impl<A: DeviceAllocator> Drop for PooledBuffer<'_, A> {
    fn drop(&mut self) {
        // SAFETY: drop runs once and the region is not touched afterwards.
        let region = unsafe { ManuallyDrop::take(&mut self.region) };
        self.pool.release(region, self.size);
    }
}

/// Buffer pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle_buffers: usize,
    pub idle_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub cached: u64,
    pub overflows: u64,
}

impl PoolStats {
    /// Fraction of acquires served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool: {}/{} slots idle ({:.1}MB), {} hits, {} misses ({:.0}% hit rate), {} overflow frees",
            self.idle_buffers,
            self.capacity,
            self.idle_bytes as f64 / 1e6,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.overflows,
        )
    }
}
