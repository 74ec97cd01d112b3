//! Core traits.
//!
//! ## Allocation seam
//!
//! ```text
//! BufferPool<A>  (first-fit reuse cache, fixed slot table)
//!       ↓ miss / overflow
//! DeviceAllocator  (raw allocate / free on the accelerator)
//! ```

use crate::error::Result;

/// Raw memory manager behind a [`BufferPool`](crate::pool::BufferPool).
///
/// The pool calls `allocate` only on a cache miss and `free` only when a
/// released region does not fit, so implementations should be the plain,
/// expensive round-trip to the device runtime.
pub trait DeviceAllocator {
    /// Handle to one allocated region.
    type Region;

    /// Allocate a region of exactly `size` bytes.
    ///
    /// `size` may be zero; runtimes without empty allocations round it up.
    /// Failure is fatal for the caller; the pool never retries.
    fn allocate(&self, size: usize) -> Result<Self::Region>;

    /// Return a region to the device.
    fn free(&self, region: Self::Region);
}

impl<A: DeviceAllocator + ?Sized> DeviceAllocator for &A {
    type Region = A::Region;

    fn allocate(&self, size: usize) -> Result<Self::Region> {
        (**self).allocate(size)
    }

    fn free(&self, region: Self::Region) {
        (**self).free(region)
    }
}
