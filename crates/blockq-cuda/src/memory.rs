//! Device memory for the buffer pool.
//!
//! ```text
//! QuantContext
//!   └── BufferPool<CudaAllocator>   (16 idle slots, first-fit)
//!         └── CudaAllocator         (cuMemAlloc / cuMemFree via cudarc)
//! ```
//!
//! Regions are plain `CudaSlice<u8>`; dropping one frees it on the device.

use std::sync::Arc;

use blockq_core::{BufferPool, DeviceAllocator, PooledBuffer};
use cudarc::driver::{CudaDevice, CudaSlice};

/// Buffer pool over device memory.
pub type CudaBufferPool = BufferPool<CudaAllocator>;

/// A leased device region that returns to its pool on drop.
pub type CudaLease<'a> = PooledBuffer<'a, CudaAllocator>;

/// Raw device allocator used by the pool on a miss or an overflow.
#[derive(Clone)]
pub struct CudaAllocator {
    device: Arc<CudaDevice>,
}

impl CudaAllocator {
    /// Create an allocator on `device`.
    pub fn new(device: Arc<CudaDevice>) -> Self {
        Self { device }
    }

    /// Get the CUDA device.
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }
}

impl std::fmt::Debug for CudaAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaAllocator")
            .field("device", &self.device.ordinal())
            .finish()
    }
}

impl DeviceAllocator for CudaAllocator {
    type Region = CudaSlice<u8>;

    /// Zero-byte requests get a one-byte region; the driver rejects empty
    /// allocations.
    fn allocate(&self, size: usize) -> blockq_core::Result<CudaSlice<u8>> {
        self.device.alloc_zeros::<u8>(size.max(1)).map_err(|err| {
            tracing::error!(size, error = %err, "device allocation failed");
            blockq_core::Error::allocation_failed(size, err.to_string())
        })
    }

    fn free(&self, region: CudaSlice<u8>) {
        drop(region);
    }
}
