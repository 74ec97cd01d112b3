//! CUDA dequantization for blockq
//!
//! Decodes rows of quantized blocks on the GPU, one CUDA block per
//! quantized block, with scratch memory drawn from a small first-fit pool.
//!
//! # Architecture
//!
//! ```text
//! host bytes ──htod──▶ pooled source region
//!                            │
//!                  dequantize_block_<format>   grid = block_count, on the context stream
//!                            ▼
//!                      pooled f32 region ──dtoh──▶ Vec<f32>
//! ```
//!
//! Callers that keep their data on the device skip the copies and use
//! [`DequantKernels::dispatch_decode`] directly on their own stream.
//!
//! # Example
//!
//! ```ignore
//! use blockq_cuda::{ContextConfig, QuantContext};
//! use blockq_core::BlockFormat;
//!
//! let ctx = QuantContext::new(ContextConfig::default())?;
//! let values = ctx.dequantize_row(BlockFormat::Q4_0, &row_bytes, 4096)?;
//! ```

pub mod config;
pub mod error;
pub mod kernels;
pub mod memory;

pub use config::ContextConfig;
pub use error::{CudaError, Result};
pub use kernels::{kernel_name, kernel_source, DequantKernels};
pub use memory::{CudaAllocator, CudaBufferPool, CudaLease};

use std::sync::Arc;

use blockq_core::{block_count, BlockFormat, BufferPool};
use cudarc::driver::{sys, CudaDevice, CudaStream};

use crate::error::DriverResultExt;

/// Compute capability of `device` as `(major, minor)`, `(0, 0)` if unknown.
fn compute_capability(device: &CudaDevice) -> (u32, u32) {
    let attr = |attribute: sys::CUdevice_attribute| {
        device.attribute(attribute).map_or(0, |v| v.max(0) as u32)
    };
    (
        attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR),
        attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR),
    )
}

/// NVRTC architecture name for a compute capability, e.g. `sm_86`.
pub fn nvrtc_target((major, minor): (u32, u32)) -> String {
    format!("sm_{major}{minor}")
}

/// GPU dequantization context.
///
/// Owns the CUDA device, a dedicated stream, the buffer pool and the
/// compiled kernels.
pub struct QuantContext {
    device: Arc<CudaDevice>,
    stream: CudaStream,
    pool: CudaBufferPool,
    kernels: DequantKernels,
    #[cfg(feature = "cublas")]
    blas: std::sync::OnceLock<cudarc::cublas::CudaBlas>,
}

// SAFETY: the stream handle is only used to enqueue work, which the driver
// serializes per stream. The pool is internally locked and the device is
// already Send + Sync.
unsafe impl Send for QuantContext {}

// SAFETY: as above; every `&self` method either enqueues on the stream or
// goes through the pool's lock.
unsafe impl Sync for QuantContext {}

impl QuantContext {
    /// Open the configured device and build its pool and kernels.
    pub fn new(config: ContextConfig) -> Result<Self> {
        config.validate()?;

        let count = CudaDevice::count().check("cuDeviceGetCount")?;
        if config.device_id >= count.max(0) as usize {
            return Err(CudaError::DeviceNotFound(config.device_id));
        }

        let device = CudaDevice::new(config.device_id).check("cuDeviceGet")?;
        let stream = device.fork_default_stream().check("cuStreamCreate")?;
        let pool = BufferPool::with_config(CudaAllocator::new(device.clone()), &config.pool)?;
        let kernels = DequantKernels::new(device.clone())?;

        let ctx = Self {
            device,
            stream,
            pool,
            kernels,
            #[cfg(feature = "cublas")]
            blas: std::sync::OnceLock::new(),
        };
        let summary = ctx.summary();
        tracing::info!(
            device = summary.ordinal,
            name = %summary.name,
            target = %summary.target,
            pool_capacity = summary.pool_capacity,
            "CUDA dequantization context ready"
        );
        Ok(ctx)
    }

    /// Describe the device and the resources this context holds on it.
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            ordinal: self.device.ordinal(),
            name: self.device.name().unwrap_or_default(),
            target: nvrtc_target(compute_capability(&self.device)),
            kernels: self.kernels.kernel_count(),
            pool_capacity: self.pool.capacity(),
        }
    }

    /// Get the CUDA device.
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Get the context stream.
    pub fn stream(&self) -> &CudaStream {
        &self.stream
    }

    /// Get the buffer pool.
    pub fn pool(&self) -> &CudaBufferPool {
        &self.pool
    }

    /// Get the compiled kernels.
    pub fn kernels(&self) -> &DequantKernels {
        &self.kernels
    }

    /// Decode a host row on the GPU and copy the values back.
    ///
    /// Returns `block_count * block_len` values; a trailing partial block
    /// in `row_length` is not decoded.
    pub fn dequantize_row(
        &self,
        format: BlockFormat,
        source: &[u8],
        row_length: usize,
    ) -> Result<Vec<f32>> {
        let blocks = block_count(format, row_length);
        let src_bytes = blocks * format.block_bytes();
        if source.len() < src_bytes {
            return Err(blockq_core::Error::buffer_too_small(src_bytes, source.len()).into());
        }

        let mut values = vec![0.0f32; blocks * format.block_len()];
        if blocks == 0 {
            return Ok(values);
        }
        let dst_bytes = std::mem::size_of_val(values.as_slice());

        let mut src = self.pool.lease(src_bytes)?;
        let mut dst = self.pool.lease(dst_bytes)?;

        self.device
            .htod_sync_copy_into(&source[..src_bytes], &mut src.slice_mut(..src_bytes))
            .check("cuMemcpyHtoD")?;

        self.kernels.dispatch_decode(
            format,
            &src.slice(..src_bytes),
            &mut dst.slice_mut(..dst_bytes),
            row_length,
            &self.stream,
        )?;

        // Order the default-stream copy after the decode.
        self.device.wait_for(&self.stream).check("cuStreamWaitEvent")?;
        self.device
            .dtoh_sync_copy_into(
                &dst.slice(..dst_bytes),
                bytemuck::cast_slice_mut::<f32, u8>(&mut values),
            )
            .check("cuMemcpyDtoH")?;

        Ok(values)
    }

    /// Block until all work on the context stream has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.device.wait_for(&self.stream).check("cuStreamWaitEvent")?;
        self.device.synchronize().check("cuCtxSynchronize")
    }

    /// cuBLAS handle bound to the context stream, created on first use.
    #[cfg(feature = "cublas")]
    pub fn blas(&self) -> Result<&cudarc::cublas::CudaBlas> {
        if let Some(blas) = self.blas.get() {
            return Ok(blas);
        }

        let blas = cudarc::cublas::CudaBlas::new(self.device.clone())
            .map_err(|err| CudaError::Blas(err.to_string()))?;
        // SAFETY: the stream belongs to the same device and lives as long as
        // `self`, which also owns the handle.
        unsafe { blas.set_stream(Some(&self.stream)) }
            .map_err(|err| CudaError::Blas(err.to_string()))?;

        tracing::info!(device = self.device.ordinal(), "cuBLAS handle bound to context stream");
        Ok(self.blas.get_or_init(move || blas))
    }
}

impl std::fmt::Debug for QuantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantContext")
            .field("device", &self.device.ordinal())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Check if a CUDA device is available.
pub fn is_available() -> bool {
    std::panic::catch_unwind(|| CudaDevice::count().map(|n| n > 0).unwrap_or(false))
        .unwrap_or(false)
}

/// What a [`QuantContext`] runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSummary {
    pub ordinal: usize,
    pub name: String,
    /// NVRTC architecture the device reports
    pub target: String,
    /// Number of loaded dequantization entry points
    pub kernels: usize,
    /// Idle slots in the buffer pool
    pub pool_capacity: usize,
}

impl std::fmt::Display for ContextSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GPU {}: {} ({}), {} kernels, pool of {} slots",
            self.ordinal, self.name, self.target, self.kernels, self.pool_capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockq_core::{decode_row, BlockQ4_0, BlockQ4_1, BlockQ4_2, BlockQ4_3, BlockQ8_0};
    use cudarc::driver::CudaSlice;
    use half::f16;

    /// Context on device 0, or `None` when no GPU is present.
    fn test_context() -> Option<QuantContext> {
        std::panic::catch_unwind(|| QuantContext::new(ContextConfig::default()).ok())
            .ok()
            .flatten()
    }

    /// A row of `blocks` blocks with varied scales and codes.
    fn sample_row(format: BlockFormat, blocks: usize) -> Vec<u8> {
        let mut row = Vec::with_capacity(blocks * format.block_bytes());
        for b in 0..blocks {
            let d = 0.125 * (b as f32 + 1.0) * if b % 2 == 0 { 1.0 } else { -1.0 };
            let m = -0.5 + 0.25 * b as f32;
            let nib32: [u8; 32] = std::array::from_fn(|i| ((i * 7 + b) % 16) as u8);
            let nib16: [u8; 16] = std::array::from_fn(|i| ((i * 5 + b) % 16) as u8);
            match format {
                BlockFormat::Q4_0 => {
                    row.extend_from_slice(bytemuck::bytes_of(&BlockQ4_0::new(d, &nib32)))
                }
                BlockFormat::Q4_1 => {
                    row.extend_from_slice(bytemuck::bytes_of(&BlockQ4_1::new(d, m, &nib32)))
                }
                BlockFormat::Q4_2 => row.extend_from_slice(bytemuck::bytes_of(&BlockQ4_2::new(
                    f16::from_f32(d),
                    &nib16,
                ))),
                BlockFormat::Q4_3 => row.extend_from_slice(bytemuck::bytes_of(&BlockQ4_3::new(
                    f16::from_f32(d),
                    f16::from_f32(m),
                    &nib16,
                ))),
                BlockFormat::Q8_0 => {
                    let qs: [i8; 32] =
                        std::array::from_fn(|i| (i as i32 * 9 - 128 + b as i32) as i8);
                    row.extend_from_slice(bytemuck::bytes_of(&BlockQ8_0::new(d, qs)))
                }
            }
        }
        row
    }

    fn bits(values: &[f32]) -> Vec<u32> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn test_nvrtc_target() {
        assert_eq!(nvrtc_target((8, 6)), "sm_86");
        assert_eq!(nvrtc_target((12, 0)), "sm_120");
    }

    #[test]
    fn test_summary_display() {
        let summary = ContextSummary {
            ordinal: 1,
            name: "Test GPU".to_string(),
            target: nvrtc_target((7, 5)),
            kernels: BlockFormat::ALL.len(),
            pool_capacity: 16,
        };
        assert_eq!(
            summary.to_string(),
            "GPU 1: Test GPU (sm_75), 5 kernels, pool of 16 slots"
        );
    }

    #[test]
    fn test_context_summary() {
        let Some(ctx) = test_context() else {
            return;
        };
        let summary = ctx.summary();
        assert_eq!(summary.ordinal, 0);
        assert_eq!(summary.kernels, BlockFormat::ALL.len());
        assert_eq!(summary.pool_capacity, 16);
        assert!(summary.target.starts_with("sm_"));
    }

    #[test]
    fn test_zero_byte_lease() {
        let Some(ctx) = test_context() else {
            return;
        };
        let lease = ctx.pool().lease(0).unwrap();
        assert_eq!(lease.size(), 0);
    }

    #[cfg(feature = "cublas")]
    #[test]
    fn test_blas_created_once() {
        let Some(ctx) = test_context() else {
            return;
        };
        let first = ctx.blas().unwrap();
        let second = ctx.blas().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_is_available_does_not_panic() {
        let _ = is_available();
    }

    #[test]
    fn test_missing_device_is_reported() {
        if test_context().is_none() {
            return;
        }
        let config = ContextConfig::default().with_device(10_000);
        assert!(matches!(
            QuantContext::new(config),
            Err(CudaError::DeviceNotFound(10_000))
        ));
    }

    #[test]
    fn test_gpu_matches_host_decode() {
        let Some(ctx) = test_context() else {
            return;
        };
        for format in BlockFormat::ALL {
            let blocks = 37;
            let row_length = blocks * format.block_len();
            let row = sample_row(format, blocks);

            let mut expected = vec![0.0f32; row_length];
            decode_row(format, &row, &mut expected, row_length).unwrap();
            let actual = ctx.dequantize_row(format, &row, row_length).unwrap();

            assert_eq!(bits(&actual), bits(&expected), "format {format}");
        }
    }

    #[test]
    fn test_gpu_truncates_partial_block() {
        let Some(ctx) = test_context() else {
            return;
        };
        let row = sample_row(BlockFormat::Q4_0, 2);
        let values = ctx.dequantize_row(BlockFormat::Q4_0, &row, 64 + 5).unwrap();
        assert_eq!(values.len(), 64);
        assert!(ctx.dequantize_row(BlockFormat::Q4_0, &row, 31).unwrap().is_empty());
    }

    #[test]
    fn test_gpu_scratch_is_reused() {
        let Some(ctx) = test_context() else {
            return;
        };
        let row = sample_row(BlockFormat::Q8_0, 8);
        ctx.dequantize_row(BlockFormat::Q8_0, &row, 256).unwrap();
        let after_first = ctx.pool().stats();
        ctx.dequantize_row(BlockFormat::Q8_0, &row, 256).unwrap();
        let after_second = ctx.pool().stats();

        assert_eq!(after_first.misses, 2);
        assert!(after_second.hits > after_first.hits);
        assert!(after_second.idle_buffers <= after_second.capacity);
    }

    #[test]
    fn test_dispatch_rejects_short_output() {
        let Some(ctx) = test_context() else {
            return;
        };
        let row = sample_row(BlockFormat::Q4_1, 4);
        let source = ctx.device().htod_sync_copy(&row).unwrap();
        let mut output: CudaSlice<f32> = ctx.device().alloc_zeros(3 * 32).unwrap();

        let err = ctx
            .kernels()
            .dispatch_decode(BlockFormat::Q4_1, &source, &mut output, 4 * 32, ctx.stream())
            .unwrap_err();
        assert!(matches!(
            err,
            CudaError::SizeMismatch {
                expected: 512,
                actual: 384
            }
        ));
    }

    #[test]
    fn test_dispatch_leaves_tail_untouched() {
        let Some(ctx) = test_context() else {
            return;
        };
        let row = sample_row(BlockFormat::Q4_2, 3);
        let source = ctx.device().htod_sync_copy(&row).unwrap();
        let mut output = ctx.device().htod_sync_copy(&vec![-7.0f32; 3 * 16 + 9]).unwrap();

        let blocks = ctx
            .kernels()
            .dispatch_decode(BlockFormat::Q4_2, &source, &mut output, 3 * 16 + 9, ctx.stream())
            .unwrap();
        assert_eq!(blocks, 3);

        ctx.synchronize().unwrap();
        let values = ctx.device().dtoh_sync_copy(&output).unwrap();
        assert!(values[48..].iter().all(|&v| v == -7.0));

        let mut expected = vec![0.0f32; 48];
        decode_row(BlockFormat::Q4_2, &row, &mut expected, 48).unwrap();
        assert_eq!(bits(&values[..48]), bits(&expected));
    }
}
