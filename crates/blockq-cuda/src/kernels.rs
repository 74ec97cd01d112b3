//! CUDA dequantization kernels.
//!
//! One device routine decodes one block of any format. Each format gets an
//! `extern "C"` entry point that fixes the routine's layout parameters,
//! generated from the same [`BlockLayout`] descriptors the host codec uses.
//!
//! # Launch geometry
//!
//! ```text
//! grid  = (block_count, 1, 1)    one CUDA block per quantized block
//! block = (1, 1, 1)              one thread walks the block's codes
//!
//! blockIdx.x = b  →  reads  src[b * block_bytes .. (b + 1) * block_bytes]
//!                   writes dst[b * block_len   .. (b + 1) * block_len]
//! ```
//!
//! Header scalars are assembled from bytes, so source rows need no
//! alignment. Arithmetic uses `__fmul_rn`/`__fadd_rn` so the device never
//! contracts into an FMA and agrees bit for bit with
//! [`blockq_core::decode_row`].

use std::sync::Arc;

use blockq_core::{block_count, BlockFormat, BlockLayout, CodeWidth, Reconstruction, ScalarWidth};
use cudarc::driver::{
    CudaDevice, CudaFunction, CudaStream, DevicePtr, DevicePtrMut, DeviceSlice, LaunchAsync,
    LaunchConfig,
};

use crate::error::{CudaError, DriverResultExt, Result};

/// Name of the loaded PTX module.
pub const MODULE_NAME: &str = "blockq_dequant";

/// Shared prelude: byte-level scalar loads and the parameterized decoder.
const KERNEL_PRELUDE: &str = r#"
typedef unsigned char uint8_t;
typedef signed char int8_t;
typedef unsigned short uint16_t;
typedef unsigned int uint32_t;

#define RECON_SYMMETRIC 0
#define RECON_EXPLICIT 1
#define RECON_SCALE 2

__device__ __forceinline__ float load_f32(const uint8_t * p) {
    const uint32_t bits = (uint32_t) p[0]
                        | ((uint32_t) p[1] << 8)
                        | ((uint32_t) p[2] << 16)
                        | ((uint32_t) p[3] << 24);
    return __uint_as_float(bits);
}

__device__ __forceinline__ float load_f16(const uint8_t * p) {
    const uint16_t bits = (uint16_t) (p[0] | (p[1] << 8));
    float out;
    asm("{ cvt.f32.f16 %0, %1; }" : "=f"(out) : "h"(bits));
    return out;
}

__device__ __forceinline__ float load_scalar(const uint8_t * p, int scalar_bytes) {
    return scalar_bytes == 2 ? load_f16(p) : load_f32(p);
}

__device__ __forceinline__ float reconstruct(int code, float d, float m, int recon, int offset) {
    switch (recon) {
        case RECON_SYMMETRIC: return __fmul_rn((float) (code - offset), d);
        case RECON_EXPLICIT:  return __fadd_rn(__fmul_rn((float) code, d), m);
        default:              return __fmul_rn((float) code, d);
    }
}

__device__ __forceinline__ void dequantize_block(
        const uint8_t * __restrict__ src,
        float * __restrict__ dst,
        const int block_len,
        const int scalar_bytes,
        const int header_fields,
        const int nibble_codes,
        const int recon,
        const int offset) {
    const int header_bytes = header_fields * scalar_bytes;
    const int code_bytes = nibble_codes ? block_len / 2 : block_len;
    const unsigned long long b = blockIdx.x;

    const uint8_t * block = src + b * (unsigned long long) (header_bytes + code_bytes);
    float * out = dst + b * (unsigned long long) block_len;

    const float d = load_scalar(block, scalar_bytes);
    const float m = header_fields == 2 ? load_scalar(block + scalar_bytes, scalar_bytes) : 0.0f;
    const uint8_t * qs = block + header_bytes;

    if (nibble_codes) {
        for (int l = 0; l < code_bytes; ++l) {
            const int vi = qs[l];
            out[2 * l + 0] = reconstruct(vi & 0xf, d, m, recon, offset);
            out[2 * l + 1] = reconstruct(vi >> 4, d, m, recon, offset);
        }
    } else {
        for (int l = 0; l < block_len; ++l) {
            out[l] = reconstruct((int) ((const int8_t *) qs)[l], d, m, recon, offset);
        }
    }
}
"#;

/// Entry point name for `format`.
pub const fn kernel_name(format: BlockFormat) -> &'static str {
    match format {
        BlockFormat::Q4_0 => "dequantize_block_q4_0",
        BlockFormat::Q4_1 => "dequantize_block_q4_1",
        BlockFormat::Q4_2 => "dequantize_block_q4_2",
        BlockFormat::Q4_3 => "dequantize_block_q4_3",
        BlockFormat::Q8_0 => "dequantize_block_q8_0",
    }
}

/// Render the `extern "C"` entry point for one layout.
fn entry_point(name: &str, layout: &BlockLayout) -> String {
    let scalar_bytes = match layout.scalar {
        ScalarWidth::F16 => 2,
        ScalarWidth::F32 => 4,
    };
    let nibble = match layout.codes {
        CodeWidth::Nibble => 1,
        CodeWidth::Int8 => 0,
    };
    let (recon, offset) = match layout.reconstruction {
        Reconstruction::SymmetricOffset(offset) => ("RECON_SYMMETRIC", offset),
        Reconstruction::ExplicitOffset => ("RECON_EXPLICIT", 0),
        Reconstruction::ScaleOnly => ("RECON_SCALE", 0),
    };

    format!(
        "\nextern \"C\" __global__ void {name}(const uint8_t * src, float * dst) {{\n    \
         dequantize_block(src, dst, {len}, {scalar_bytes}, {fields}, {nibble}, {recon}, {offset});\n}}\n",
        len = layout.block_len,
        fields = layout.reconstruction.header_fields(),
    )
}

/// Full CUDA C source for every supported format.
pub fn kernel_source() -> String {
    let mut source = String::from(KERNEL_PRELUDE);
    for format in BlockFormat::ALL {
        source.push_str(&entry_point(kernel_name(format), &format.layout()));
    }
    source
}

/// Launch config for a row of `blocks` quantized blocks.
fn launch_config(blocks: usize) -> Result<LaunchConfig> {
    let grid = u32::try_from(blocks).map_err(|_| CudaError::SizeMismatch {
        expected: u32::MAX as usize,
        actual: blocks,
    })?;
    Ok(LaunchConfig {
        grid_dim: (grid, 1, 1),
        block_dim: (1, 1, 1),
        shared_mem_bytes: 0,
    })
}

/// Compiled dequantization kernels, one per format.
pub struct DequantKernels {
    device: Arc<CudaDevice>,
    functions: Vec<CudaFunction>,
}

impl DequantKernels {
    /// Compile the kernel source with NVRTC and load it on `device`.
    pub fn new(device: Arc<CudaDevice>) -> Result<Self> {
        let ptx = cudarc::nvrtc::compile_ptx(kernel_source())
            .map_err(|err| CudaError::Compile(err.to_string()))?;

        let names: Vec<&'static str> = BlockFormat::ALL.iter().map(|&f| kernel_name(f)).collect();
        device
            .load_ptx(ptx, MODULE_NAME, &names)
            .check("cuModuleLoadData")?;

        let functions = BlockFormat::ALL
            .iter()
            .map(|&format| {
                device
                    .get_func(MODULE_NAME, kernel_name(format))
                    .ok_or_else(|| {
                        CudaError::KernelLoad(format!("Failed to load {}", kernel_name(format)))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            device = device.ordinal(),
            kernels = functions.len(),
            "Dequantization kernels compiled"
        );

        Ok(Self { device, functions })
    }

    /// Get the CUDA device.
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Number of loaded entry points.
    pub fn kernel_count(&self) -> usize {
        self.functions.len()
    }

    /// Decode a row of `row_length` elements on `stream`.
    ///
    /// Launches one invocation per whole block and returns the block count.
    /// Elements past `block_count * block_len` are not written. The launch
    /// is asynchronous; synchronize `stream` before reading `output`.
    ///
    /// Both buffers are checked against the row before launch. Element
    /// types are free so pooled byte regions and typed `f32` slices both
    /// work; `output` is addressed as `f32`.
    pub fn dispatch_decode<S, D>(
        &self,
        format: BlockFormat,
        source: &impl DevicePtr<S>,
        output: &mut impl DevicePtrMut<D>,
        row_length: usize,
        stream: &CudaStream,
    ) -> Result<usize> {
        let blocks = block_count(format, row_length);
        if blocks == 0 {
            return Ok(0);
        }

        let src_needed = blocks * format.block_bytes();
        let src_bytes = DeviceSlice::len(source) * std::mem::size_of::<S>();
        if src_bytes < src_needed {
            return Err(CudaError::SizeMismatch {
                expected: src_needed,
                actual: src_bytes,
            });
        }
        let dst_needed = blocks * format.block_len() * std::mem::size_of::<f32>();
        let dst_bytes = DeviceSlice::len(&*output) * std::mem::size_of::<D>();
        if dst_bytes < dst_needed {
            return Err(CudaError::SizeMismatch {
                expected: dst_needed,
                actual: dst_bytes,
            });
        }

        let config = launch_config(blocks)?;
        let func = self.functions[format.index()].clone();
        let src_ptr = *source.device_ptr();
        let dst_ptr = *output.device_ptr_mut();

        tracing::trace!(format = %format, blocks, "dispatching dequantization");

        // SAFETY: the kernel reads `blocks * block_bytes` bytes from `src_ptr`
        // and writes `blocks * block_len` f32 values to `dst_ptr`; both
        // extents were checked above. The mutable borrow of `output` keeps
        // other host-side views from aliasing the destination.
        unsafe { func.launch_on_stream(stream, config, (src_ptr, dst_ptr)) }
            .check("cuLaunchKernel")?;

        Ok(blocks)
    }
}

impl std::fmt::Debug for DequantKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DequantKernels")
            .field("device", &self.device.ordinal())
            .field("module", &MODULE_NAME)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_points_present() {
        let source = kernel_source();
        for format in BlockFormat::ALL {
            let signature = format!(
                "extern \"C\" __global__ void {}(const uint8_t * src, float * dst)",
                kernel_name(format)
            );
            assert!(source.contains(&signature), "missing {}", kernel_name(format));
        }
        assert_eq!(source.matches("__global__").count(), BlockFormat::ALL.len());
    }

    #[test]
    fn test_entry_point_parameters() {
        let source = kernel_source();
        assert!(source.contains("dequantize_block(src, dst, 32, 4, 1, 1, RECON_SYMMETRIC, 8);"));
        assert!(source.contains("dequantize_block(src, dst, 32, 4, 2, 1, RECON_EXPLICIT, 0);"));
        assert!(source.contains("dequantize_block(src, dst, 16, 2, 1, 1, RECON_SYMMETRIC, 8);"));
        assert!(source.contains("dequantize_block(src, dst, 16, 2, 2, 1, RECON_EXPLICIT, 0);"));
        assert!(source.contains("dequantize_block(src, dst, 32, 4, 1, 0, RECON_SCALE, 0);"));
    }

    #[test]
    fn test_kernel_avoids_fused_multiply_add() {
        let source = kernel_source();
        assert!(source.contains("__fadd_rn(__fmul_rn("));
        assert!(!source.contains("fmaf"));
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(kernel_name(BlockFormat::Q4_0), "dequantize_block_q4_0");
        assert_eq!(kernel_name(BlockFormat::Q8_0), "dequantize_block_q8_0");
        for format in BlockFormat::ALL {
            assert!(kernel_name(format).ends_with(format.name()));
        }
    }

    #[test]
    fn test_launch_config_one_thread_per_block() {
        let config = launch_config(128).unwrap();
        assert_eq!(config.grid_dim, (128, 1, 1));
        assert_eq!(config.block_dim, (1, 1, 1));
        assert_eq!(config.shared_mem_bytes, 0);
    }
}
