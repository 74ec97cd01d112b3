//! # blockq core
//!
//! Quantized weight blocks, their host decoder and the buffer pool that
//! backs device-side decoding.
//!
//! A quantized row is a run of fixed-size blocks. Each block stores one or
//! two header scalars followed by packed integer codes:
//!
//! | Format | Elements | Header            | Codes      | Bytes |
//! |--------|----------|-------------------|------------|-------|
//! | Q4_0   | 32       | f32 `d`           | 32 nibbles | 20    |
//! | Q4_1   | 32       | f32 `d`, f32 `m`  | 32 nibbles | 24    |
//! | Q4_2   | 16       | f16 `d`           | 16 nibbles | 10    |
//! | Q4_3   | 16       | f16 `d`, f16 `m`  | 16 nibbles | 12    |
//! | Q8_0   | 32       | f32 `d`           | 32 x i8    | 36    |
//!
//! ## Modules
//!
//! - [`format`] - layout descriptors and the [`BlockFormat`] enum
//! - [`block`] - typed `#[repr(C)]` blocks for zero-copy views
//! - [`codec`] - host decoding of blocks and rows
//! - [`pool`] - first-fit device buffer cache over a [`DeviceAllocator`]
//!
//! ## Example
//!
//! ```
//! use blockq_core::{codec, BlockFormat, BlockQ4_1};
//!
//! let block = BlockQ4_1::new(1.5, 0.5, &[4; 32]);
//! let row = codec::dequantize_row(BlockFormat::Q4_1, bytemuck::bytes_of(&block), 32)?;
//! assert!(row.iter().all(|&v| v == 6.5));
//! # Ok::<(), blockq_core::Error>(())
//! ```

pub mod block;
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod pool;
pub mod sync;
pub mod traits;

pub use block::{BlockQ4_0, BlockQ4_1, BlockQ4_2, BlockQ4_3, BlockQ8_0, QuantBlock};
#[cfg(target_endian = "little")]
pub use block::{as_blocks, to_bytes};
pub use codec::{
    block_count, decode_block, decode_block_into, decode_row, decode_row_par, dequantize_row,
    row_bytes,
};
pub use config::{PoolConfig, DEFAULT_POOL_CAPACITY};
pub use error::{Error, Result};
pub use format::{
    BlockFormat, BlockLayout, CodeWidth, Reconstruction, ScalarWidth, QK4_0, QK4_1, QK4_2, QK4_3,
    QK8_0,
};
pub use pool::{BufferPool, PoolStats, PooledBuffer};
pub use sync::{SpinLock, SpinLockGuard};
pub use traits::DeviceAllocator;
