//! Typed block structs matching the wire layout exactly.
//!
//! The structs are `#[repr(C)]` and derive [`Pod`], which refuses to compile
//! if the compiler inserts padding. The `const` assertions below pin each
//! size to the wire table as well, since downstream readers index raw bytes
//! by `block_index * block_bytes`.
//!
//! Struct fields are host-endian. Model files are little-endian, which is
//! what every CUDA host is, so [`as_blocks`] views are only offered on
//! little-endian targets; the byte-level codec in [`crate::codec`] works
//! everywhere.

use bytemuck::{Pod, Zeroable};
use half::f16;

use crate::codec;
use crate::format::{BlockFormat, QK4_0, QK4_1, QK4_2, QK4_3, QK8_0};

/// Q4_0: f32 scale + 32 nibbles, 20 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlockQ4_0 {
    /// Scale.
    pub d: f32,
    /// Packed nibbles, low nibble first.
    pub qs: [u8; QK4_0 / 2],
}

/// Q4_1: f32 scale + f32 offset + 32 nibbles, 24 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlockQ4_1 {
    /// Scale.
    pub d: f32,
    /// Offset (block minimum).
    pub m: f32,
    /// Packed nibbles, low nibble first.
    pub qs: [u8; QK4_1 / 2],
}

/// Q4_2: f16 scale + 16 nibbles, 10 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlockQ4_2 {
    /// Scale.
    pub d: f16,
    /// Packed nibbles, low nibble first.
    pub qs: [u8; QK4_2 / 2],
}

/// Q4_3: f16 scale + f16 offset + 16 nibbles, 12 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlockQ4_3 {
    /// Scale.
    pub d: f16,
    /// Offset (block minimum).
    pub m: f16,
    /// Packed nibbles, low nibble first.
    pub qs: [u8; QK4_3 / 2],
}

/// Q8_0: f32 scale + 32 signed bytes, 36 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlockQ8_0 {
    /// Scale.
    pub d: f32,
    /// Signed codes.
    pub qs: [i8; QK8_0],
}

const _: () = {
    assert!(core::mem::size_of::<BlockQ4_0>() == core::mem::size_of::<f32>() + QK4_0 / 2);
    assert!(core::mem::size_of::<BlockQ4_1>() == 2 * core::mem::size_of::<f32>() + QK4_1 / 2);
    assert!(core::mem::size_of::<BlockQ4_2>() == core::mem::size_of::<f16>() + QK4_2 / 2);
    assert!(core::mem::size_of::<BlockQ4_3>() == 2 * core::mem::size_of::<f16>() + QK4_3 / 2);
    assert!(core::mem::size_of::<BlockQ8_0>() == core::mem::size_of::<f32>() + QK8_0);

    assert!(core::mem::size_of::<BlockQ4_0>() == BlockFormat::Q4_0.block_bytes());
    assert!(core::mem::size_of::<BlockQ4_1>() == BlockFormat::Q4_1.block_bytes());
    assert!(core::mem::size_of::<BlockQ4_2>() == BlockFormat::Q4_2.block_bytes());
    assert!(core::mem::size_of::<BlockQ4_3>() == BlockFormat::Q4_3.block_bytes());
    assert!(core::mem::size_of::<BlockQ8_0>() == BlockFormat::Q8_0.block_bytes());
};

/// A typed block of one of the supported formats.
pub trait QuantBlock: Pod {
    /// Format this struct encodes.
    const FORMAT: BlockFormat;

    /// Decode this block into `out[..block_len]`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than the block length.
    fn dequantize_into(&self, out: &mut [f32]) {
        let len = Self::FORMAT.block_len();
        codec::unpack(&Self::FORMAT.layout(), bytemuck::bytes_of(self), &mut out[..len]);
    }

    /// Decode this block into a fresh vector.
    fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.0; Self::FORMAT.block_len()];
        self.dequantize_into(&mut out);
        out
    }
}

impl QuantBlock for BlockQ4_0 {
    const FORMAT: BlockFormat = BlockFormat::Q4_0;
}

impl QuantBlock for BlockQ4_1 {
    const FORMAT: BlockFormat = BlockFormat::Q4_1;
}

impl QuantBlock for BlockQ4_2 {
    const FORMAT: BlockFormat = BlockFormat::Q4_2;
}

impl QuantBlock for BlockQ4_3 {
    const FORMAT: BlockFormat = BlockFormat::Q4_3;
}

impl QuantBlock for BlockQ8_0 {
    const FORMAT: BlockFormat = BlockFormat::Q8_0;
}

/// Pack 4-bit codes two per byte, low nibble first. Bits above the low
/// nibble of each code are dropped.
fn pack_nibbles<const N: usize>(codes: &[u8]) -> [u8; N] {
    let mut qs = [0u8; N];
    for (byte, pair) in qs.iter_mut().zip(codes.chunks_exact(2)) {
        *byte = (pair[0] & 0x0f) | ((pair[1] & 0x0f) << 4);
    }
    qs
}

/// Unpack two-per-byte nibbles back into one code per element.
fn unpack_nibbles<const N: usize>(qs: &[u8]) -> [u8; N] {
    let mut codes = [0u8; N];
    for (pair, &byte) in codes.chunks_exact_mut(2).zip(qs) {
        pair[0] = byte & 0x0f;
        pair[1] = byte >> 4;
    }
    codes
}

impl BlockQ4_0 {
    /// Build a block from a scale and 32 unsigned 4-bit codes.
    pub fn new(d: f32, codes: &[u8; QK4_0]) -> Self {
        Self {
            d,
            qs: pack_nibbles(codes),
        }
    }

    /// Unpacked 4-bit codes.
    pub fn codes(&self) -> [u8; QK4_0] {
        unpack_nibbles(&self.qs)
    }
}

impl BlockQ4_1 {
    /// Build a block from scale, offset and 32 unsigned 4-bit codes.
    pub fn new(d: f32, m: f32, codes: &[u8; QK4_1]) -> Self {
        Self {
            d,
            m,
            qs: pack_nibbles(codes),
        }
    }

    /// Unpacked 4-bit codes.
    pub fn codes(&self) -> [u8; QK4_1] {
        unpack_nibbles(&self.qs)
    }
}

impl BlockQ4_2 {
    /// Build a block from a half-precision scale and 16 unsigned 4-bit codes.
    pub fn new(d: f16, codes: &[u8; QK4_2]) -> Self {
        Self {
            d,
            qs: pack_nibbles(codes),
        }
    }

    /// Unpacked 4-bit codes.
    pub fn codes(&self) -> [u8; QK4_2] {
        unpack_nibbles(&self.qs)
    }
}

impl BlockQ4_3 {
    /// Build a block from half-precision scale and offset and 16 unsigned 4-bit codes.
    pub fn new(d: f16, m: f16, codes: &[u8; QK4_3]) -> Self {
        Self {
            d,
            m,
            qs: pack_nibbles(codes),
        }
    }

    /// Unpacked 4-bit codes.
    pub fn codes(&self) -> [u8; QK4_3] {
        unpack_nibbles(&self.qs)
    }
}

impl BlockQ8_0 {
    /// Build a block from a scale and 32 signed codes.
    pub fn new(d: f32, qs: [i8; QK8_0]) -> Self {
        Self { d, qs }
    }
}

/// View a byte slice as typed blocks.
///
/// Returns `None` if the slice is misaligned for `B` or its length is not a
/// whole number of blocks; fall back to [`crate::codec::decode_row`] for
/// such slices.
#[cfg(target_endian = "little")]
pub fn as_blocks<B: QuantBlock>(bytes: &[u8]) -> Option<&[B]> {
    bytemuck::try_cast_slice(bytes).ok()
}

/// Serialize typed blocks to their wire bytes.
#[cfg(target_endian = "little")]
pub fn to_bytes<B: QuantBlock>(blocks: &[B]) -> &[u8] {
    bytemuck::cast_slice(blocks)
}
