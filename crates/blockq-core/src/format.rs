//! Block format descriptors.
//!
//! Every supported format is described by a [`BlockLayout`]: how many
//! elements a block holds, how wide its header scalars are, how codes are
//! packed and how a code is turned back into a value. The host codec and the
//! device kernels are both generated from these descriptors.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Elements per Q4_0 block.
pub const QK4_0: usize = 32;
/// Elements per Q4_1 block.
pub const QK4_1: usize = 32;
/// Elements per Q4_2 block.
pub const QK4_2: usize = 16;
/// Elements per Q4_3 block.
pub const QK4_3: usize = 16;
/// Elements per Q8_0 block.
pub const QK8_0: usize = 32;

/// Quantized block formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockFormat {
    /// 32 nibbles, f32 scale, symmetric offset of 8.
    #[serde(rename = "q4_0")]
    Q4_0,
    /// 32 nibbles, f32 scale and f32 offset.
    #[serde(rename = "q4_1")]
    Q4_1,
    /// 16 nibbles, f16 scale, symmetric offset of 8.
    #[serde(rename = "q4_2")]
    Q4_2,
    /// 16 nibbles, f16 scale and f16 offset.
    #[serde(rename = "q4_3")]
    Q4_3,
    /// 32 signed bytes, f32 scale.
    #[serde(rename = "q8_0")]
    Q8_0,
}

impl BlockFormat {
    /// All formats in wire-table order.
    pub const ALL: [BlockFormat; 5] = [
        BlockFormat::Q4_0,
        BlockFormat::Q4_1,
        BlockFormat::Q4_2,
        BlockFormat::Q4_3,
        BlockFormat::Q8_0,
    ];

    /// Get the layout descriptor for this format.
    pub const fn layout(self) -> BlockLayout {
        match self {
            BlockFormat::Q4_0 => BlockLayout {
                block_len: QK4_0,
                scalar: ScalarWidth::F32,
                codes: CodeWidth::Nibble,
                reconstruction: Reconstruction::SymmetricOffset(8),
            },
            BlockFormat::Q4_1 => BlockLayout {
                block_len: QK4_1,
                scalar: ScalarWidth::F32,
                codes: CodeWidth::Nibble,
                reconstruction: Reconstruction::ExplicitOffset,
            },
            BlockFormat::Q4_2 => BlockLayout {
                block_len: QK4_2,
                scalar: ScalarWidth::F16,
                codes: CodeWidth::Nibble,
                reconstruction: Reconstruction::SymmetricOffset(8),
            },
            BlockFormat::Q4_3 => BlockLayout {
                block_len: QK4_3,
                scalar: ScalarWidth::F16,
                codes: CodeWidth::Nibble,
                reconstruction: Reconstruction::ExplicitOffset,
            },
            BlockFormat::Q8_0 => BlockLayout {
                block_len: QK8_0,
                scalar: ScalarWidth::F32,
                codes: CodeWidth::Int8,
                reconstruction: Reconstruction::ScaleOnly,
            },
        }
    }

    /// Elements decoded from one block.
    pub const fn block_len(self) -> usize {
        self.layout().block_len
    }

    /// Bytes occupied by one block.
    pub const fn block_bytes(self) -> usize {
        self.layout().block_bytes()
    }

    /// Position of this format in [`BlockFormat::ALL`].
    pub const fn index(self) -> usize {
        match self {
            BlockFormat::Q4_0 => 0,
            BlockFormat::Q4_1 => 1,
            BlockFormat::Q4_2 => 2,
            BlockFormat::Q4_3 => 3,
            BlockFormat::Q8_0 => 4,
        }
    }

    /// Get format name as string.
    pub const fn name(self) -> &'static str {
        match self {
            BlockFormat::Q4_0 => "q4_0",
            BlockFormat::Q4_1 => "q4_1",
            BlockFormat::Q4_2 => "q4_2",
            BlockFormat::Q4_3 => "q4_3",
            BlockFormat::Q8_0 => "q8_0",
        }
    }
}

impl fmt::Display for BlockFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BlockFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockFormat::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownFormat(s.to_string()))
    }
}

/// Width of the floating-point header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarWidth {
    /// IEEE-754 binary16, promoted to f32 before use.
    F16,
    /// IEEE-754 binary32.
    F32,
}

impl ScalarWidth {
    /// Bytes per header scalar.
    pub const fn bytes(self) -> usize {
        match self {
            ScalarWidth::F16 => 2,
            ScalarWidth::F32 => 4,
        }
    }

    /// Read a little-endian scalar at `offset` and promote it to f32.
    #[inline]
    pub(crate) fn read(self, block: &[u8], offset: usize) -> f32 {
        match self {
            ScalarWidth::F16 => {
                half::f16::from_le_bytes([block[offset], block[offset + 1]]).to_f32()
            }
            ScalarWidth::F32 => f32::from_le_bytes([
                block[offset],
                block[offset + 1],
                block[offset + 2],
                block[offset + 3],
            ]),
        }
    }
}

/// Packing of element codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeWidth {
    /// Two unsigned 4-bit codes per byte, low nibble first.
    Nibble,
    /// One signed 8-bit code per byte.
    Int8,
}

/// Rule turning a code back into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reconstruction {
    /// `(code - offset) * d`
    SymmetricOffset(u8),
    /// `code * d + m`, with `m` stored after `d`.
    ExplicitOffset,
    /// `code * d`
    ScaleOnly,
}

impl Reconstruction {
    /// Number of header scalars the rule reads.
    pub const fn header_fields(self) -> usize {
        match self {
            Reconstruction::ExplicitOffset => 2,
            Reconstruction::SymmetricOffset(_) | Reconstruction::ScaleOnly => 1,
        }
    }

    /// Reconstruct one value in single precision.
    ///
    /// Multiplication and addition are rounded separately; the device
    /// kernels use `__fmul_rn`/`__fadd_rn` so they agree bit for bit.
    #[inline]
    pub fn apply(self, code: i32, d: f32, m: f32) -> f32 {
        match self {
            Reconstruction::SymmetricOffset(offset) => (code - i32::from(offset)) as f32 * d,
            Reconstruction::ExplicitOffset => code as f32 * d + m,
            Reconstruction::ScaleOnly => code as f32 * d,
        }
    }
}

/// Structural description of one block format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLayout {
    /// Elements per block (16 or 32).
    pub block_len: usize,
    /// Header scalar width.
    pub scalar: ScalarWidth,
    /// Code packing.
    pub codes: CodeWidth,
    /// Value reconstruction rule.
    pub reconstruction: Reconstruction,
}

impl BlockLayout {
    /// Bytes of header fields (scale, and offset if present).
    pub const fn header_bytes(&self) -> usize {
        self.reconstruction.header_fields() * self.scalar.bytes()
    }

    /// Bytes of packed codes.
    pub const fn code_bytes(&self) -> usize {
        match self.codes {
            CodeWidth::Nibble => self.block_len / 2,
            CodeWidth::Int8 => self.block_len,
        }
    }

    /// Total block size; there is never any padding.
    pub const fn block_bytes(&self) -> usize {
        self.header_bytes() + self.code_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sizes_match_wire_table() {
        assert_eq!(BlockFormat::Q4_0.block_bytes(), 20);
        assert_eq!(BlockFormat::Q4_1.block_bytes(), 24);
        assert_eq!(BlockFormat::Q4_2.block_bytes(), 10);
        assert_eq!(BlockFormat::Q4_3.block_bytes(), 12);
        assert_eq!(BlockFormat::Q8_0.block_bytes(), 36);
    }

    #[test]
    fn test_header_plus_codes_is_block_size() {
        for format in BlockFormat::ALL {
            let layout = format.layout();
            assert_eq!(
                layout.header_bytes() + layout.code_bytes(),
                layout.block_bytes(),
                "{format}"
            );
        }
    }

    #[test]
    fn test_index_matches_all_order() {
        for (i, format) in BlockFormat::ALL.into_iter().enumerate() {
            assert_eq!(format.index(), i);
        }
    }

    #[test]
    fn test_name_roundtrip() {
        for format in BlockFormat::ALL {
            assert_eq!(format.name().parse::<BlockFormat>().unwrap(), format);
        }
        assert_eq!("Q8_0".parse::<BlockFormat>().unwrap(), BlockFormat::Q8_0);
        assert!(matches!(
            "q5_0".parse::<BlockFormat>(),
            Err(Error::UnknownFormat(name)) if name == "q5_0"
        ));
    }

    #[test]
    fn test_serde_uses_format_name() {
        let json = serde_json::to_string(&BlockFormat::Q4_3).unwrap();
        assert_eq!(json, "\"q4_3\"");
        let parsed: BlockFormat = serde_json::from_str("\"q4_0\"").unwrap();
        assert_eq!(parsed, BlockFormat::Q4_0);
    }

    #[test]
    fn test_reconstruction_rules() {
        assert_eq!(Reconstruction::SymmetricOffset(8).apply(0, 2.0, 0.0), -16.0);
        assert_eq!(Reconstruction::SymmetricOffset(8).apply(15, 2.0, 0.0), 14.0);
        assert_eq!(Reconstruction::ExplicitOffset.apply(4, 1.5, 0.5), 6.5);
        assert_eq!(Reconstruction::ScaleOnly.apply(-100, 0.5, 0.0), -50.0);
    }

    #[test]
    fn test_f16_scalar_promotion() {
        let bytes = half::f16::from_f32(-0.75).to_le_bytes();
        assert_eq!(ScalarWidth::F16.read(&bytes, 0), -0.75);
    }
}
