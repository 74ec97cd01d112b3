//! Host-side block dequantization.
//!
//! One parameterized routine, [`unpack`], decodes any format given its
//! [`BlockLayout`]. Rows are decoded block by block; each block writes a
//! disjoint `block_len` chunk of the output, so [`decode_row_par`] can hand
//! blocks to rayon in any order and still produce the same bits as
//! [`decode_row`].
//!
//! A row of `row_length` elements holds `row_length / block_len` blocks.
//! If `row_length` is not a multiple of `block_len`, the trailing elements
//! are never written and keep whatever the caller left there.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::format::{BlockFormat, BlockLayout, CodeWidth};

/// Number of whole blocks in a row of `row_length` elements.
#[inline]
pub fn block_count(format: BlockFormat, row_length: usize) -> usize {
    row_length / format.block_len()
}

/// Bytes of quantized data backing a row of `row_length` elements.
#[inline]
pub fn row_bytes(format: BlockFormat, row_length: usize) -> usize {
    block_count(format, row_length) * format.block_bytes()
}

/// Decode one block. `block` and `out` must be exactly one block long.
#[inline]
pub(crate) fn unpack(layout: &BlockLayout, block: &[u8], out: &mut [f32]) {
    let recon = layout.reconstruction;
    let d = layout.scalar.read(block, 0);
    let m = if recon.header_fields() == 2 {
        layout.scalar.read(block, layout.scalar.bytes())
    } else {
        0.0
    };
    let codes = &block[layout.header_bytes()..layout.block_bytes()];

    match layout.codes {
        CodeWidth::Nibble => {
            for (pair, &byte) in out.chunks_exact_mut(2).zip(codes) {
                pair[0] = recon.apply(i32::from(byte & 0x0f), d, m);
                pair[1] = recon.apply(i32::from(byte >> 4), d, m);
            }
        }
        CodeWidth::Int8 => {
            for (value, &byte) in out.iter_mut().zip(codes) {
                *value = recon.apply(i32::from(byte as i8), d, m);
            }
        }
    }
}

/// Decode block `block_index` of `source` into its slot of `out`.
///
/// `out` is the whole row; the block lands at `block_index * block_len`.
pub fn decode_block(
    format: BlockFormat,
    source: &[u8],
    block_index: usize,
    out: &mut [f32],
) -> Result<()> {
    let layout = format.layout();
    let through = block_index.checked_add(1);
    let src_end = through
        .and_then(|n| n.checked_mul(layout.block_bytes()))
        .ok_or_else(|| Error::buffer_too_small(usize::MAX, source.len()))?;
    let out_end = through
        .and_then(|n| n.checked_mul(layout.block_len))
        .ok_or_else(|| Error::buffer_too_small(usize::MAX, core::mem::size_of_val(out)))?;
    if source.len() < src_end {
        return Err(Error::buffer_too_small(src_end, source.len()));
    }
    if out.len() < out_end {
        return Err(Error::buffer_too_small(
            out_end.saturating_mul(core::mem::size_of::<f32>()),
            core::mem::size_of_val(out),
        ));
    }

    unpack(
        &layout,
        &source[src_end - layout.block_bytes()..src_end],
        &mut out[out_end - layout.block_len..out_end],
    );
    Ok(())
}

/// Decode a single block's bytes into `out[..block_len]`.
pub fn decode_block_into(format: BlockFormat, block: &[u8], out: &mut [f32]) -> Result<()> {
    decode_block(format, block, 0, out)
}

/// Validate buffer sizes for a row and return its block count.
fn check_row(
    format: BlockFormat,
    source: &[u8],
    out: &[f32],
    row_length: usize,
) -> Result<usize> {
    let blocks = block_count(format, row_length);
    let needed = blocks * format.block_bytes();
    if source.len() < needed {
        return Err(Error::buffer_too_small(needed, source.len()));
    }
    let decoded = blocks * format.block_len();
    if out.len() < decoded {
        return Err(Error::buffer_too_small(
            decoded * core::mem::size_of::<f32>(),
            core::mem::size_of_val(out),
        ));
    }
    Ok(blocks)
}

/// Decode a row sequentially.
///
/// Returns the number of blocks decoded.
pub fn decode_row(
    format: BlockFormat,
    source: &[u8],
    out: &mut [f32],
    row_length: usize,
) -> Result<usize> {
    let blocks = check_row(format, source, out, row_length)?;
    let layout = format.layout();

    let src = &source[..blocks * layout.block_bytes()];
    let dst = &mut out[..blocks * layout.block_len];
    for (block, chunk) in src
        .chunks_exact(layout.block_bytes())
        .zip(dst.chunks_exact_mut(layout.block_len))
    {
        unpack(&layout, block, chunk);
    }

    tracing::trace!(format = %format, blocks, "decoded row on host");
    Ok(blocks)
}

/// Decode a row with one rayon task per block.
///
/// Output is identical to [`decode_row`]. Returns the number of blocks
/// decoded.
pub fn decode_row_par(
    format: BlockFormat,
    source: &[u8],
    out: &mut [f32],
    row_length: usize,
) -> Result<usize> {
    let blocks = check_row(format, source, out, row_length)?;
    let layout = format.layout();

    let src = &source[..blocks * layout.block_bytes()];
    let dst = &mut out[..blocks * layout.block_len];
    dst.par_chunks_exact_mut(layout.block_len)
        .zip(src.par_chunks_exact(layout.block_bytes()))
        .for_each(|(chunk, block)| unpack(&layout, block, chunk));

    tracing::trace!(format = %format, blocks, "decoded row on host (parallel)");
    Ok(blocks)
}

/// Decode a row into a freshly allocated vector of
/// `block_count * block_len` values.
pub fn dequantize_row(format: BlockFormat, source: &[u8], row_length: usize) -> Result<Vec<f32>> {
    let mut out = vec![0.0; block_count(format, row_length) * format.block_len()];
    decode_row_par(format, source, &mut out, row_length)?;
    Ok(out)
}
