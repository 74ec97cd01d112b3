//! Decode a synthetic quantized row on the GPU and check it against the host.
//!
//! Usage:
//! ```bash
//! RUST_LOG=debug cargo run --release -p blockq-cuda --example dequant_row
//! ```

use std::time::Instant;

use blockq_core::{decode_row_par, BlockFormat};
use blockq_cuda::{is_available, ContextConfig, QuantContext};

/// Row length of a typical 7B hidden projection.
const ROW_LENGTH: usize = 4096;

fn synthetic_row(format: BlockFormat, row_length: usize) -> Vec<u8> {
    let layout = format.layout();
    let blocks = row_length / layout.block_len;
    let mut row = vec![0u8; blocks * layout.block_bytes()];

    for (b, block) in row.chunks_exact_mut(layout.block_bytes()).enumerate() {
        let d = 0.01 + (b % 13) as f32 * 0.002;
        let m = -0.05 * (b % 5) as f32;
        let step = layout.scalar.bytes();
        for (field, value) in [d, m]
            .into_iter()
            .take(layout.reconstruction.header_fields())
            .enumerate()
        {
            let at = field * step;
            if step == 2 {
                block[at..at + 2].copy_from_slice(&half::f16::from_f32(value).to_le_bytes());
            } else {
                block[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
        for (i, byte) in block[layout.header_bytes()..].iter_mut().enumerate() {
            *byte = ((i * 37 + b * 11) % 256) as u8;
        }
    }
    row
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("blockq GPU dequantization");
    println!("=========================\n");

    if !is_available() {
        println!("No CUDA device found");
        return Ok(());
    }

    let ctx = QuantContext::new(ContextConfig::default())?;
    println!("{}\n", ctx.summary());

    for format in BlockFormat::ALL {
        let row = synthetic_row(format, ROW_LENGTH);

        let start = Instant::now();
        let mut expected = vec![0.0f32; ROW_LENGTH];
        decode_row_par(format, &row, &mut expected, ROW_LENGTH)?;
        let host_time = start.elapsed();

        let start = Instant::now();
        let actual = ctx.dequantize_row(format, &row, ROW_LENGTH)?;
        let gpu_time = start.elapsed();

        let mismatches = actual
            .iter()
            .zip(&expected)
            .filter(|(a, e)| a.to_bits() != e.to_bits())
            .count();

        println!(
            "{:>5}: {} bytes -> {} values, host {:?}, gpu {:?} (incl. copies), {} mismatches",
            format.name(),
            row.len(),
            actual.len(),
            host_time,
            gpu_time,
            mismatches
        );
    }

    println!("\n{}", ctx.pool().stats());
    Ok(())
}
