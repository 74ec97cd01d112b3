//! Benchmarks for host row decoding.
//!
//! Run with: `cargo bench -p blockq-core`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use blockq_core::{decode_row, decode_row_par, row_bytes, BlockFormat};

/// Row lengths typical of transformer hidden and FFN dimensions.
const ROW_LENGTHS: [usize; 3] = [4096, 11008, 65536];

/// Generate a row of plausible blocks: small finite scales, random codes.
fn generate_row(format: BlockFormat, row_length: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(42);
    let layout = format.layout();
    let mut data = vec![0u8; row_bytes(format, row_length)];
    rng.fill(&mut data[..]);

    for block in data.chunks_exact_mut(layout.block_bytes()) {
        let fields = layout.reconstruction.header_fields();
        for field in 0..fields {
            let value: f32 = rng.gen_range(-0.1..0.1);
            let offset = field * layout.scalar.bytes();
            match layout.scalar.bytes() {
                2 => block[offset..offset + 2]
                    .copy_from_slice(&half::f16::from_f32(value).to_le_bytes()),
                _ => block[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
            }
        }
    }
    data
}

fn bench_decode(c: &mut Criterion) {
    for format in BlockFormat::ALL {
        let mut group = c.benchmark_group(format!("decode_{format}"));

        for row_length in ROW_LENGTHS {
            let source = generate_row(format, row_length);
            let mut out = vec![0.0f32; row_length];
            group.throughput(Throughput::Elements(row_length as u64));

            group.bench_with_input(
                BenchmarkId::new("sequential", row_length),
                &source,
                |b, source| {
                    b.iter(|| decode_row(format, black_box(source), &mut out, row_length))
                },
            );

            group.bench_with_input(
                BenchmarkId::new("parallel", row_length),
                &source,
                |b, source| {
                    b.iter(|| decode_row_par(format, black_box(source), &mut out, row_length))
                },
            );
        }

        group.finish();
    }
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
