//! Codec benchmarks.
//!
//! Measures:
//! - Morton encode/decode throughput
//! - Cuboid compression and decompression per element type and method

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array4;
use spatialdb::{morton, CompressionMethod, CompressionSettings, CuboidData};
use std::hint::black_box;

/// A 128x128x16 label cuboid with blob-like runs, the shape of typical annotation data
fn label_cuboid() -> CuboidData {
    CuboidData::U32(Array4::from_shape_fn((1, 16, 128, 128), |(_, z, y, x)| {
        (((x / 16) + (y / 16) * 8 + z / 4) % 7) as u32 * 1000
    }))
}

fn image_cuboid() -> CuboidData {
    CuboidData::U8(Array4::from_shape_fn((1, 16, 128, 128), |(_, z, y, x)| {
        ((x * 7 + y * 13 + z * 31) % 251) as u8
    }))
}

fn bench_morton(c: &mut Criterion) {
    let coords: Vec<[u64; 3]> = (0..4096u64)
        .map(|i| [i % 97, (i * 7) % 113, (i * 13) % 53])
        .collect();
    let addresses: Vec<u64> = coords
        .iter()
        .map(|&c| morton::encode(c).unwrap())
        .collect();

    let mut group = c.benchmark_group("morton");
    group.throughput(Throughput::Elements(coords.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| {
            for &c in &coords {
                black_box(morton::encode(black_box(c)).unwrap());
            }
        })
    });
    group.bench_function("decode", |b| {
        b.iter(|| {
            for &a in &addresses {
                black_box(morton::morton_to_xyz(black_box(a)).unwrap());
            }
        })
    });
    group.finish();
}

fn bench_cuboid_codec(c: &mut Criterion) {
    let methods = [
        ("zstd", CompressionSettings::new(CompressionMethod::Zstd, 3)),
        ("deflate", CompressionSettings::new(CompressionMethod::Deflate, 6)),
        ("none", CompressionSettings::new(CompressionMethod::None, 0)),
    ];
    let payloads = [("u32_labels", label_cuboid()), ("u8_image", image_cuboid())];

    let mut group = c.benchmark_group("cuboid_codec");
    for (payload_name, data) in &payloads {
        let bytes = (data.len() * data.data_type().size_in_bytes()) as u64;
        group.throughput(Throughput::Bytes(bytes));
        for (method_name, settings) in &methods {
            let id = format!("{}/{}", payload_name, method_name);
            group.bench_with_input(BenchmarkId::new("compress", &id), data, |b, data| {
                b.iter(|| black_box(data.to_compressed(settings).unwrap()))
            });

            let blob = data.to_compressed(settings).unwrap();
            group.bench_with_input(BenchmarkId::new("decompress", &id), &blob, |b, blob| {
                b.iter(|| black_box(CuboidData::from_compressed(blob).unwrap()))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_morton, bench_cuboid_codec);
criterion_main!(benches);
