#![cfg(not(target_arch = "wasm32"))]
//! Criterion benchmarks for decoding performance.
//!
//! Fixtures are read from the directory named by `WEBP_TESTDATA`; missing
//! files are skipped.
//!
//! Run with: WEBP_TESTDATA=path/to/testdata cargo bench --bench decode_benchmark

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::path::PathBuf;

const TEST_IMAGES: &[(&str, &str)] = &[
    ("no_filter", "blue-purple-pink-large.no-filter.lossy.webp"),
    ("simple_filter", "blue-purple-pink-large.simple-filter.lossy.webp"),
    ("normal_filter", "blue-purple-pink-large.normal-filter.lossy.webp"),
    ("lossless", "blue-purple-pink-large.lossless.webp"),
];

fn load(file: &str) -> Option<Vec<u8>> {
    let dir = std::env::var_os("WEBP_TESTDATA")?;
    std::fs::read(PathBuf::from(dir).join(file)).ok()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for &(name, file) in TEST_IMAGES {
        let Some(data) = load(file) else {
            eprintln!("Skipping {name}: {file} not found");
            continue;
        };
        let Ok(info) = zenwebp_decode::ImageInfo::from_webp(&data) else {
            eprintln!("Skipping {name}: not a WebP file");
            continue;
        };

        group.throughput(Throughput::Elements(
            u64::from(info.width) * u64::from(info.height),
        ));
        group.bench_with_input(BenchmarkId::new("decode", name), &data, |b, data| {
            b.iter(|| {
                let result = zenwebp_decode::decode(black_box(data)).unwrap();
                black_box(result)
            })
        });
        group.bench_with_input(BenchmarkId::new("info", name), &data, |b, data| {
            b.iter(|| {
                let info = zenwebp_decode::ImageInfo::from_webp(black_box(data)).unwrap();
                black_box(info)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
