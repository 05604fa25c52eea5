//! Benchmarks for Den storage components.
//!
//! Run with: cargo bench --package alopex-den
//!
//! ## Benchmark Categories
//!
//! - **Chunk Compression**: Append/decode performance
//! - **Engine Append**: Write path per strategy and sync mode
//! - **Engine Reads**: Interval and time-point queries over pages

use alopex_den::chunk::Chunk;
use alopex_den::{
    Engine, EngineConfig, Measurement, QueryInterval, QueryTimePoint, Strategy, SyncMode,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Generate typical time series data (regular intervals, slowly varying values).
fn generate_typical_series(id: u64, count: usize) -> Vec<Measurement> {
    let start = 1_000_000_000u64;
    let mut value = 50.0;
    (0..count)
        .map(|i| {
            value += (i as f64 * 0.1).sin() * 0.1;
            Measurement::new(id, start + i as u64 * 1000, value)
        })
        .collect()
}

fn fill_chunks(values: &[Measurement], capacity: usize) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    for m in values {
        match chunks.last_mut() {
            Some(chunk) if chunk.append(m) => {}
            _ => chunks.push(Chunk::create(*m, capacity)),
        }
    }
    chunks
}

fn open_engine(dir: &TempDir, strategy: Strategy, sync_mode: SyncMode) -> Engine {
    Engine::open(
        EngineConfig::new(dir.path())
            .with_strategy(strategy)
            .with_sync_mode(sync_mode),
    )
    .unwrap()
}

// ============================================================================
// Chunk Benchmarks
// ============================================================================

fn bench_chunk_append_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_append");

    for size in [1_000usize, 10_000, 100_000].iter() {
        let values = generate_typical_series(1, *size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &values, |b, values| {
            b.iter(|| fill_chunks(black_box(values), 1024))
        });
    }

    group.finish();
}

fn bench_chunk_decode_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_decode");

    for size in [1_000usize, 10_000, 100_000].iter() {
        let chunks = fill_chunks(&generate_typical_series(1, *size), 1024);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &chunks, |b, chunks| {
            b.iter(|| chunks.iter().map(|c| c.reader().count()).sum::<usize>())
        });
    }

    group.finish();
}

fn bench_compression_ratio(c: &mut Criterion) {
    let values = generate_typical_series(1, 10_000);
    let chunks = fill_chunks(&values, 1024);
    let compressed: usize = chunks.iter().map(|c| c.header().used_bytes as usize).sum();
    let raw = values.len() * Measurement::SIZE;
    println!(
        "Compression ratio: {:.2}:1 ({} chunks)",
        raw as f64 / compressed as f64,
        chunks.len()
    );

    c.bench_function("chunk_roundtrip_10k", |b| {
        b.iter(|| {
            let chunks = fill_chunks(black_box(&values), 1024);
            chunks.iter().map(|c| c.to_vec().len()).sum::<usize>()
        })
    });
}

// ============================================================================
// Engine Write Benchmarks
// ============================================================================

fn bench_engine_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_append");

    let cases = [
        ("wal_buffered", Strategy::Wal, SyncMode::Buffered),
        ("wal_nosync", Strategy::Wal, SyncMode::None),
        ("wal_fdatasync", Strategy::Wal, SyncMode::Fdatasync),
        ("memory", Strategy::Memory, SyncMode::None),
        ("cache", Strategy::Cache, SyncMode::None),
    ];
    for (name, strategy, sync_mode) in cases {
        group.throughput(Throughput::Elements(1000));
        group.bench_function(BenchmarkId::new("1k_points", name), |b| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let engine = open_engine(&temp_dir, strategy, sync_mode);
                    (temp_dir, engine, generate_typical_series(1, 1000))
                },
                |(_temp_dir, engine, values)| {
                    for m in &values {
                        engine.append(m);
                    }
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// ============================================================================
// Engine Read Benchmarks
// ============================================================================

fn bench_engine_reads(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(&temp_dir, Strategy::Wal, SyncMode::None);
    for id in 0..10u64 {
        engine.append_batch(&generate_typical_series(id, 10_000));
    }
    engine.flush().unwrap();

    let mut group = c.benchmark_group("engine_read");

    group.bench_function("interval_one_series_10k", |b| {
        let query = QueryInterval::new(vec![3], 0, 0, u64::MAX);
        b.iter(|| engine.read_interval(black_box(&query)).unwrap().len())
    });

    group.bench_function("interval_all_series_partial", |b| {
        let query = QueryInterval::new(Vec::new(), 0, 1_000_000_000, 1_001_000_000);
        b.iter(|| engine.read_interval(black_box(&query)).unwrap().len())
    });

    group.bench_function("time_point_10_series", |b| {
        let query = QueryTimePoint::new((0..10).collect(), 0, 1_005_000_000);
        b.iter(|| engine.read_time_point(black_box(&query)).unwrap().len())
    });

    group.finish();
}

criterion_group!(
    benches,
    // Chunk compression
    bench_chunk_append_sizes,
    bench_chunk_decode_sizes,
    bench_compression_ratio,
    // Engine
    bench_engine_append,
    bench_engine_reads,
);
criterion_main!(benches);
