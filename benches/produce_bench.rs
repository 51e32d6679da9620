//! Criterion micro-benchmarks for the produce path.
//!
//! - Record batch encoding and decoding
//! - Base offset patching
//! - Key partitioning
//!
//! Run with: `cargo bench --bench produce_bench`

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use kafkaesque_client::producer::{DefaultPartitioner, Partitioner};
use kafkaesque_client::protocol::{OutgoingRecord, RecordBatch, crc32c, patch_base_offset};

fn records(count: usize, value_size: usize) -> Vec<OutgoingRecord> {
    (0..count)
        .map(|i| OutgoingRecord {
            timestamp: 1_700_000_000_000 + i as i64,
            key: Some(Bytes::from(format!("key-{}", i))),
            value: Some(Bytes::from(vec![b'x'; value_size])),
            headers: Vec::new(),
        })
        .collect()
}

/// Benchmark batch encoding for common batch shapes.
fn bench_batch_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_encode");

    for (count, value_size) in [(1, 100), (100, 100), (1_000, 100), (100, 10_000)] {
        let input = records(count, value_size);
        group.throughput(Throughput::Bytes((count * value_size) as u64));
        group.bench_with_input(
            BenchmarkId::new("records", format!("{}x{}", count, value_size)),
            &input,
            |b, input| {
                b.iter(|| RecordBatch::from_records(black_box(input)).encode());
            },
        );
    }

    group.finish();
}

/// Benchmark decoding a fetched batch.
fn bench_batch_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_decode");

    for count in [1, 100, 1_000] {
        let encoded = RecordBatch::from_records(&records(count, 100)).encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("records", count), &encoded, |b, encoded| {
            b.iter(|| RecordBatch::decode(black_box(encoded.clone())));
        });
    }

    group.finish();
}

/// Benchmark base offset patching and the checksum it leaves valid.
fn bench_offset_patch(c: &mut Criterion) {
    let encoded = RecordBatch::from_records(&records(100, 100)).encode();
    let mut buffer = encoded.to_vec();

    c.bench_function("patch_base_offset", |b| {
        b.iter(|| patch_base_offset(black_box(&mut buffer), black_box(12345)));
    });

    let mut group = c.benchmark_group("crc32c");
    for size in [100, 10_000, 1_000_000] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| crc32c(black_box(data)));
        });
    }
    group.finish();
}

/// Benchmark murmur2 key partitioning.
fn bench_partitioner(c: &mut Criterion) {
    let partitioner = DefaultPartitioner::default();
    let keys: Vec<String> = (0..1_000).map(|i| format!("user-{}", i)).collect();

    c.bench_function("partition_keyed", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(partitioner.partition("events", Some(key.as_bytes()), 64));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_batch_encode,
    bench_batch_decode,
    bench_offset_patch,
    bench_partitioner,
);
criterion_main!(benches);
