//! Benchmarks for the hot data paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use datahub_rs::align::AlignmentBuffer;
use datahub_rs::compression::{compress_lz4, BuiltinDecompressor, Decompressor};
use datahub_rs::protocol::{decode_channel_stream, encode_batch, FrameReader, RecordBatch};
use datahub_rs::scripting::RecordFilter;
use datahub_rs::source::CancelToken;
use datahub_rs::types::{Compression, DataType, Value};
use std::collections::BTreeMap;

/// `frames` frames of `per_frame` f64 samples each
fn stream(frames: usize, per_frame: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut id = 0i64;
    for f in 0..frames {
        let mut batch = RecordBatch {
            scalar_type: Some("f64".into()),
            range_final: f + 1 == frames,
            ..Default::default()
        };
        for _ in 0..per_frame {
            batch.timestamps.push(id * 1_000_000);
            batch.ids.push(id);
            batch.values.push(Value::Float((id as f64).sin()));
            id += 1;
        }
        bytes.extend(encode_batch(&batch).unwrap());
    }
    bytes
}

fn bench_frame_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decoding");

    for per_frame in [1, 100, 1000].iter() {
        let bytes = stream(100, *per_frame);
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("raw_payloads", per_frame), &bytes, |b, bytes| {
            b.iter(|| {
                let mut reader = FrameReader::new(bytes.as_slice());
                let mut count = 0usize;
                while let Some(payload) = reader.next_payload().unwrap() {
                    count += payload.len();
                }
                black_box(count)
            });
        });

        group.bench_with_input(BenchmarkId::new("samples", per_frame), &bytes, |b, bytes| {
            let cancel = CancelToken::new();
            b.iter(|| {
                let mut sum = 0.0;
                decode_channel_stream(bytes.as_slice(), &cancel, |sample| {
                    sum += sample.value.as_f64().unwrap_or(0.0);
                })
                .unwrap();
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("alignment");

    for channels in [2usize, 8, 32].iter() {
        let names: Vec<String> = (0..*channels).map(|i| format!("CH{}", i)).collect();
        let pulses = 1000i64;
        group.throughput(Throughput::Elements(pulses as u64 * *channels as u64));

        group.bench_with_input(BenchmarkId::new("in_order", channels), &names, |b, names| {
            b.iter(|| {
                let mut align = AlignmentBuffer::new(names.iter().cloned());
                let mut rows = 0usize;
                for id in 0..pulses {
                    for name in names {
                        align.add(id, id * 1_000, name, Value::Int(id));
                    }
                    rows += align.process().len();
                }
                black_box(rows)
            });
        });

        // Every channel lags the previous one by a pulse
        group.bench_with_input(BenchmarkId::new("staggered", channels), &names, |b, names| {
            b.iter(|| {
                let mut align = AlignmentBuffer::new(names.iter().cloned()).with_size_buffer(100);
                let mut rows = 0usize;
                for id in 0..pulses {
                    for (lag, name) in names.iter().enumerate() {
                        let delayed = id - lag as i64;
                        if delayed >= 0 {
                            align.add(delayed, delayed * 1_000, name, Value::Int(delayed));
                        }
                    }
                    rows += align.process().len();
                }
                rows += align.flush_all().len();
                black_box(rows)
            });
        });
    }

    group.finish();
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");

    let filter = RecordFilter::compile("A > 0.5 && B < 10").unwrap();
    let mut row = BTreeMap::new();
    row.insert("A".to_string(), Value::Float(0.75));
    row.insert("B".to_string(), Value::Int(3));

    group.bench_function("evaluate", |b| {
        let mut id = 0i64;
        b.iter(|| {
            id += 1;
            black_box(filter.evaluate(id, id * 1_000, &row).unwrap())
        });
    });

    group.finish();
}

fn bench_decompression(c: &mut Criterion) {
    let mut group = c.benchmark_group("decompression");

    for side in [64usize, 256, 1024].iter() {
        let raw: Vec<u8> = (0..side * side)
            .flat_map(|i| ((i % 4096) as u16).to_le_bytes())
            .collect();
        let blob = compress_lz4(&raw);
        let shape = [*side, *side];
        group.throughput(Throughput::Bytes(raw.len() as u64));

        group.bench_with_input(BenchmarkId::new("lz4_u16", side), &blob, |b, blob| {
            b.iter(|| {
                black_box(
                    BuiltinDecompressor
                        .decompress(blob, DataType::U16, &shape, &Compression::Lz4)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_decoding,
    bench_alignment,
    bench_filter,
    bench_decompression,
);

criterion_main!(benches);
