//! Criterion benchmarks for the frame codec hot path.
//!
//! Run with:
//!   cargo bench --bench codec

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tlvio::{append_record, probe, split};

/// A stream of `count` records with bodies cycling through sizes that hit
/// all three header forms.
fn synthetic_stream(count: usize) -> Vec<u8> {
    let sizes = [0usize, 3, 9, 40, 255, 256, 4096];
    let mut out = Vec::new();
    for i in 0..count {
        let n = sizes[i % sizes.len()];
        let lit = b'A' + (i % 26) as u8;
        let body = vec![lit; n];
        append_record(&mut out, lit, &[&body]);
    }
    out
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for &body_len in &[4usize, 200, 4096] {
        let body = vec![0x5Au8; body_len];
        group.throughput(Throughput::Bytes(body_len as u64));
        group.bench_with_input(
            BenchmarkId::new("append_record", body_len),
            &body,
            |b, body| {
                let mut out = Vec::with_capacity(body_len + 8);
                b.iter(|| {
                    out.clear();
                    append_record(&mut out, b'B', &[body]);
                    out.len()
                })
            },
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for &count in &[16usize, 256, 4096] {
        let stream = synthetic_stream(count);
        group.throughput(Throughput::Bytes(stream.len() as u64));

        group.bench_with_input(BenchmarkId::new("split", count), &stream, |b, stream| {
            b.iter(|| {
                let (records, rest, err) = split(stream);
                assert!(err.is_none() && rest.is_empty());
                records.len()
            })
        });

        // Header classification alone, walking the same stream.
        group.bench_with_input(BenchmarkId::new("probe_walk", count), &stream, |b, stream| {
            b.iter(|| {
                let mut at = 0usize;
                let mut seen = 0usize;
                while at < stream.len() {
                    match probe(&stream[at..]) {
                        tlvio::Probe::Header {
                            hdr_len, body_len, ..
                        } => {
                            at += hdr_len + body_len;
                            seen += 1;
                        }
                        _ => break,
                    }
                }
                seen
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
