//! Per-packet processing latency benchmarks for pgm-core.
//!
//! Measures latency contributions of the hot-path components:
//! - Wire `Packet` encode/decode (various payload sizes)
//! - Reed-Solomon FEC encode and erasure decode
//! - `Engine::send_apdu` / `Engine::recv_packet` (the full send/receive pipeline)
//!
//! Run with: cargo bench --package pgm-core

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pgm_core::codec::RsCodec;
use pgm_core::config::{BindConfig, Mode};
use pgm_core::engine::{Engine, EngineAction};
use pgm_core::rate::SendFlags;
use pgm_core::tsi::Tsi;
use pgm_core::wire::{Body, Options, Packet};

// ─── Wire Packet ─────────────────────────────────────────────────────────

fn bench_packet_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");

    for size in [100, 500, 1200, 4000] {
        let pkt = Packet {
            source_port: 9000,
            dest_port: 9001,
            gsi: [1, 2, 3, 4, 5, 6],
            sqn: 42.into(),
            options: Options::default(),
            body: Body::Odata {
                trail: 0.into(),
                payload: Bytes::from(vec![0xABu8; size]),
            },
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| {
                black_box(black_box(&pkt).encode());
            });
        });
    }

    group.finish();
}

fn bench_packet_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    for size in [100, 500, 1200, 4000] {
        let pkt = Packet {
            source_port: 9000,
            dest_port: 9001,
            gsi: [1, 2, 3, 4, 5, 6],
            sqn: 42.into(),
            options: Options::default(),
            body: Body::Odata {
                trail: 0.into(),
                payload: Bytes::from(vec![0xABu8; size]),
            },
        };
        let encoded = pkt.encode();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| {
                black_box(Packet::decode(black_box(&encoded)))
            });
        });
    }

    group.finish();
}

// ─── Reed-Solomon FEC ────────────────────────────────────────────────────

fn bench_fec_encode(c: &mut Criterion) {
    let codec = RsCodec::new(36, 32).unwrap();
    let source: Vec<Vec<u8>> = (0..32).map(|i| vec![i as u8; 1200]).collect();
    let refs: Vec<&[u8]> = source.iter().map(|b| b.as_slice()).collect();

    c.bench_function("fec_encode_k32_h4_parity_symbol", |b| {
        b.iter(|| {
            black_box(codec.encode(black_box(&refs), 0).unwrap());
        });
    });
}

fn bench_fec_decode(c: &mut Criterion) {
    let codec = RsCodec::new(36, 32).unwrap();
    let source: Vec<Vec<u8>> = (0..32).map(|i| vec![i as u8; 1200]).collect();
    let refs: Vec<&[u8]> = source.iter().map(|b| b.as_slice()).collect();
    let parity: Vec<Vec<u8>> = (0..4).map(|p| codec.encode(&refs, p).unwrap()).collect();

    c.bench_function("fec_decode_k32_h4_single_erasure", |b| {
        b.iter_batched(
            || {
                let mut blocks: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
                blocks.extend(parity.iter().cloned().map(Some));
                blocks[3] = None;
                let mut erased = vec![false; 36];
                erased[3] = true;
                (blocks, erased)
            },
            |(mut blocks, erased)| {
                codec.decode_parity_inline(black_box(&mut blocks), &erased).unwrap();
                black_box(blocks);
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

// ─── Engine send/receive pipeline ────────────────────────────────────────

fn bench_engine_send_apdu(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_send_apdu");

    for size in [100, 1200, 4000] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let now = quanta::Instant::now();
            let bound = BindConfig {
                mode: Mode::SendOnly,
                ..BindConfig::default()
            }
            .validate()
            .unwrap();
            let mut sender = Engine::bind(bound, Tsi::new([1, 2, 3, 4, 5, 6], 9000), 9000, 9001, now);
            let payload = Bytes::from(vec![0xABu8; size]);

            b.iter(|| {
                let actions = sender.send_apdu(black_box(payload.clone()), SendFlags::default(), now).unwrap();
                black_box(actions);
            });
        });
    }

    group.finish();
}

fn bench_engine_roundtrip(c: &mut Criterion) {
    c.bench_function("engine_send_then_receive_1200B", |b| {
        let now = quanta::Instant::now();
        let sender_bound = BindConfig {
            mode: Mode::SendOnly,
            ..BindConfig::default()
        }
        .validate()
        .unwrap();
        let receiver_bound = BindConfig {
            mode: Mode::RecvOnly,
            ..BindConfig::default()
        }
        .validate()
        .unwrap();
        let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 9000);
        let mut sender = Engine::bind(sender_bound, tsi, 9000, 9001, now);
        let mut receiver = Engine::bind(receiver_bound, tsi, 9001, 9000, now);
        let payload = Bytes::from(vec![0xABu8; 1200]);

        b.iter(|| {
            let actions = sender.send_apdu(black_box(payload.clone()), SendFlags::default(), now).unwrap();
            for action in actions {
                if let EngineAction::Send { bytes, .. } = action {
                    for delivered in receiver.recv_packet(&bytes, now) {
                        black_box(delivered);
                    }
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_packet_encode,
    bench_packet_decode,
    bench_fec_encode,
    bench_fec_decode,
    bench_engine_send_apdu,
    bench_engine_roundtrip,
);
criterion_main!(benches);
