//! Codec benchmarks for switchboard-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use switchboard_protocol::{codec, Envelope};

const SMALL_PAYLOAD: &str = r#"{"content":"hello there","senderId":"user-a","senderName":"Alice","targetUserId":"user-b","timestamp":"2024-05-01T10:00:00Z","type":"text"}"#;

fn bench_parse_inbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_inbound");
    group.throughput(Throughput::Bytes(SMALL_PAYLOAD.len() as u64));
    group.bench_function("small", |b| {
        b.iter(|| codec::parse_inbound(black_box(SMALL_PAYLOAD)))
    });
    group.finish();
}

fn bench_relay_hop(c: &mut Criterion) {
    let envelope = Envelope::text("user-b", "x".repeat(256)).from_sender("user-a", "Alice");

    c.bench_function("relay_hop_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&envelope)).unwrap();
            codec::decode(black_box(encoded.as_bytes())).unwrap()
        })
    });
}

criterion_group!(benches, bench_parse_inbound, bench_relay_hop);
criterion_main!(benches);
