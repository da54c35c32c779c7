//! Codec benchmarks for tether-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use tether_protocol::{codec, event_channel_name, Event, Frame, FrameReader};

fn channel_event(size: usize) -> Frame {
    let event = Event::new("append").with_payload(json!({ "text": "x".repeat(size) }));
    Frame::event(
        event_channel_name("bench:room"),
        serde_json::to_value(event).unwrap(),
    )
}

fn bench_encode_small(c: &mut Criterion) {
    let frame = channel_event(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("event_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&channel_event(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("event_64B", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

/// Frames arriving in messages that cut across frame boundaries.
fn bench_reader_batch(c: &mut Criterion) {
    let mut stream = Vec::new();
    for _ in 0..64 {
        stream.extend_from_slice(&codec::encode(&channel_event(256)).unwrap());
    }
    let chunks: Vec<&[u8]> = stream.chunks(1000).collect();

    let mut group = c.benchmark_group("reader");
    group.throughput(Throughput::Elements(64));
    group.bench_function("64_events_in_1000B_messages", |b| {
        b.iter(|| {
            let mut reader = FrameReader::default();
            let mut frames = 0;
            for chunk in &chunks {
                reader.push(black_box(chunk));
                while let Ok(Some(_)) = reader.next_frame() {
                    frames += 1;
                }
            }
            frames
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode_small, bench_decode_small, bench_reader_batch);
criterion_main!(benches);
