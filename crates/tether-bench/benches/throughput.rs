//! Throughput benchmarks for Tether.
//!
//! These benchmarks measure how fast events move through the connection core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tether_core::{
    fold_events, Channel, ChannelConnectionRequest, ChannelConnector, ChannelInfo,
    ConnectionBuilder, Event, MemoryConnector, ReducingStateStore, StateStore, SyncChannel,
};
use tokio::runtime::Runtime;

fn counter(state: &i64, event: &Event) -> i64 {
    match event.event_type.as_str() {
        "add" => state + 1,
        "subtract" => state - 1,
        _ => *state,
    }
}

fn counter_store() -> Arc<dyn StateStore<i64>> {
    Arc::new(ReducingStateStore::new(0i64, counter))
}

/// Benchmark folding a batch of events without a connection.
fn bench_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold");

    for size in [100usize, 10_000].iter() {
        let events: Vec<Event> = (0..*size).map(|_| Event::new("add")).collect();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| fold_events(&counter, black_box(0i64), events.iter()));
        });
    }

    group.finish();
}

/// Benchmark local emission through a single connection.
fn bench_emit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let mut group = c.benchmark_group("emit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("local_only", |b| {
        let connection = ConnectionBuilder::new(ChannelConnectionRequest::new(
            ChannelInfo::new("counter", "bench"),
            counter_store(),
        ))
        .build()
        .unwrap();
        let event = Event::new("add");

        b.iter(|| connection.emit(black_box(event.clone())));
    });

    group.bench_function("forwarded", |b| {
        let connection = ConnectionBuilder::new(ChannelConnectionRequest::new(
            ChannelInfo::new("counter", "bench"),
            counter_store(),
        ))
        .emit_to_server(|event| {
            black_box(event);
        })
        .build()
        .unwrap();
        let event = Event::new("add");

        b.iter(|| connection.emit(black_box(event.clone())));
    });

    group.finish();
}

/// Benchmark fan-out of one shared in-memory connection.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let connector: Arc<MemoryConnector<i64>> = Arc::new(MemoryConnector::new());
            let channel = Channel::new(
                ChannelInfo::new("counter", "broadcast"),
                connector,
                counter_store(),
            );
            let connection = rt.block_on(channel.subscribe()).unwrap();
            let mut receivers: Vec<_> = (0..size).map(|_| connection.events()).collect();
            let event = Event::new("add");

            b.iter(|| {
                connection.emit(black_box(event.clone()));
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark joining and leaving distinct in-memory channels.
fn bench_join(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connector = MemoryConnector::<i64>::new();

    c.bench_function("join_leave", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let request = ChannelConnectionRequest::new(
                ChannelInfo::new("counter", format!("channel-{i}")),
                counter_store(),
            );
            i += 1;
            let connection = rt.block_on(connector.connect_to_channel(request)).unwrap();
            connection.unsubscribe();
        });
    });
}

criterion_group!(benches, bench_fold, bench_emit, bench_fanout, bench_join);
criterion_main!(benches);
