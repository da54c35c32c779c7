//! Latency benchmarks for Tether.
//!
//! These benchmarks focus on how long connectivity changes take to settle.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures_util::stream;
use std::sync::Arc;
use std::time::Instant;
use tether_core::{
    ChannelConnectionRequest, ChannelInfo, ConnectionBuilder, ConnectionState, Event,
    ReducingStateStore, Signal,
};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn counter(state: &i64, event: &Event) -> i64 {
    match event.event_type.as_str() {
        "add" => state + 1,
        _ => *state,
    }
}

/// Benchmark the pure state machine.
fn bench_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitions");

    group.bench_function("full_cycle", |b| {
        b.iter(|| {
            let (state, _) = ConnectionState::Online.on_signal(black_box(Signal::Connectivity(false)));
            let (state, _) = state.on_signal(black_box(Signal::Connectivity(true)));
            state.on_signal(black_box(Signal::Reconnect))
        });
    });

    group.finish();
}

/// Benchmark offline, fetch and reconnect through a live connection.
fn bench_reconnect_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("reconnect");

    group.bench_function("cycle", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
                let connectivity = stream::poll_fn(move |cx| rx.poll_recv(cx));
                let connection = ConnectionBuilder::new(ChannelConnectionRequest::new(
                    ChannelInfo::new("counter", "bench"),
                    Arc::new(ReducingStateStore::new(0i64, counter)),
                ))
                .connection_state(connectivity)
                .server_state(|| async { Ok(0i64) })
                .initially_connected(true)
                .build()
                .unwrap();
                let mut state = connection.watch_state();
                let mut reconnected = connection.reconnected();

                let start = Instant::now();
                for _ in 0..iters {
                    tx.send(false).unwrap();
                    state
                        .wait_for(|s| *s == ConnectionState::Offline)
                        .await
                        .unwrap();
                    tx.send(true).unwrap();
                    reconnected.recv().await.unwrap();
                    connection.reconnect();
                }
                let elapsed = start.elapsed();
                connection.unsubscribe();
                elapsed
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_transitions, bench_reconnect_cycle);
criterion_main!(benches);
