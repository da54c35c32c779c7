//! End-to-end throughput benchmark for Tether.
//!
//! Every client joins the same channel and emits events as fast as it can;
//! the count is of events relayed to the other clients over real sockets.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_protocol::{codec, event_channel_name, ChannelInfo, Event, Frame, FrameReader, JOIN};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const CHANNEL: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        Tether End-to-End Throughput Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(num_clients).await;
}

async fn run_pubsub_benchmark(num_clients: usize) {
    println!("📊 Relay Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counter and start measurement
    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    // Calculate throughput
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Total Messages:       {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    // Signal clients to stop
    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Connect to server
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    // Wait for the server's hello
    if let Some(Ok(_hello)) = receiver.next().await {
        // Got Hello frame
    }

    // Join the shared channel
    let info = serde_json::to_value(ChannelInfo::new("bench", CHANNEL))?;
    let join_frame = Frame::request(client_id as u64, JOIN, info);
    let join_bytes = codec::encode(&join_frame)?;
    sender.send(Message::Binary(join_bytes.to_vec())).await?;

    // Wait for the join reply
    if let Some(Ok(_reply)) = receiver.next().await {
        // Got reply, subscription is ready
    }

    // Wait for all clients to be ready
    barrier.wait().await;

    // Pre-encode the event frame for efficiency
    let event = Event::new("append").with_payload(json!({ "client": client_id }));
    let event_frame = Frame::event(event_channel_name(CHANNEL), serde_json::to_value(event)?);
    let event_bytes = codec::encode(&event_frame)?;
    let event_msg = Message::Binary(event_bytes.to_vec());

    // Spawn separate receiver task for full-duplex operation
    let recv_count = message_count.clone();
    let recv_task = tokio::spawn(async move {
        let mut reader = FrameReader::default();

        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                reader.push(&data);
                // Decode all complete frames
                while let Ok(Some(frame)) = reader.next_frame() {
                    if matches!(frame, Frame::Event { .. }) {
                        recv_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    // Send loop - no waiting, just blast messages
    loop {
        if sender.send(event_msg.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
