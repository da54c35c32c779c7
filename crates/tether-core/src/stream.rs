//! Adapters from tokio channels to boxed streams.
//!
//! Connectors hand the connection core `Stream`s; most of them start life as
//! tokio channel receivers.

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Turn an unbounded receiver into a stream that ends when every sender is gone.
pub fn unbounded_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Turn a broadcast receiver into a stream, skipping over lag.
pub fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Broadcast stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
