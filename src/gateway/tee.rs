//! Bounded fan-out of an upstream byte stream
//!
//! One producer copies upstream chunks into two bounded queues: the client
//! queue and, optionally, an observer queue for the scope response callback.
//! The client side has priority: when its queue is full the producer waits,
//! and that backpressure reaches the upstream socket through the paused
//! stream. The observer side is best-effort: the first time its queue is
//! full the producer stops feeding it, so an observer always sees a clean
//! prefix of the response, never a gappy one. Channel closure is the
//! end-of-stream sentinel for both consumers.

use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::scopes::ResponseBody;

/// Chunks buffered per consumer before backpressure (client) or shedding
/// (observer) kicks in. With upstream chunk sizes in the tens of KiB this
/// bounds each queue to a few MiB worst case.
const QUEUE_DEPTH: usize = 32;

/// The two consumer ends of a fan-out.
pub struct FanOut {
    /// Ordered, lossless byte stream for the client response body.
    pub client: ReceiverStream<io::Result<Bytes>>,
    /// Best-effort reader for the response observer, when requested.
    pub observer: Option<ResponseBody>,
}

/// Split `upstream` into a client stream and, if `observe`, an observer
/// reader. The producer task runs until upstream EOF, upstream error, or
/// client disconnect; in every case both channels close so consumers join
/// cleanly.
pub fn fan_out<S, E>(upstream: S, observe: bool) -> FanOut
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (client_tx, client_rx) = mpsc::channel::<io::Result<Bytes>>(QUEUE_DEPTH);
    let (observer_tx, observer_rx) = if observe {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(QUEUE_DEPTH);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    tokio::spawn(pump(upstream, client_tx, observer_tx));

    FanOut {
        client: ReceiverStream::new(client_rx),
        observer: observer_rx
            .map(|rx| Box::pin(StreamReader::new(ReceiverStream::new(rx))) as ResponseBody),
    }
}

async fn pump<S, E>(
    upstream: S,
    client_tx: mpsc::Sender<io::Result<Bytes>>,
    mut observer_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
) where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut shed_at: Option<u64> = None;
    let mut relayed: u64 = 0;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(chunk) => {
                if let Some(tx) = &observer_tx {
                    match tx.try_send(Ok(chunk.clone())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // Lossy leg: stop feeding a slow observer so it
                            // sees a truncated suffix, not gaps.
                            shed_at = Some(relayed);
                            observer_tx = None;
                        }
                        Err(TrySendError::Closed(_)) => {
                            observer_tx = None;
                        }
                    }
                }
                relayed += chunk.len() as u64;
                if client_tx.send(Ok(chunk)).await.is_err() {
                    debug!(relayed, "Client went away mid-stream, releasing upstream");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, relayed, "Upstream failed mid-stream");
                let _ = client_tx.send(Err(io::Error::other(e.to_string()))).await;
                return;
            }
        }
    }

    if let Some(delivered) = shed_at {
        debug!(
            delivered,
            total = relayed,
            "Observer fell behind; response suffix not observed"
        );
    }
    // Senders drop here: end-of-stream for both consumers.
}
