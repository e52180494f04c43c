#![forbid(unsafe_code)]

// Per-connection socket loop: frames in, acknowledgments and events out.

use crate::metrics::Metrics;
use crate::room::RoomRegistry;
use crate::signaling::dispatcher::{self, Session};
use crate::signaling::protocol::{Ack, AckBody, ClientRequest};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outbound queue per connection. Events beyond this are stale and
/// dropped; acknowledgments apply backpressure instead.
const CHANNEL_CAPACITY: usize = 64;

/// Close connections that go silent. Disconnect triggers normal teardown.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const RATE_LIMIT_PER_SEC: u64 = 100;
const TOKEN_US: u64 = 1_000_000;
const BURST_US: u64 = RATE_LIMIT_PER_SEC * TOKEN_US;

/// Token bucket over inbound frames, integer microsecond arithmetic.
struct TokenBucket {
    tokens_us: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens_us: BURST_US,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_PER_SEC).min(BURST_US);
        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// Pulls a request id out of a frame that failed full parsing, so the error
/// can still be acknowledged. A frame with no recoverable id cannot be
/// acknowledged at all and is logged and dropped.
fn recover_request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
}

/// Sends one acknowledgment. Unlike event fan-out this awaits queue space:
/// each request gets exactly one reply, so replies are never dropped while
/// the connection is alive. Returns false once the send task is gone.
async fn send_ack(tx: &mpsc::Sender<Arc<String>>, ack: &Ack) -> bool {
    match serde_json::to_string(ack) {
        Ok(json) => tx.send(Arc::new(json)).await.is_ok(),
        Err(err) => {
            warn!("Failed to serialize acknowledgment: {}", err);
            true
        }
    }
}

/// Drives a single WebSocket connection until it closes, then tears down the
/// peer session it carried (if any).
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: Metrics,
    _permit: OwnedSemaphorePermit,
) {
    let conn_id = Uuid::new_v4();
    info!("New signaling connection {}", conn_id);

    let _conn_guard = metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut session: Option<Session> = None;
    let mut bucket = TokenBucket::new();
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout on connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if !bucket.try_take() {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded on connection {}", conn_id);
                        if let Some(id) = recover_request_id(&text) {
                            let ack = Ack {
                                id,
                                body: AckBody::Error {
                                    error: format!(
                                        "rate limit exceeded: max {RATE_LIMIT_PER_SEC} requests/second"
                                    ),
                                },
                            };
                            if !send_ack(&tx, &ack).await {
                                break;
                            }
                        }
                    }
                    continue;
                }
                rate_limit_warned = false;

                let request = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => request,
                    Err(err) => {
                        match recover_request_id(&text) {
                            Some(id) => {
                                debug!("Unparseable request on connection {}: {}", conn_id, err);
                                metrics.request_handled(Duration::ZERO, true);
                                let ack = Ack {
                                    id,
                                    body: AckBody::Error {
                                        error: format!("invalid argument: {err}"),
                                    },
                                };
                                if !send_ack(&tx, &ack).await {
                                    break;
                                }
                            }
                            None => {
                                warn!(
                                    "Dropping frame with no request id on connection {}: {}",
                                    conn_id, err
                                );
                            }
                        }
                        continue;
                    }
                };

                let started = Instant::now();
                let result =
                    dispatcher::dispatch(&registry, &metrics, &mut session, &tx, request.method)
                        .await;
                metrics.request_handled(started.elapsed(), result.is_err());

                let (body, fanout) = match result {
                    Ok(handled) => (AckBody::Data { data: handled.data }, handled.fanout),
                    Err(err) => {
                        debug!("Request {} on connection {} failed: {}", request.id, conn_id, err);
                        (AckBody::Error { error: err.to_string() }, None)
                    }
                };

                // The acknowledgment goes out before any event about the same
                // operation reaches other peers.
                if !send_ack(&tx, &Ack { id: request.id, body }).await {
                    break;
                }
                if let Some(fanout) = fanout {
                    registry
                        .broadcast(&fanout.room_id, Some(&fanout.excluding_peer_id), &fanout.event)
                        .await;
                }
            }
            Message::Close(_) => {
                info!("Connection {} closed by client", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected frame type on connection {}", conn_id);
            }
        }
    }

    // Disconnect cancels the session: teardown runs here whether the client
    // left cleanly or the socket died mid-call.
    if let Some(Session { room_id, peer_id }) = session.take() {
        registry.remove_peer(&room_id, &peer_id).await;
    }

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for {}", conn_id);
}
