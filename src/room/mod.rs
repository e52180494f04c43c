#![forbid(unsafe_code)]

// Room - one named multi-peer session sharing a single router

pub mod peer;
pub mod registry;

pub use peer::{Peer, TransportDirection};
pub use registry::RoomRegistry;

use crate::metrics::Metrics;
use crate::signaling::protocol::{Notification, ProducerSummary};
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A named session. The router lives exactly as long as the room; peers are
/// owned by the room and share the router's codec set.
pub struct Room {
    pub id: String,
    pub router: Router,
    pub peers: HashMap<String, Peer>,
    metrics: Metrics,
    /// Set once the last peer leaves, while the registry entry is being
    /// retired. A joiner that raced the retirement re-checks this flag and
    /// starts over with a fresh room.
    closed: bool,
}

impl Room {
    pub fn new(id: String, router: Router, metrics: Metrics) -> Self {
        Self {
            id,
            router,
            peers: HashMap::new(),
            metrics,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Every producer across all peers except the excluded one. Used to
    /// bootstrap late joiners.
    pub fn list_producers(&self, excluding_peer_id: &str) -> Vec<ProducerSummary> {
        self.peers
            .values()
            .filter(|peer| peer.id() != excluding_peer_id)
            .flat_map(|peer| peer.producer_summaries())
            .collect()
    }

    /// The peer owning the given producer, if any.
    pub fn find_producer_owner(&self, producer_id: &str) -> Option<&Peer> {
        self.peers
            .values()
            .find(|peer| peer.has_producer(producer_id))
    }

    /// Emits an event to every member except the excluded one. Delivery is
    /// best-effort: a full or closed channel drops that recipient's copy and
    /// never propagates an error or alters room state.
    pub fn broadcast(&self, event: &Notification, excluding_peer_id: Option<&str>) {
        let json = match serde_json::to_string(event) {
            Ok(json) => Arc::new(json),
            Err(err) => {
                warn!("Failed to serialize event for room {}: {}", self.id, err);
                return;
            }
        };

        for peer in self.peers.values() {
            if excluding_peer_id.is_some_and(|excluded| peer.id() == excluded) {
                continue;
            }
            match peer.channel().try_send(Arc::clone(&json)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.notification_dropped();
                    warn!(
                        "Channel full for peer {} in room {}, dropping event",
                        peer.id(),
                        self.id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.metrics.notification_dropped();
                    debug!(
                        "Channel closed for peer {} in room {} (disconnecting)",
                        peer.id(),
                        self.id
                    );
                }
            }
        }
    }
}
