#![forbid(unsafe_code)]

// Room registry - the process-wide roomId -> Room mapping and the lifecycle
// rules tying routers and peers together.
//
// Locking follows a two-level scheme: the outer map sits behind a
// std::sync::RwLock held only for lookups and inserts (never across an
// await), and each room has its own tokio::sync::RwLock taken briefly to
// read or mutate room state. Engine calls never run under either lock, so
// one peer's engine round-trip cannot stall the rest of its room; the races
// the brief locks admit (duplicate peer id, room retired mid-join) are
// re-checked under the write lock when the result is recorded.

use crate::config::Config;
use crate::error::{SignalingError, SignalingResult};
use crate::media::{engine_call, WorkerPool};
use crate::metrics::Metrics;
use crate::room::{Peer, Room};
use crate::signaling::protocol::{Notification, TransportDescription};
use mediasoup::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Everything `join-room` hands back to the joining client.
pub struct JoinedRoom {
    pub send_transport: TransportDescription,
    pub recv_transport: TransportDescription,
    pub router_rtp_capabilities: RtpCapabilitiesFinalized,
}

pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    worker_pool: Arc<WorkerPool>,
    config: Arc<Config>,
    metrics: Metrics,
}

impl RoomRegistry {
    pub fn new(worker_pool: Arc<WorkerPool>, config: Arc<Config>, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            rooms: StdRwLock::new(HashMap::new()),
            worker_pool,
            config,
            metrics,
        })
    }

    /// Looks up a live room.
    pub fn get(&self, room_id: &str) -> SignalingResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| SignalingError::NotFound(format!("room \"{room_id}\"")))
    }

    /// Returns the room for `room_id`, creating it (with a fresh router on
    /// the next pool worker) if absent. Racing creators for the same id
    /// converge on a single room; the loser's router is dropped, which closes
    /// it.
    pub async fn get_or_create(&self, room_id: &str) -> SignalingResult<Arc<TokioRwLock<Room>>> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        let worker = self.worker_pool.next_worker();
        let router = engine_call("create-router", worker.create_router(self.config.router_options()))
            .await?
            .map_err(|e| SignalingError::EngineFailed(format!("router creation failed: {e}")))?;

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        match rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                info!("Created room {} with router {}", room_id, router.id());
                self.metrics.room_created();
                let room = Room::new(room_id.to_string(), router, self.metrics.clone());
                Ok(entry.insert(Arc::new(TokioRwLock::new(room))).clone())
            }
        }
    }

    /// Admits a peer into a room: room acquired or created, peer id
    /// uniqueness enforced, both WebRTC transports created and capped,
    /// lifecycle handlers armed, peer inserted. The engine round-trips run
    /// with no room lock held, so they never stall other peers in the room;
    /// uniqueness and room liveness are re-checked under the write lock when
    /// the peer is recorded. Any failure or lost race drops the partially
    /// created transports (closing them) and leaves no half-formed peer
    /// behind.
    pub async fn join(
        self: &Arc<Self>,
        room_id: &str,
        peer_id: &str,
        channel: mpsc::Sender<Arc<String>>,
    ) -> SignalingResult<JoinedRoom> {
        loop {
            let room_arc = self.get_or_create(room_id).await?;

            // Pre-check and router clone under a brief read lock.
            let router = {
                let room = room_arc.read().await;
                if room.is_closed() {
                    // Lost the race against the last peer leaving; the map
                    // entry is already gone, so the next iteration builds a
                    // fresh room.
                    continue;
                }
                if room.peers.contains_key(peer_id) {
                    return Err(SignalingError::Conflict(format!(
                        "peer \"{peer_id}\" already in room \"{room_id}\""
                    )));
                }
                room.router.clone()
            };

            let send_transport = match self.create_transport(&router).await {
                Ok(transport) => transport,
                Err(err) => {
                    let mut room = room_arc.write().await;
                    self.retire_if_empty(room_id, &room_arc, &mut room);
                    return Err(err);
                }
            };
            let recv_transport = match self.create_transport(&router).await {
                Ok(transport) => transport,
                // The send transport drops here, which closes it.
                Err(err) => {
                    let mut room = room_arc.write().await;
                    self.retire_if_empty(room_id, &room_arc, &mut room);
                    return Err(err);
                }
            };

            let joined = JoinedRoom {
                send_transport: TransportDescription::from(&send_transport),
                recv_transport: TransportDescription::from(&recv_transport),
                router_rtp_capabilities: router.rtp_capabilities().clone(),
            };

            // Record under the write lock, re-checking what may have changed
            // while the transports were being created.
            {
                let mut room = room_arc.write().await;
                if room.is_closed() {
                    // Transports drop closed; start over with a fresh room.
                    continue;
                }
                if room.peers.contains_key(peer_id) {
                    return Err(SignalingError::Conflict(format!(
                        "peer \"{peer_id}\" already in room \"{room_id}\""
                    )));
                }

                // Handlers are armed only once the peer is actually admitted,
                // so transports discarded by a lost race can never tear down
                // a later session with the same ids.
                self.arm_transport_handlers(&send_transport, room_id, peer_id, "send");
                self.arm_transport_handlers(&recv_transport, room_id, peer_id, "recv");

                room.peers.insert(
                    peer_id.to_string(),
                    Peer::new(peer_id.to_string(), channel, send_transport, recv_transport),
                );
            }
            self.metrics.peer_joined();
            info!("Peer {} joined room {}", peer_id, room_id);

            return Ok(joined);
        }
    }

    async fn create_transport(&self, router: &Router) -> SignalingResult<WebRtcTransport> {
        let transport = engine_call(
            "create-transport",
            router.create_webrtc_transport(self.config.transport_options()),
        )
        .await?
        .map_err(|e| SignalingError::EngineFailed(format!("transport creation failed: {e}")))?;

        engine_call(
            "set-max-incoming-bitrate",
            transport.set_max_incoming_bitrate(self.config.max_incoming_bitrate),
        )
        .await?
        .map_err(|e| SignalingError::EngineFailed(format!("bitrate ceiling failed: {e}")))?;

        Ok(transport)
    }

    /// Tears a peer down in order: consumers, producers, transports, removal
    /// from the room, room retirement if now empty, then `peer-left` to the
    /// remaining members. Idempotent; safe to call from engine event
    /// handlers and from disconnect paths concurrently.
    pub async fn remove_peer(&self, room_id: &str, peer_id: &str) {
        let room_arc = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(room) => room.clone(),
                None => return,
            }
        };

        let mut room = room_arc.write().await;
        let Some(mut peer) = room.peers.remove(peer_id) else {
            return;
        };

        peer.close();
        drop(peer);
        self.metrics.peer_left();
        info!("Peer {} left room {}", peer_id, room_id);

        if room.peers.is_empty() {
            self.retire_if_empty(room_id, &room_arc, &mut room);
        } else {
            room.broadcast(
                &Notification::PeerLeft {
                    peer_id: peer_id.to_string(),
                },
                None,
            );
        }
    }

    /// Retires a room that ended up with no peers, either because its last
    /// member left or because the join that created it failed partway.
    fn retire_if_empty(&self, room_id: &str, room_arc: &Arc<TokioRwLock<Room>>, room: &mut Room) {
        if room.peers.is_empty() {
            room.mark_closed();
            self.delete(room_id, room_arc);
            info!("Room {} is empty, closing router", room_id);
        }
    }

    /// Removes a room's registry entry; its router closes once the last
    /// reference to the room drops. The room must already be marked closed so
    /// a joiner holding a stale reference starts over instead of reviving it.
    fn delete(&self, room_id: &str, room_arc: &Arc<TokioRwLock<Room>>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = rooms.get(room_id) {
            if Arc::ptr_eq(existing, room_arc) {
                rooms.remove(room_id);
            }
        }
    }

    /// Emits an event to a room's members, best-effort. A missing room means
    /// everyone already left; nothing to do.
    pub async fn broadcast(&self, room_id: &str, excluding_peer_id: Option<&str>, event: &Notification) {
        if let Ok(room_arc) = self.get(room_id) {
            let room = room_arc.read().await;
            if !room.is_closed() {
                room.broadcast(event, excluding_peer_id);
            }
        }
    }

    /// Engine told us a producer's transport closed. Drop our handle; if the
    /// peer is already gone this is a silent no-op.
    pub async fn drop_producer(&self, room_id: &str, peer_id: &str, producer_id: &str) {
        let Ok(room_arc) = self.get(room_id) else {
            return;
        };
        let mut room = room_arc.write().await;
        if let Some(peer) = room.peers.get_mut(peer_id) {
            if peer.remove_producer(producer_id).is_some() {
                debug!(
                    "Dropped producer {} of peer {} after engine-side close",
                    producer_id, peer_id
                );
            }
        }
    }

    /// Engine-side consumer death (its transport closed or its source
    /// producer closed). Same late-event tolerance as [`Self::drop_producer`].
    pub async fn drop_consumer(&self, room_id: &str, peer_id: &str, consumer_id: &str) {
        let Ok(room_arc) = self.get(room_id) else {
            return;
        };
        let mut room = room_arc.write().await;
        if let Some(peer) = room.peers.get_mut(peer_id) {
            if peer.remove_consumer(consumer_id).is_some() {
                debug!(
                    "Dropped consumer {} of peer {} after engine-side close",
                    consumer_id, peer_id
                );
            }
        }
    }

    /// Arms DTLS/close handlers on a freshly created transport. A dead
    /// transport means a dead session, so both events funnel into peer
    /// teardown; the teardown path is idempotent, which also makes the
    /// close-after-close echo from the engine harmless.
    fn arm_transport_handlers(
        self: &Arc<Self>,
        transport: &WebRtcTransport,
        room_id: &str,
        peer_id: &str,
        direction: &'static str,
    ) {
        let handle = Handle::current();
        let transport_id = transport.id().to_string();

        transport
            .on_dtls_state_change({
                let registry = Arc::clone(self);
                let handle = handle.clone();
                let room_id = room_id.to_string();
                let peer_id = peer_id.to_string();
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    debug!(
                        "DTLS state {:?} on {} transport {} (peer {})",
                        dtls_state, direction, transport_id, peer_id
                    );
                    if dtls_state == DtlsState::Closed {
                        let registry = Arc::clone(&registry);
                        let room_id = room_id.clone();
                        let peer_id = peer_id.clone();
                        handle.spawn(async move {
                            registry.remove_peer(&room_id, &peer_id).await;
                        });
                    }
                }
            })
            .detach();

        transport
            .on_close({
                let registry = Arc::clone(self);
                let room_id = room_id.to_string();
                let peer_id = peer_id.to_string();
                Box::new(move || {
                    warn!(
                        "{} transport {} closed for peer {}",
                        direction, transport_id, peer_id
                    );
                    handle.spawn(async move {
                        registry.remove_peer(&room_id, &peer_id).await;
                    });
                })
            })
            .detach();
    }

    /// Arms the transport-close cascade on a new producer.
    pub fn arm_producer_handlers(self: &Arc<Self>, producer: &Producer, room_id: &str, peer_id: &str) {
        let registry = Arc::clone(self);
        let handle = Handle::current();
        let room_id = room_id.to_string();
        let peer_id = peer_id.to_string();
        let producer_id = producer.id().to_string();

        producer
            .on_transport_close(move || {
                handle.spawn(async move {
                    registry.drop_producer(&room_id, &peer_id, &producer_id).await;
                });
            })
            .detach();
    }

    /// Arms both close cascades on a new consumer: its own transport dying
    /// and its source producer going away.
    pub fn arm_consumer_handlers(self: &Arc<Self>, consumer: &Consumer, room_id: &str, peer_id: &str) {
        let handle = Handle::current();
        let consumer_id = consumer.id().to_string();

        consumer
            .on_transport_close({
                let registry = Arc::clone(self);
                let handle = handle.clone();
                let room_id = room_id.to_string();
                let peer_id = peer_id.to_string();
                let consumer_id = consumer_id.clone();
                move || {
                    handle.spawn(async move {
                        registry.drop_consumer(&room_id, &peer_id, &consumer_id).await;
                    });
                }
            })
            .detach();

        consumer
            .on_producer_close({
                let registry = Arc::clone(self);
                let room_id = room_id.to_string();
                let peer_id = peer_id.to_string();
                move || {
                    handle.spawn(async move {
                        registry.drop_consumer(&room_id, &peer_id, &consumer_id).await;
                    });
                }
            })
            .detach();
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn peer_count(&self) -> usize {
        let room_arcs: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_arc in room_arcs {
            if let Ok(room) = room_arc.try_read() {
                total += room.peers.len();
            }
        }
        total
    }

    /// Drains every room, closing all peer resources in teardown order and
    /// letting the routers drop. Used on graceful shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms");

        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_arc) in &all_rooms {
            let mut room = room_arc.write().await;
            room.mark_closed();
            let peer_ids: Vec<String> = room.peers.keys().cloned().collect();
            for peer_id in &peer_ids {
                if let Some(mut peer) = room.peers.remove(peer_id) {
                    peer.close();
                }
            }
            info!("Shut down room {} ({} peers)", room_id, peer_ids.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }
}
