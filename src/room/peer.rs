#![forbid(unsafe_code)]

// Peer - the server-side session object for one connected client

use crate::signaling::protocol::ProducerSummary;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which of a peer's two transports an id resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

/// One client's session: its signaling channel, exactly one send and one
/// receive transport (created together at join), and the producers and
/// consumers living on them.
///
/// Field order is teardown order: consumers close before producers, producers
/// before transports, whether through [`Peer::close`] or a plain drop.
pub struct Peer {
    id: String,
    channel: mpsc::Sender<Arc<String>>,
    consumers: HashMap<String, Consumer>,
    producers: HashMap<String, Producer>,
    send_transport: WebRtcTransport,
    recv_transport: WebRtcTransport,
}

impl Peer {
    pub fn new(
        id: String,
        channel: mpsc::Sender<Arc<String>>,
        send_transport: WebRtcTransport,
        recv_transport: WebRtcTransport,
    ) -> Self {
        Self {
            id,
            channel,
            consumers: HashMap::new(),
            producers: HashMap::new(),
            send_transport,
            recv_transport,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &mpsc::Sender<Arc<String>> {
        &self.channel
    }

    /// Resolves a transport id against this peer's two transports.
    pub fn transport(&self, transport_id: &str) -> Option<(TransportDirection, &WebRtcTransport)> {
        if self.send_transport.id().to_string() == transport_id {
            Some((TransportDirection::Send, &self.send_transport))
        } else if self.recv_transport.id().to_string() == transport_id {
            Some((TransportDirection::Recv, &self.recv_transport))
        } else {
            None
        }
    }

    pub fn add_producer(&mut self, producer: Producer) {
        self.producers.insert(producer.id().to_string(), producer);
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<Producer> {
        self.producers.remove(producer_id)
    }

    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    pub fn add_consumer(&mut self, consumer: Consumer) {
        self.consumers.insert(consumer.id().to_string(), consumer);
    }

    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<Consumer> {
        self.consumers.remove(consumer_id)
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<&Consumer> {
        self.consumers.get(consumer_id)
    }

    /// This peer's producers as seen by other peers.
    pub fn producer_summaries(&self) -> impl Iterator<Item = ProducerSummary> + '_ {
        self.producers.values().map(|producer| ProducerSummary {
            peer_id: self.id.clone(),
            producer_id: producer.id().to_string(),
            kind: producer.kind(),
        })
    }

    /// Closes every owned resource in order: consumers, then producers, then
    /// both transports. Engine handles close on drop, so draining the maps in
    /// this order is the whole job; the transports go down with the Peer.
    pub fn close(&mut self) {
        self.consumers.clear();
        self.producers.clear();
    }
}
