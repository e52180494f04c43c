#![forbid(unsafe_code)]

// Request dispatch - validates each call, locates the peer, brokers the
// engine operation and produces exactly one reply, plus any event fan-out
// that must follow the acknowledgment.

use crate::error::{SignalingError, SignalingResult};
use crate::media::engine_call;
use crate::metrics::Metrics;
use crate::room::{RoomRegistry, TransportDirection};
use crate::signaling::protocol::{Notification, RequestMethod, ResponseData};
use mediasoup::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_PEER_ID_LEN: usize = 64;

/// The joined-room identity of one signaling connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub room_id: String,
    pub peer_id: String,
}

/// An event to deliver to the rest of the room strictly after the
/// acknowledgment has been sent to the requester.
pub struct Fanout {
    pub room_id: String,
    pub excluding_peer_id: String,
    pub event: Notification,
}

/// Outcome of one successfully handled request.
pub struct Handled {
    pub data: ResponseData,
    pub fanout: Option<Fanout>,
}

impl Handled {
    fn reply(data: ResponseData) -> Self {
        Self { data, fanout: None }
    }

    fn reply_then(data: ResponseData, fanout: Fanout) -> Self {
        Self {
            data,
            fanout: Some(fanout),
        }
    }
}

/// Handles one request from one connection. `session` is `None` until a
/// successful `join-room`, which is the only method allowed to run without
/// one.
pub async fn dispatch(
    registry: &Arc<RoomRegistry>,
    metrics: &Metrics,
    session: &mut Option<Session>,
    channel: &mpsc::Sender<Arc<String>>,
    method: RequestMethod,
) -> SignalingResult<Handled> {
    match method {
        RequestMethod::JoinRoom { room_id, peer_id } => {
            join_room(registry, session, channel, room_id, peer_id).await
        }
        RequestMethod::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => connect_transport(registry, session, &transport_id, dtls_parameters).await,
        RequestMethod::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => produce(registry, metrics, session, &transport_id, kind, rtp_parameters).await,
        RequestMethod::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => consume(registry, metrics, session, &transport_id, &producer_id, rtp_capabilities).await,
        RequestMethod::ResumeConsumer { consumer_id } => {
            resume_consumer(registry, session, &consumer_id).await
        }
        RequestMethod::GetProducers => get_producers(registry, session).await,
    }
}

fn require_session(session: &Option<Session>) -> SignalingResult<&Session> {
    session
        .as_ref()
        .ok_or_else(|| SignalingError::NotFound("peer has not joined a room".to_string()))
}

async fn join_room(
    registry: &Arc<RoomRegistry>,
    session: &mut Option<Session>,
    channel: &mpsc::Sender<Arc<String>>,
    room_id: String,
    peer_id: String,
) -> SignalingResult<Handled> {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return Err(SignalingError::ArgumentInvalid(format!(
            "roomId must be 1-{MAX_ROOM_ID_LEN} bytes"
        )));
    }
    if peer_id.is_empty() || peer_id.len() > MAX_PEER_ID_LEN {
        return Err(SignalingError::ArgumentInvalid(format!(
            "peerId must be 1-{MAX_PEER_ID_LEN} bytes"
        )));
    }
    if let Some(existing) = session {
        return Err(SignalingError::Conflict(format!(
            "channel already joined room \"{}\" as \"{}\"",
            existing.room_id, existing.peer_id
        )));
    }

    let joined = registry.join(&room_id, &peer_id, channel.clone()).await?;

    *session = Some(Session {
        room_id: room_id.clone(),
        peer_id: peer_id.clone(),
    });

    Ok(Handled::reply_then(
        ResponseData::Joined {
            send_transport: joined.send_transport,
            recv_transport: joined.recv_transport,
            router_rtp_capabilities: joined.router_rtp_capabilities,
        },
        Fanout {
            room_id,
            excluding_peer_id: peer_id.clone(),
            event: Notification::PeerJoined { peer_id },
        },
    ))
}

async fn connect_transport(
    registry: &Arc<RoomRegistry>,
    session: &Option<Session>,
    transport_id: &str,
    dtls_parameters: DtlsParameters,
) -> SignalingResult<Handled> {
    let session = require_session(session)?;
    let room_arc = registry.get(&session.room_id)?;

    let transport = {
        let room = room_arc.read().await;
        let peer = room
            .peers
            .get(&session.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer \"{}\"", session.peer_id)))?;
        let (_, transport) = peer
            .transport(transport_id)
            .ok_or_else(|| SignalingError::NotFound(format!("transport \"{transport_id}\"")))?;
        transport.clone()
    };

    engine_call(
        "connect-transport",
        transport.connect(WebRtcTransportRemoteParameters { dtls_parameters }),
    )
    .await?
    .map_err(|e| SignalingError::EngineRejected(format!("transport connect refused: {e}")))?;

    info!(
        "Connected transport {} for peer {}",
        transport_id, session.peer_id
    );
    Ok(Handled::reply(ResponseData::Success { success: true }))
}

async fn produce(
    registry: &Arc<RoomRegistry>,
    metrics: &Metrics,
    session: &Option<Session>,
    transport_id: &str,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
) -> SignalingResult<Handled> {
    let session = require_session(session)?.clone();
    let room_arc = registry.get(&session.room_id)?;

    // Resolve the send transport under a brief read lock; the engine call
    // itself runs with no room lock held.
    let transport = {
        let room = room_arc.read().await;
        let peer = room
            .peers
            .get(&session.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer \"{}\"", session.peer_id)))?;
        match peer.transport(transport_id) {
            Some((TransportDirection::Send, transport)) => transport.clone(),
            Some((TransportDirection::Recv, _)) => {
                return Err(SignalingError::ArgumentInvalid(format!(
                    "transport \"{transport_id}\" is the receive transport; producing requires the send transport"
                )));
            }
            None => {
                return Err(SignalingError::NotFound(format!(
                    "transport \"{transport_id}\""
                )));
            }
        }
    };

    let producer = engine_call(
        "produce",
        transport.produce(ProducerOptions::new(kind, rtp_parameters)),
    )
    .await?
    .map_err(|e| SignalingError::EngineRejected(format!("produce refused: {e}")))?;

    let producer_id = producer.id().to_string();
    registry.arm_producer_handlers(&producer, &session.room_id, &session.peer_id);

    // Record under a brief write lock. If the peer was torn down while the
    // engine call was in flight, the producer drops here instead, closing it.
    {
        let mut room = room_arc.write().await;
        room.peers
            .get_mut(&session.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer \"{}\"", session.peer_id)))?
            .add_producer(producer);
    }
    metrics.producer_created();

    info!(
        "Peer {} producing {:?} as {} in room {}",
        session.peer_id, kind, producer_id, session.room_id
    );

    Ok(Handled::reply_then(
        ResponseData::Produced {
            id: producer_id.clone(),
        },
        Fanout {
            room_id: session.room_id.clone(),
            excluding_peer_id: session.peer_id.clone(),
            event: Notification::NewProducer {
                peer_id: session.peer_id,
                producer_id,
                kind,
            },
        },
    ))
}

async fn consume(
    registry: &Arc<RoomRegistry>,
    metrics: &Metrics,
    session: &Option<Session>,
    transport_id: &str,
    producer_id: &str,
    rtp_capabilities: RtpCapabilities,
) -> SignalingResult<Handled> {
    let session = require_session(session)?.clone();
    let source_producer_id: ProducerId = producer_id
        .parse()
        .map_err(|_| SignalingError::ArgumentInvalid(format!("malformed producerId \"{producer_id}\"")))?;

    let room_arc = registry.get(&session.room_id)?;

    // All preconditions are checked under a brief read lock: the transport
    // must be this peer's receive transport, the source producer must exist
    // on another peer, and the router must report it consumable. The engine
    // call itself runs with no room lock held.
    let transport = {
        let room = room_arc.read().await;
        let peer = room
            .peers
            .get(&session.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer \"{}\"", session.peer_id)))?;
        let transport = match peer.transport(transport_id) {
            Some((TransportDirection::Recv, transport)) => transport.clone(),
            Some((TransportDirection::Send, _)) => {
                return Err(SignalingError::ArgumentInvalid(format!(
                    "transport \"{transport_id}\" is the send transport; consuming requires the receive transport"
                )));
            }
            None => {
                return Err(SignalingError::NotFound(format!(
                    "transport \"{transport_id}\""
                )));
            }
        };

        let owner = room
            .find_producer_owner(producer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("producer \"{producer_id}\"")))?;
        if owner.id() == session.peer_id {
            return Err(SignalingError::ArgumentInvalid(
                "cannot consume own producer".to_string(),
            ));
        }

        if !room.router.can_consume(&source_producer_id, &rtp_capabilities) {
            return Err(SignalingError::EngineRejected(format!(
                "producer \"{producer_id}\" is not consumable with the reported capabilities"
            )));
        }

        transport
    };

    let mut options = ConsumerOptions::new(source_producer_id, rtp_capabilities);
    options.paused = false;

    let consumer = engine_call("consume", transport.consume(options))
        .await?
        .map_err(|e| SignalingError::EngineRejected(format!("consume refused: {e}")))?;

    registry.arm_consumer_handlers(&consumer, &session.room_id, &session.peer_id);

    let reply = ResponseData::Consumed {
        id: consumer.id().to_string(),
        producer_id: consumer.producer_id().to_string(),
        kind: consumer.kind(),
        rtp_parameters: consumer.rtp_parameters().clone(),
    };

    // Record under a brief write lock; a peer torn down mid-call drops the
    // consumer instead, closing it.
    {
        let mut room = room_arc.write().await;
        room.peers
            .get_mut(&session.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer \"{}\"", session.peer_id)))?
            .add_consumer(consumer);
    }
    metrics.consumer_created();

    Ok(Handled::reply(reply))
}

async fn resume_consumer(
    registry: &Arc<RoomRegistry>,
    session: &Option<Session>,
    consumer_id: &str,
) -> SignalingResult<Handled> {
    let session = require_session(session)?;
    let room_arc = registry.get(&session.room_id)?;

    let consumer = {
        let room = room_arc.read().await;
        let peer = room
            .peers
            .get(&session.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer \"{}\"", session.peer_id)))?;
        peer.consumer(consumer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("consumer \"{consumer_id}\"")))?
            .clone()
    };

    engine_call("resume-consumer", consumer.resume())
        .await?
        .map_err(|e| SignalingError::EngineFailed(format!("resume failed: {e}")))?;

    Ok(Handled::reply(ResponseData::Success { success: true }))
}

async fn get_producers(
    registry: &Arc<RoomRegistry>,
    session: &Option<Session>,
) -> SignalingResult<Handled> {
    let session = require_session(session)?;
    let room_arc = registry.get(&session.room_id)?;
    let room = room_arc.read().await;

    if !room.peers.contains_key(&session.peer_id) {
        return Err(SignalingError::NotFound(format!(
            "peer \"{}\"",
            session.peer_id
        )));
    }

    Ok(Handled::reply(ResponseData::Producers {
        producers: room.list_producers(&session.peer_id),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::media::WorkerPool;
    use std::num::{NonZeroU32, NonZeroU8};

    struct Client {
        session: Option<Session>,
        tx: mpsc::Sender<Arc<String>>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                session: None,
                tx,
                rx,
            }
        }

        fn next_event(&mut self) -> serde_json::Value {
            let frame = self.rx.try_recv().expect("expected a queued event");
            serde_json::from_str(&frame).unwrap()
        }
    }

    async fn test_env() -> (Arc<RoomRegistry>, Metrics) {
        let config = Arc::new(Config {
            num_workers: 1,
            ..Config::default()
        });
        let pool = Arc::new(WorkerPool::new(&config).await.unwrap());
        let metrics = Metrics::new();
        (RoomRegistry::new(pool, config, metrics.clone()), metrics)
    }

    /// Runs one request for `client` the way the connection loop does,
    /// including the post-acknowledgment fan-out.
    async fn call(
        registry: &Arc<RoomRegistry>,
        metrics: &Metrics,
        client: &mut Client,
        method: RequestMethod,
    ) -> SignalingResult<ResponseData> {
        let handled =
            dispatch(registry, metrics, &mut client.session, &client.tx, method).await?;
        if let Some(fanout) = handled.fanout {
            registry
                .broadcast(&fanout.room_id, Some(&fanout.excluding_peer_id), &fanout.event)
                .await;
        }
        Ok(handled.data)
    }

    async fn join(
        registry: &Arc<RoomRegistry>,
        metrics: &Metrics,
        client: &mut Client,
        room_id: &str,
        peer_id: &str,
    ) -> SignalingResult<ResponseData> {
        call(
            registry,
            metrics,
            client,
            RequestMethod::JoinRoom {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
            },
        )
        .await
    }

    fn audio_rtp_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters::Audio {
                mime_type: MimeTypeAudio::Opus,
                payload_type: 111,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(0x1AFE),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters::default(),
        }
    }

    fn audio_rtp_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(100),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
        }
    }

    fn send_transport_id(data: &ResponseData) -> String {
        match data {
            ResponseData::Joined { send_transport, .. } => send_transport.id.clone(),
            _ => panic!("expected join reply"),
        }
    }

    fn recv_transport_id(data: &ResponseData) -> String {
        match data {
            ResponseData::Joined { recv_transport, .. } => recv_transport.id.clone(),
            _ => panic!("expected join reply"),
        }
    }

    #[tokio::test]
    async fn single_join_returns_both_transports_and_capabilities() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();

        let reply = join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        match reply {
            ResponseData::Joined {
                send_transport,
                recv_transport,
                router_rtp_capabilities,
            } => {
                assert_ne!(send_transport.id, recv_transport.id);
                assert!(!router_rtp_capabilities.codecs.is_empty());
            }
            _ => panic!("expected join reply"),
        }

        // No other members, so no peer-joined anywhere.
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_join_notifies_the_first_peer_only() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();
        let mut b = Client::new();

        join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        join(&registry, &metrics, &mut b, "r1", "b").await.unwrap();

        let event = a.next_event();
        assert_eq!(event["event"], "peer-joined");
        assert_eq!(event["data"]["peerId"], "b");
        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_twice_on_one_channel_is_a_conflict() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();

        join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        let err = join(&registry, &metrics, &mut a, "r2", "a").await.unwrap_err();
        assert!(matches!(err, SignalingError::Conflict(_)));
    }

    #[tokio::test]
    async fn produce_fans_out_to_other_peers_and_late_joiners_enumerate_it() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();
        let mut b = Client::new();

        let a_joined = join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        join(&registry, &metrics, &mut b, "r1", "b").await.unwrap();
        a.next_event(); // peer-joined b

        let reply = call(
            &registry,
            &metrics,
            &mut a,
            RequestMethod::Produce {
                transport_id: send_transport_id(&a_joined),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            },
        )
        .await
        .unwrap();
        let producer_id = match reply {
            ResponseData::Produced { id } => id,
            _ => panic!("expected produce reply"),
        };

        let event = b.next_event();
        assert_eq!(event["event"], "new-producer");
        assert_eq!(event["data"]["peerId"], "a");
        assert_eq!(event["data"]["producerId"], producer_id.as_str());
        assert_eq!(event["data"]["kind"], "audio");

        // Late joiner bootstrap sees exactly a's producer, never its own.
        let mut c = Client::new();
        join(&registry, &metrics, &mut c, "r1", "c").await.unwrap();
        let reply = call(&registry, &metrics, &mut c, RequestMethod::GetProducers)
            .await
            .unwrap();
        match reply {
            ResponseData::Producers { producers } => {
                assert_eq!(producers.len(), 1);
                assert_eq!(producers[0].peer_id, "a");
                assert_eq!(producers[0].producer_id, producer_id);
            }
            _ => panic!("expected producer list"),
        }
    }

    #[tokio::test]
    async fn producing_on_the_receive_transport_is_refused() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();

        let joined = join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        let err = call(
            &registry,
            &metrics,
            &mut a,
            RequestMethod::Produce {
                transport_id: recv_transport_id(&joined),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::ArgumentInvalid(_)));
    }

    #[tokio::test]
    async fn self_consume_is_refused_and_cross_consume_works() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();
        let mut b = Client::new();

        let a_joined = join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        let b_joined = join(&registry, &metrics, &mut b, "r1", "b").await.unwrap();
        a.next_event(); // peer-joined b

        let reply = call(
            &registry,
            &metrics,
            &mut a,
            RequestMethod::Produce {
                transport_id: send_transport_id(&a_joined),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            },
        )
        .await
        .unwrap();
        let producer_id = match reply {
            ResponseData::Produced { id } => id,
            _ => panic!("expected produce reply"),
        };
        b.next_event(); // new-producer

        let err = call(
            &registry,
            &metrics,
            &mut a,
            RequestMethod::Consume {
                transport_id: recv_transport_id(&a_joined),
                producer_id: producer_id.clone(),
                rtp_capabilities: audio_rtp_capabilities(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::ArgumentInvalid(_)));

        let reply = call(
            &registry,
            &metrics,
            &mut b,
            RequestMethod::Consume {
                transport_id: recv_transport_id(&b_joined),
                producer_id: producer_id.clone(),
                rtp_capabilities: audio_rtp_capabilities(),
            },
        )
        .await
        .unwrap();
        let consumer_id = match reply {
            ResponseData::Consumed {
                id,
                producer_id: source,
                kind,
                ..
            } => {
                assert_eq!(source, producer_id);
                assert_eq!(kind, MediaKind::Audio);
                id
            }
            _ => panic!("expected consume reply"),
        };

        let reply = call(
            &registry,
            &metrics,
            &mut b,
            RequestMethod::ResumeConsumer { consumer_id },
        )
        .await
        .unwrap();
        assert!(matches!(reply, ResponseData::Success { success: true }));
    }

    #[tokio::test]
    async fn producer_close_cascades_to_remote_consumers() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();
        let mut b = Client::new();

        let a_joined = join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        let b_joined = join(&registry, &metrics, &mut b, "r1", "b").await.unwrap();
        a.next_event(); // peer-joined b

        let reply = call(
            &registry,
            &metrics,
            &mut a,
            RequestMethod::Produce {
                transport_id: send_transport_id(&a_joined),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            },
        )
        .await
        .unwrap();
        let producer_id = match reply {
            ResponseData::Produced { id } => id,
            _ => panic!("expected produce reply"),
        };
        b.next_event(); // new-producer

        let reply = call(
            &registry,
            &metrics,
            &mut b,
            RequestMethod::Consume {
                transport_id: recv_transport_id(&b_joined),
                producer_id: producer_id.clone(),
                rtp_capabilities: audio_rtp_capabilities(),
            },
        )
        .await
        .unwrap();
        let consumer_id = match reply {
            ResponseData::Consumed { id, .. } => id,
            _ => panic!("expected consume reply"),
        };

        // Engine-side producer close: dropping the last handle closes the
        // producer in the worker, which notifies b's consumer.
        registry.drop_producer("r1", "a", &producer_id).await;

        {
            let room_arc = registry.get("r1").unwrap();
            let room = room_arc.read().await;
            assert!(!room.peers.get("a").unwrap().has_producer(&producer_id));
        }

        // The producer-close event crosses the worker boundary; poll until
        // the consumer cascade lands.
        let mut consumer_gone = false;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let room_arc = registry.get("r1").unwrap();
            let room = room_arc.read().await;
            if room.peers.get("b").unwrap().consumer(&consumer_id).is_none() {
                consumer_gone = true;
                break;
            }
        }
        assert!(
            consumer_gone,
            "consumer should be dropped once its source producer closes"
        );
    }

    #[tokio::test]
    async fn consuming_an_unknown_producer_is_not_found() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();
        let mut b = Client::new();

        join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        let b_joined = join(&registry, &metrics, &mut b, "r1", "b").await.unwrap();

        let err = call(
            &registry,
            &metrics,
            &mut b,
            RequestMethod::Consume {
                transport_id: recv_transport_id(&b_joined),
                producer_id: uuid::Uuid::new_v4().to_string(),
                rtp_capabilities: audio_rtp_capabilities(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));
    }

    #[tokio::test]
    async fn teardown_hides_producers_and_emits_peer_left() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();
        let mut b = Client::new();

        let a_joined = join(&registry, &metrics, &mut a, "r1", "a").await.unwrap();
        join(&registry, &metrics, &mut b, "r1", "b").await.unwrap();
        a.next_event(); // peer-joined b

        call(
            &registry,
            &metrics,
            &mut a,
            RequestMethod::Produce {
                transport_id: send_transport_id(&a_joined),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            },
        )
        .await
        .unwrap();
        b.next_event(); // new-producer

        // A disconnects.
        registry.remove_peer("r1", "a").await;

        let event = b.next_event();
        assert_eq!(event["event"], "peer-left");
        assert_eq!(event["data"]["peerId"], "a");

        let reply = call(&registry, &metrics, &mut b, RequestMethod::GetProducers)
            .await
            .unwrap();
        match reply {
            ResponseData::Producers { producers } => assert!(producers.is_empty()),
            _ => panic!("expected producer list"),
        }
    }

    #[tokio::test]
    async fn requests_before_join_are_refused() {
        let (registry, metrics) = test_env().await;
        let mut a = Client::new();

        let err = call(&registry, &metrics, &mut a, RequestMethod::GetProducers)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));
    }
}
