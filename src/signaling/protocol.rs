#![forbid(unsafe_code)]

// Wire types for the request/acknowledgment RPC and server-pushed events.
//
// Engine parameter objects (ICE, DTLS, SCTP, RTP) pass through with the serde
// shapes mediasoup defines; this module only shapes the envelopes around them.

use mediasoup::prelude::*;
use mediasoup::sctp_parameters::SctpParameters;
use serde::{Deserialize, Serialize};

/// One inbound RPC call. The `id` is echoed in exactly one acknowledgment.
#[derive(Debug, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub method: RequestMethod,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "kebab-case")]
pub enum RequestMethod {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, peer_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    GetProducers,
}

impl RequestMethod {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::GetProducers => "get-producers",
        }
    }
}

/// The single reply to one request. Success payloads live under `data` so
/// they can never collide with the echoed request id.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub id: u64,
    #[serde(flatten)]
    pub body: AckBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum AckBody {
    Data { data: ResponseData },
    Error { error: String },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    #[serde(rename_all = "camelCase")]
    Joined {
        send_transport: TransportDescription,
        recv_transport: TransportDescription,
        router_rtp_capabilities: RtpCapabilitiesFinalized,
    },
    #[serde(rename_all = "camelCase")]
    Consumed {
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Producers {
        producers: Vec<ProducerSummary>,
    },
    Produced {
        id: String,
    },
    Success {
        success: bool,
    },
}

/// Everything a client needs to bring one WebRTC transport up.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescription {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub sctp_parameters: Option<SctpParameters>,
}

impl From<&WebRtcTransport> for TransportDescription {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
            sctp_parameters: transport.sctp_parameters(),
        }
    }
}

/// One producer as seen by other peers in the room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
}

/// Server-pushed events, delivered best-effort outside the RPC stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_room() {
        let raw = r#"{"id":7,"method":"join-room","data":{"roomId":"r1","peerId":"a"}}"#;
        let request: ClientRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.id, 7);
        match request.method {
            RequestMethod::JoinRoom { room_id, peer_id } => {
                assert_eq!(room_id, "r1");
                assert_eq!(peer_id, "a");
            }
            other => panic!("unexpected method: {}", other.name()),
        }
    }

    #[test]
    fn parses_get_producers_without_data() {
        let raw = r#"{"id":3,"method":"get-producers"}"#;
        let request: ClientRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(request.method, RequestMethod::GetProducers));
    }

    #[test]
    fn rejects_unknown_method() {
        let raw = r#"{"id":1,"method":"teleport","data":{}}"#;
        assert!(serde_json::from_str::<ClientRequest>(raw).is_err());
    }

    #[test]
    fn error_ack_shape() {
        let ack = Ack {
            id: 9,
            body: AckBody::Error {
                error: "not found: transport x".to_string(),
            },
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value, json!({"id": 9, "error": "not found: transport x"}));
    }

    #[test]
    fn produced_ack_shape() {
        let ack = Ack {
            id: 2,
            body: AckBody::Data {
                data: ResponseData::Produced {
                    id: "p-1".to_string(),
                },
            },
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value, json!({"id": 2, "data": {"id": "p-1"}}));
    }

    #[test]
    fn success_ack_shape() {
        let ack = Ack {
            id: 4,
            body: AckBody::Data {
                data: ResponseData::Success { success: true },
            },
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value, json!({"id": 4, "data": {"success": true}}));
    }

    #[test]
    fn notification_field_names_are_camel_case() {
        let event = Notification::NewProducer {
            peer_id: "a".to_string(),
            producer_id: "p".to_string(),
            kind: MediaKind::Video,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "new-producer");
        assert_eq!(value["data"]["peerId"], "a");
        assert_eq!(value["data"]["producerId"], "p");
        assert_eq!(value["data"]["kind"], "video");
    }
}
