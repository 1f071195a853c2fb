use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};

/// Signaling method names as they appear on the wire
pub mod method {
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const CONSUME: &str = "consume";
}

/// A request sent from client to server. Every request expects exactly one
/// `ServerMessage::Response` carrying the same `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid {method} payload: {source}")]
    InvalidPayload {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    pub dtls_parameters: DtlsParameters,
}

/// `connectTransport` accepts either the wrapped form or bare DTLS parameters
#[derive(Deserialize)]
#[serde(untagged)]
enum ConnectTransportPayload {
    Wrapped(ConnectTransportRequest),
    Bare(DtlsParameters),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

/// Decoded signaling request
#[derive(Debug, Clone)]
pub enum Request {
    GetRouterRtpCapabilities,
    CreateTransport,
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
}

impl Request {
    pub fn decode(method_name: &str, data: Value) -> Result<Self, DecodeError> {
        match method_name {
            method::GET_ROUTER_RTP_CAPABILITIES => Ok(Request::GetRouterRtpCapabilities),
            method::CREATE_TRANSPORT => Ok(Request::CreateTransport),
            method::CONNECT_TRANSPORT => {
                let payload: ConnectTransportPayload = parse(method::CONNECT_TRANSPORT, data)?;
                Ok(Request::ConnectTransport(match payload {
                    ConnectTransportPayload::Wrapped(request) => request,
                    ConnectTransportPayload::Bare(dtls_parameters) => ConnectTransportRequest {
                        transport_id: None,
                        dtls_parameters,
                    },
                }))
            }
            method::PRODUCE => Ok(Request::Produce(parse(method::PRODUCE, data)?)),
            method::CONSUME => Ok(Request::Consume(parse(method::CONSUME, data)?)),
            other => Err(DecodeError::UnknownMethod(other.to_string())),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities => method::GET_ROUTER_RTP_CAPABILITIES,
            Request::CreateTransport => method::CREATE_TRANSPORT,
            Request::ConnectTransport(_) => method::CONNECT_TRANSPORT,
            Request::Produce(_) => method::PRODUCE,
            Request::Consume(_) => method::CONSUME,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    method: &'static str,
    data: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload { method, source })
}

/// Payload of a failed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Session established for this connection
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: Uuid },

    /// Reply to a request; on failure `data` is an `ErrorReply`
    Response { id: u64, ok: bool, data: Value },

    /// A frame that could not be decoded as a request at all
    Error { message: String },

    /// A consumer was closed because its producer went away
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
}

impl ServerMessage {
    pub fn success(id: u64, data: Value) -> Self {
        ServerMessage::Response { id, ok: true, data }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        let reply = ErrorReply {
            error: error.into(),
        };
        ServerMessage::Response {
            id,
            ok: false,
            data: serde_json::to_value(reply).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_unit_methods_ignore_payload() {
        assert!(matches!(
            Request::decode("getRouterRtpCapabilities", Value::Null),
            Ok(Request::GetRouterRtpCapabilities)
        ));
        assert!(matches!(
            Request::decode("createTransport", json!({})),
            Ok(Request::CreateTransport)
        ));
    }

    #[test]
    fn test_decode_connect_transport_bare_and_wrapped() {
        let dtls = json!({
            "role": "client",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
        });

        let bare = Request::decode("connectTransport", dtls.clone()).unwrap();
        match bare {
            Request::ConnectTransport(request) => assert!(request.transport_id.is_none()),
            other => panic!("Expected ConnectTransport, got {:?}", other),
        }

        let wrapped = Request::decode(
            "connectTransport",
            json!({ "transportId": "t1", "dtlsParameters": dtls }),
        )
        .unwrap();
        match wrapped {
            Request::ConnectTransport(request) => {
                assert_eq!(request.transport_id.as_deref(), Some("t1"))
            }
            other => panic!("Expected ConnectTransport, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_payload_and_method() {
        let err = Request::decode("produce", json!({ "kind": "smell" })).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { method: "produce", .. }));

        let err = Request::decode("pause", Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "unknown method: pause");
    }

    #[test]
    fn test_server_message_shapes() {
        let failure = serde_json::to_value(ServerMessage::failure(3, "Cannot consume")).unwrap();
        assert_eq!(
            failure,
            json!({
                "type": "response",
                "id": 3,
                "ok": false,
                "data": { "error": "Cannot consume" }
            })
        );

        let closed = serde_json::to_value(ServerMessage::ConsumerClosed {
            consumer_id: "c".to_string(),
            producer_id: "p".to_string(),
        })
        .unwrap();
        assert_eq!(
            closed,
            json!({ "type": "consumerClosed", "consumerId": "c", "producerId": "p" })
        );
    }
}
