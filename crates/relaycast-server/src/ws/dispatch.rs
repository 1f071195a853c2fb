//! Signaling Dispatcher
//!
//! Turns one inbound text frame into exactly one outbound message.

use crate::error::{Result, SfuError};
use crate::sfu::SessionRegistry;
use relaycast_protocol::{Request, RequestEnvelope, ServerMessage};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub async fn dispatch(
    registry: &SessionRegistry,
    connection_id: Uuid,
    text: &str,
) -> ServerMessage {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Malformed request from {}: {}", connection_id, e);
            return ServerMessage::Error {
                message: format!("Invalid request envelope: {}", e),
            };
        }
    };

    // A frame that carries an id is answered on that id, however broken
    // the rest of it is
    let recovered_id = frame.get("id").and_then(Value::as_u64);

    let envelope: RequestEnvelope = match serde_json::from_value(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Malformed request from {}: {}", connection_id, e);
            let message = format!("Invalid request envelope: {}", e);
            return match recovered_id {
                Some(id) => ServerMessage::failure(id, message),
                None => ServerMessage::Error { message },
            };
        }
    };

    let id = envelope.id;
    let method = envelope.method.clone();

    match handle(registry, connection_id, envelope).await {
        Ok(data) => ServerMessage::success(id, data),
        Err(e) => {
            tracing::warn!("{} from {} failed: {}", method, connection_id, e);
            ServerMessage::failure(id, e.to_string())
        }
    }
}

async fn handle(
    registry: &SessionRegistry,
    connection_id: Uuid,
    envelope: RequestEnvelope,
) -> Result<Value> {
    let request = Request::decode(&envelope.method, envelope.data)?;
    let session = registry.get(connection_id).await?;

    tracing::debug!(
        "{} request {} from {}",
        request.method(),
        envelope.id,
        connection_id
    );

    match request {
        Request::GetRouterRtpCapabilities => to_value(session.get_capabilities().await?),
        Request::CreateTransport => to_value(session.create_transport().await?),
        Request::ConnectTransport(request) => {
            session
                .connect_transport(request.transport_id.as_deref(), request.dtls_parameters)
                .await?;
            Ok(Value::Object(Default::default()))
        }
        Request::Produce(request) => to_value(session.produce(request).await?),
        Request::Consume(request) => to_value(session.consume(request).await?),
    }
}

fn to_value<T: Serialize>(reply: T) -> Result<Value> {
    serde_json::to_value(reply).map_err(|e| SfuError::InvalidRequest(e.to_string()))
}
