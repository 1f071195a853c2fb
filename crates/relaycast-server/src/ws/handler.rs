use super::dispatch::dispatch;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use relaycast_protocol::ServerMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let connection_id = Uuid::new_v4();
    if let Err(e) = state.sessions.on_connect(connection_id).await {
        tracing::error!("Rejecting connection {}: {}", connection_id, e);
        return;
    }

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(connection_id, tx).await;
    state
        .connections
        .send_to_connection(connection_id, &ServerMessage::Connected { connection_id })
        .await;

    tracing::info!("Connection {} opened", connection_id);

    // Forward queued messages to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests are handled one at a time, in arrival order, while the read
    // loop below keeps watching for the close frame
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<String>();
    let worker_state = state.clone();
    tokio::spawn(async move {
        while let Some(text) = request_rx.recv().await {
            let reply = dispatch(&worker_state.sessions, connection_id, &text).await;
            worker_state
                .connections
                .send_to_connection(connection_id, &reply)
                .await;
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if request_tx.send(text.to_string()).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                state
                    .connections
                    .send_to_connection(
                        connection_id,
                        &ServerMessage::Error {
                            message: "Binary frames are not supported".to_string(),
                        },
                    )
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect. Requests still queued or in flight find the
    // session closed and release whatever they allocated.
    drop(request_tx);
    let closed = state.sessions.on_disconnect(connection_id).await;
    state.connections.remove_connection(connection_id).await;
    send_task.abort();

    for consumer in closed {
        state
            .connections
            .send_to_connection(
                consumer.connection_id,
                &ServerMessage::ConsumerClosed {
                    consumer_id: consumer.consumer_id,
                    producer_id: consumer.producer_id,
                },
            )
            .await;
    }

    tracing::info!(
        "Connection {} closed ({} connections, {} sessions, {} producers remain)",
        connection_id,
        state.connections.len().await,
        state.sessions.len().await,
        state.sessions.producer_count().await
    );
}
