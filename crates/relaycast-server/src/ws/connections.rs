use relaycast_protocol::ServerMessage;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbound message queues of every open WebSocket
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("Connection {} registered", connection_id);
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        if self.senders.write().await.remove(&connection_id).is_some() {
            tracing::debug!("Connection {} unregistered", connection_id);
        }
    }

    /// Queue a message for one connection. Returns false if the connection
    /// is gone or its writer has stopped.
    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(&connection_id) {
            Some(sender) => match sender.send(json) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Failed to send message to {}: {}", connection_id, e);
                    false
                }
            },
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_connection() {
        let manager = ConnectionManager::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.add_connection(id, tx).await;
        let message = ServerMessage::Error {
            message: "boom".to_string(),
        };
        assert!(manager.send_to_connection(id, &message).await);

        let text = rx.recv().await.unwrap();
        assert_eq!(text, r#"{"type":"error","message":"boom"}"#);

        manager.remove_connection(id).await;
        assert!(!manager.send_to_connection(id, &message).await);
        assert_eq!(manager.len().await, 0);
    }
}
