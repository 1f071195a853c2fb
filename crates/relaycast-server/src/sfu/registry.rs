use super::directory::ProducerDirectory;
use super::session::Session;
use crate::error::{Result, SfuError};
use crate::router::RouterRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A consumer closed on behalf of another connection, to be announced to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerClosed {
    pub connection_id: Uuid,
    pub consumer_id: String,
    pub producer_id: String,
}

/// Maps live connections to their sessions
pub struct SessionRegistry {
    router: Arc<RouterRegistry>,
    directory: Arc<ProducerDirectory>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(router: Arc<RouterRegistry>) -> Self {
        Self {
            router,
            directory: Arc::new(ProducerDirectory::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create the empty session for a newly accepted connection
    pub async fn on_connect(&self, connection_id: Uuid) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&connection_id) {
            return Err(SfuError::DuplicateSession(connection_id));
        }

        let session = Arc::new(Session::new(
            connection_id,
            self.router.clone(),
            self.directory.clone(),
        ));
        sessions.insert(connection_id, session.clone());

        tracing::info!(
            "Session {} opened ({} active)",
            connection_id,
            sessions.len()
        );
        Ok(session)
    }

    pub async fn get(&self, connection_id: Uuid) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or(SfuError::UnknownSession(connection_id))
    }

    /// Tear down a connection's session. Consumers that other sessions held
    /// on its producers are closed too and returned so their owners can be
    /// told. Unknown connections are ignored.
    pub async fn on_disconnect(&self, connection_id: Uuid) -> Vec<ConsumerClosed> {
        let Some(session) = self.sessions.write().await.remove(&connection_id) else {
            return Vec::new();
        };

        let summary = session.close().await;

        let mut closed = Vec::new();
        for orphan in summary.orphaned {
            let owner = self
                .sessions
                .read()
                .await
                .get(&orphan.consumer.connection_id)
                .cloned();
            let Some(owner) = owner else {
                continue;
            };

            if owner.release_consumer(&orphan.consumer.consumer_id).await {
                closed.push(ConsumerClosed {
                    connection_id: orphan.consumer.connection_id,
                    consumer_id: orphan.consumer.consumer_id,
                    producer_id: orphan.producer_id,
                });
            }
        }

        if !closed.is_empty() {
            tracing::info!(
                "Closed {} consumers that depended on session {}",
                closed.len(),
                connection_id
            );
        }

        closed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of producers currently consumable across all sessions
    pub async fn producer_count(&self) -> usize {
        self.directory.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::test_support::{audio_rtp_parameters, client_capabilities, setup_router};
    use relaycast_protocol::{ConsumeRequest, MediaKind, ProduceRequest};

    #[tokio::test]
    async fn test_connect_and_duplicate() {
        let (_, router) = setup_router().await;
        let registry = SessionRegistry::new(router);
        let id = Uuid::new_v4();

        registry.on_connect(id).await.unwrap();
        assert!(matches!(
            registry.on_connect(id).await,
            Err(SfuError::DuplicateSession(dup)) if dup == id
        ));
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(id).await.unwrap().connection_id(), id);

        let missing = Uuid::new_v4();
        assert!(matches!(
            registry.get(missing).await,
            Err(SfuError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_closes_dependent_consumers() {
        let (engine, router) = setup_router().await;
        let registry = SessionRegistry::new(router);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let sender = registry.on_connect(a).await.unwrap();
        let viewer = registry.on_connect(b).await.unwrap();

        sender.create_transport().await.unwrap();
        let produced = sender
            .produce(ProduceRequest {
                transport_id: None,
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            })
            .await
            .unwrap();
        assert_eq!(registry.producer_count().await, 1);

        viewer.create_transport().await.unwrap();
        let consumed = viewer
            .consume(ConsumeRequest {
                transport_id: None,
                producer_id: produced.id.clone(),
                rtp_capabilities: client_capabilities(),
            })
            .await
            .unwrap();

        let closed = registry.on_disconnect(a).await;
        assert_eq!(
            closed,
            vec![ConsumerClosed {
                connection_id: b,
                consumer_id: consumed.id,
                producer_id: produced.id,
            }]
        );
        assert_eq!(registry.len().await, 1);
        assert!(matches!(registry.get(a).await, Err(SfuError::UnknownSession(_))));
        assert_eq!(registry.producer_count().await, 0);
        assert!(viewer.snapshot().await.consumers.is_empty());

        let stats = engine.stats().await;
        assert_eq!((stats.transports, stats.producers, stats.consumers), (1, 0, 0));

        // Second disconnect of the same id is a no-op
        assert!(registry.on_disconnect(a).await.is_empty());

        registry.on_disconnect(b).await;
        assert_eq!(registry.len().await, 0);
        assert_eq!(engine.stats().await, Default::default());
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_transports() {
        let (_, router) = setup_router().await;
        let registry = SessionRegistry::new(router);

        let first = registry.on_connect(Uuid::new_v4()).await.unwrap();
        let second = registry.on_connect(Uuid::new_v4()).await.unwrap();

        let transport = first.create_transport().await.unwrap();
        let result = second
            .produce(ProduceRequest {
                transport_id: Some(transport.id.clone()),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            })
            .await;

        assert!(matches!(result, Err(SfuError::NoTransport)));

        second.create_transport().await.unwrap();
        let result = second
            .produce(ProduceRequest {
                transport_id: Some(transport.id),
                kind: MediaKind::Audio,
                rtp_parameters: audio_rtp_parameters(),
            })
            .await;
        assert!(matches!(result, Err(SfuError::UnknownTransport(_))));
    }
}
