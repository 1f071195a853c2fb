//! Per-connection signaling session
//!
//! A `Session` owns every transport, producer and consumer created on behalf
//! of one client connection. Engine calls run without holding the session
//! lock; a resource that comes back after the session closed is released
//! immediately instead of being recorded.

use super::directory::{ConsumerRef, ProducerDirectory, ProducerSummary};
use crate::error::{Result, SfuError};
use crate::router::RouterRegistry;
use relaycast_media::EngineError;
use relaycast_protocol::{
    ConsumeReply, ConsumeRequest, DtlsParameters, MediaKind, ProduceReply, ProduceRequest,
    RtpCapabilities, TransportInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

struct TransportEntry {
    id: String,
    /// Local DTLS parameters, with the negotiated role once connected
    dtls_parameters: DtlsParameters,
}

struct ConsumerEntry {
    producer_id: String,
}

#[derive(Default)]
struct SessionState {
    closed: bool,
    /// In creation order
    transports: Vec<TransportEntry>,
    producers: HashMap<String, MediaKind>,
    consumers: HashMap<String, ConsumerEntry>,
}

/// Which transport to use when a request does not name one
#[derive(Clone, Copy)]
enum Fallback {
    First,
    Latest,
}

impl SessionState {
    fn transport(&self, requested: Option<&str>, fallback: Fallback) -> Result<&TransportEntry> {
        if self.transports.is_empty() {
            return Err(SfuError::NoTransport);
        }

        match requested {
            Some(id) => self
                .transports
                .iter()
                .find(|t| t.id == id)
                .ok_or_else(|| SfuError::UnknownTransport(id.to_string())),
            None => match fallback {
                Fallback::First => self.transports.first(),
                Fallback::Latest => self.transports.last(),
            }
            .ok_or(SfuError::NoTransport),
        }
    }
}

/// A consumer in another session whose producer was closed with this one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedConsumer {
    pub producer_id: String,
    pub consumer: ConsumerRef,
}

/// Resources released by [`Session::close`]
#[derive(Debug, Default)]
pub struct CloseSummary {
    pub transports: Vec<String>,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    pub orphaned: Vec<OrphanedConsumer>,
}

/// Ids of the resources a session currently owns
#[cfg(test)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub closed: bool,
    pub transports: Vec<String>,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
}

pub struct Session {
    connection_id: Uuid,
    router: Arc<RouterRegistry>,
    directory: Arc<ProducerDirectory>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        connection_id: Uuid,
        router: Arc<RouterRegistry>,
        directory: Arc<ProducerDirectory>,
    ) -> Self {
        Self {
            connection_id,
            router,
            directory,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn ensure_open(&self) -> Result<()> {
        self.open_state().await.map(|_| ())
    }

    async fn open_state(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(SfuError::SessionClosed);
        }
        Ok(state)
    }

    pub async fn get_capabilities(&self) -> Result<RtpCapabilities> {
        self.ensure_open().await?;
        Ok(self.router.capabilities().clone())
    }

    pub async fn create_transport(&self) -> Result<TransportInfo> {
        self.ensure_open().await?;

        let engine = self.router.engine();
        let info = engine
            .create_webrtc_transport(self.router.transport_options())
            .await
            .map_err(SfuError::TransportAllocation)?;

        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            engine.close_transport(&info.id).await;
            return Err(SfuError::SessionClosed);
        }

        state.transports.push(TransportEntry {
            id: info.id.clone(),
            dtls_parameters: info.dtls_parameters.clone(),
        });

        tracing::info!(
            "Transport {} created for session {} ({} candidates)",
            info.id,
            self.connection_id,
            info.ice_candidates.len()
        );

        Ok(info)
    }

    /// Apply the client's DTLS parameters. Without an explicit id the most
    /// recently created transport is connected.
    pub async fn connect_transport(
        &self,
        transport_id: Option<&str>,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let transport_id = {
            let state = self.open_state().await?;
            match state.transport(transport_id, Fallback::Latest) {
                Ok(entry) => entry.id.clone(),
                Err(SfuError::NoTransport) => {
                    return Err(SfuError::UnknownTransport(
                        transport_id.unwrap_or("<none>").to_string(),
                    ))
                }
                Err(e) => return Err(e),
            }
        };

        let local = self
            .router
            .engine()
            .connect_transport(&transport_id, dtls_parameters)
            .await
            .map_err(|e| match e {
                EngineError::TransportNotFound(id) => SfuError::UnknownTransport(id),
                other => SfuError::DtlsNegotiation(other),
            })?;

        let mut state = self.open_state().await?;
        if let Some(entry) = state.transports.iter_mut().find(|t| t.id == transport_id) {
            entry.dtls_parameters = local;
        }

        tracing::debug!("Transport {} connected", transport_id);
        Ok(())
    }

    pub async fn produce(&self, request: ProduceRequest) -> Result<ProduceReply> {
        let transport_id = {
            let state = self.open_state().await?;
            state
                .transport(request.transport_id.as_deref(), Fallback::First)?
                .id
                .clone()
        };

        let engine = self.router.engine();
        let producer = engine
            .produce(&transport_id, request.kind, request.rtp_parameters)
            .await
            .map_err(|e| match e {
                EngineError::TransportNotFound(id) => SfuError::UnknownTransport(id),
                other => SfuError::Produce(other),
            })?;

        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            engine.close_producer(&producer.id).await;
            return Err(SfuError::SessionClosed);
        }

        state.producers.insert(producer.id.clone(), producer.kind);
        self.directory
            .insert(
                producer.id.clone(),
                ProducerSummary {
                    owner: self.connection_id,
                    kind: producer.kind,
                    consumable_rtp_parameters: Arc::new(producer.consumable_rtp_parameters),
                },
            )
            .await;

        tracing::info!(
            "Session {} producing {} ({})",
            self.connection_id,
            producer.kind,
            producer.id
        );

        Ok(ProduceReply { id: producer.id })
    }

    /// Create a consumer of any session's producer. Errors are checked in
    /// order: unknown producer, incompatible capabilities, missing transport.
    pub async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeReply> {
        self.ensure_open().await?;

        let producer = self
            .directory
            .lookup(&request.producer_id)
            .await
            .ok_or_else(|| SfuError::UnknownProducer(request.producer_id.clone()))?;

        if !self
            .router
            .can_consume(&producer.consumable_rtp_parameters, &request.rtp_capabilities)
        {
            return Err(SfuError::IncompatibleCapabilities(request.producer_id));
        }

        let transport_id = {
            let state = self.open_state().await?;
            state
                .transport(request.transport_id.as_deref(), Fallback::First)?
                .id
                .clone()
        };

        let engine = self.router.engine();
        let consumer = engine
            .consume(&transport_id, &request.producer_id, &request.rtp_capabilities)
            .await
            .map_err(|e| match e {
                EngineError::ProducerNotFound(id) => SfuError::UnknownProducer(id),
                EngineError::IncompatibleCapabilities(id) => SfuError::IncompatibleCapabilities(id),
                EngineError::TransportNotFound(id) => SfuError::UnknownTransport(id),
                other => SfuError::Consume(other),
            })?;

        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            engine.close_consumer(&consumer.id).await;
            return Err(SfuError::SessionClosed);
        }

        let reference = ConsumerRef {
            connection_id: self.connection_id,
            consumer_id: consumer.id.clone(),
        };
        if !self
            .directory
            .attach_consumer(&request.producer_id, reference)
            .await
        {
            // Producer closed while the engine was creating the consumer
            drop(state);
            engine.close_consumer(&consumer.id).await;
            return Err(SfuError::UnknownProducer(request.producer_id));
        }

        state.consumers.insert(
            consumer.id.clone(),
            ConsumerEntry {
                producer_id: consumer.producer_id.clone(),
            },
        );

        let Some(transport) = state.transports.iter().find(|t| t.id == transport_id) else {
            return Err(SfuError::UnknownTransport(transport_id));
        };

        tracing::info!(
            "Session {} consuming {} producer {} of session {}",
            self.connection_id,
            producer.kind,
            consumer.producer_id,
            producer.owner
        );

        Ok(ConsumeReply {
            id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            dtls_parameters: transport.dtls_parameters.clone(),
        })
    }

    /// Drop a consumer whose producer went away. Returns false if the
    /// session no longer holds it.
    pub async fn release_consumer(&self, consumer_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            !state.closed && state.consumers.remove(consumer_id).is_some()
        };

        if removed {
            self.router.engine().close_consumer(consumer_id).await;
        }
        removed
    }

    /// Release everything the session owns. Consumers go first, then
    /// producers, then transports. Calling this again is a no-op.
    pub async fn close(&self) -> CloseSummary {
        let (transports, producers, consumers) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return CloseSummary::default();
            }
            state.closed = true;
            (
                std::mem::take(&mut state.transports),
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };

        let engine = self.router.engine();
        let mut summary = CloseSummary::default();

        for (consumer_id, entry) in consumers {
            engine.close_consumer(&consumer_id).await;
            let reference = ConsumerRef {
                connection_id: self.connection_id,
                consumer_id: consumer_id.clone(),
            };
            self.directory
                .detach_consumer(&entry.producer_id, &reference)
                .await;
            summary.consumers.push(consumer_id);
        }

        for (producer_id, kind) in producers {
            engine.close_producer(&producer_id).await;
            for consumer in self.directory.remove(&producer_id).await {
                summary.orphaned.push(OrphanedConsumer {
                    producer_id: producer_id.clone(),
                    consumer,
                });
            }
            tracing::debug!("Closed {} producer {}", kind, producer_id);
            summary.producers.push(producer_id);
        }

        for transport in transports {
            engine.close_transport(&transport.id).await;
            summary.transports.push(transport.id);
        }

        tracing::info!(
            "Session {} closed: {} transports, {} producers, {} consumers released",
            self.connection_id,
            summary.transports.len(),
            summary.producers.len(),
            summary.consumers.len()
        );

        summary
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        let mut producers: Vec<String> = state.producers.keys().cloned().collect();
        let mut consumers: Vec<String> = state.consumers.keys().cloned().collect();
        producers.sort();
        consumers.sort();

        SessionSnapshot {
            closed: state.closed,
            transports: state.transports.iter().map(|t| t.id.clone()).collect(),
            producers,
            consumers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::test_support::{
        audio_rtp_parameters, client_capabilities, client_dtls_parameters, setup_router,
    };
    use async_trait::async_trait;
    use relaycast_media::{
        ConsumerInfo, LocalEngine, MediaEngine, ProducerInfo, Result as EngineResult,
        TransportOptions,
    };
    use relaycast_protocol::{DtlsRole, RtpCodecCapability, RtpParameters};
    use tokio::sync::Notify;

    fn session(router: &Arc<RouterRegistry>, directory: &Arc<ProducerDirectory>) -> Session {
        Session::new(Uuid::new_v4(), router.clone(), directory.clone())
    }

    fn produce_audio(transport_id: Option<String>) -> ProduceRequest {
        ProduceRequest {
            transport_id,
            kind: MediaKind::Audio,
            rtp_parameters: audio_rtp_parameters(),
        }
    }

    fn consume(producer_id: &str) -> ConsumeRequest {
        ConsumeRequest {
            transport_id: None,
            producer_id: producer_id.to_string(),
            rtp_capabilities: client_capabilities(),
        }
    }

    #[tokio::test]
    async fn test_produce_requires_transport() {
        let (_, router) = setup_router().await;
        let directory = Arc::new(ProducerDirectory::new());
        let session = session(&router, &directory);

        let result = session.produce(produce_audio(None)).await;
        assert!(matches!(result, Err(SfuError::NoTransport)));

        let result = session.connect_transport(None, client_dtls_parameters()).await;
        assert!(matches!(result, Err(SfuError::UnknownTransport(_))));
    }

    #[tokio::test]
    async fn test_connect_defaults_to_latest_transport() {
        let (_, router) = setup_router().await;
        let directory = Arc::new(ProducerDirectory::new());
        let session = session(&router, &directory);

        let first = session.create_transport().await.unwrap();
        let second = session.create_transport().await.unwrap();

        session
            .connect_transport(None, client_dtls_parameters())
            .await
            .unwrap();

        // The latest transport is now connected, the first one is not
        let result = session
            .connect_transport(Some(&second.id), client_dtls_parameters())
            .await;
        assert!(matches!(result, Err(SfuError::DtlsNegotiation(_))));
        session
            .connect_transport(Some(&first.id), client_dtls_parameters())
            .await
            .unwrap();

        let result = session
            .connect_transport(Some("missing"), client_dtls_parameters())
            .await;
        assert!(matches!(result, Err(SfuError::UnknownTransport(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_produce_and_consume_across_sessions() {
        let (_, router) = setup_router().await;
        let directory = Arc::new(ProducerDirectory::new());
        let sender = session(&router, &directory);
        let viewer = session(&router, &directory);

        let transport = sender.create_transport().await.unwrap();
        sender
            .connect_transport(Some(&transport.id), client_dtls_parameters())
            .await
            .unwrap();
        let produced = sender.produce(produce_audio(None)).await.unwrap();

        viewer.create_transport().await.unwrap();
        viewer
            .connect_transport(None, client_dtls_parameters())
            .await
            .unwrap();
        let reply = viewer.consume(consume(&produced.id)).await.unwrap();

        assert_eq!(reply.producer_id, produced.id);
        assert_eq!(reply.kind, MediaKind::Audio);
        assert_ne!(reply.id, produced.id);
        assert_eq!(reply.dtls_parameters.role, DtlsRole::Server);
        assert_eq!(viewer.snapshot().await.consumers, vec![reply.id.clone()]);
    }

    #[tokio::test]
    async fn test_consume_error_order() {
        let (_, router) = setup_router().await;
        let directory = Arc::new(ProducerDirectory::new());
        let sender = session(&router, &directory);
        let viewer = session(&router, &directory);

        // Unknown producer wins even without a transport
        let result = viewer.consume(consume("nope")).await;
        assert!(matches!(result, Err(SfuError::UnknownProducer(id)) if id == "nope"));
        assert!(viewer.snapshot().await.consumers.is_empty());

        sender.create_transport().await.unwrap();
        let produced = sender.produce(produce_audio(None)).await.unwrap();

        let mut incapable = consume(&produced.id);
        incapable
            .rtp_capabilities
            .codecs
            .retain(|c| c.kind != MediaKind::Audio);
        let result = viewer.consume(incapable).await;
        assert!(matches!(result, Err(SfuError::IncompatibleCapabilities(_))));

        let result = viewer.consume(consume(&produced.id)).await;
        assert!(matches!(result, Err(SfuError::NoTransport)));
        assert!(viewer.snapshot().await.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_everything() {
        let (engine, router) = setup_router().await;
        let directory = Arc::new(ProducerDirectory::new());
        let session = session(&router, &directory);

        session.create_transport().await.unwrap();
        session.produce(produce_audio(None)).await.unwrap();
        assert_eq!(directory.len().await, 1);

        let summary = session.close().await;
        assert_eq!(summary.transports.len(), 1);
        assert_eq!(summary.producers.len(), 1);
        assert!(summary.orphaned.is_empty());
        assert_eq!(directory.len().await, 0);
        assert_eq!(engine.stats().await, Default::default());

        let again = session.close().await;
        assert!(again.transports.is_empty() && again.producers.is_empty());

        let result = session.create_transport().await;
        assert!(matches!(result, Err(SfuError::SessionClosed)));
        assert!(session.snapshot().await.closed);
    }

    #[tokio::test]
    async fn test_close_reports_orphaned_consumers() {
        let (_, router) = setup_router().await;
        let directory = Arc::new(ProducerDirectory::new());
        let sender = session(&router, &directory);
        let viewer = session(&router, &directory);

        sender.create_transport().await.unwrap();
        let produced = sender.produce(produce_audio(None)).await.unwrap();
        viewer.create_transport().await.unwrap();
        let consumed = viewer.consume(consume(&produced.id)).await.unwrap();

        let summary = sender.close().await;
        assert_eq!(
            summary.orphaned,
            vec![OrphanedConsumer {
                producer_id: produced.id.clone(),
                consumer: ConsumerRef {
                    connection_id: viewer.connection_id(),
                    consumer_id: consumed.id.clone(),
                },
            }]
        );

        assert!(viewer.release_consumer(&consumed.id).await);
        assert!(!viewer.release_consumer(&consumed.id).await);
        assert!(viewer.snapshot().await.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_port_exhaustion_leaves_session_usable() {
        let blocker = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let engine = Arc::new(LocalEngine::new(Some((port, port))));
        let options = TransportOptions {
            listen_ip: "127.0.0.1".parse().unwrap(),
            enable_tcp: false,
            ..TransportOptions::default()
        };
        let router = Arc::new(
            RouterRegistry::initialize(
                engine.clone(),
                &crate::state::default_media_codecs(),
                options,
            )
            .await
            .unwrap(),
        );
        let directory = Arc::new(ProducerDirectory::new());
        let first = session(&router, &directory);

        let result = first.create_transport().await;
        assert!(matches!(result, Err(SfuError::TransportAllocation(_))));
        assert!(first.snapshot().await.transports.is_empty());
        assert_eq!(engine.stats().await.transports, 0);

        // Port freed: the same session can retry
        drop(blocker);
        let transport = first.create_transport().await.unwrap();
        assert_eq!(transport.ice_candidates[0].port, port);
        assert_eq!(first.snapshot().await.transports, vec![transport.id]);

        // The only port is now held by that transport
        let second = session(&router, &directory);
        let result = second.create_transport().await;
        assert!(matches!(result, Err(SfuError::TransportAllocation(_))));
        assert!(second.snapshot().await.transports.is_empty());
    }

    /// Delegates to `LocalEngine` but parks transport creation until released
    struct GatedEngine {
        inner: LocalEngine,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MediaEngine for GatedEngine {
        async fn create_router(
            &self,
            media_codecs: &[RtpCodecCapability],
        ) -> EngineResult<RtpCapabilities> {
            self.inner.create_router(media_codecs).await
        }

        async fn create_webrtc_transport(
            &self,
            options: &TransportOptions,
        ) -> EngineResult<TransportInfo> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.create_webrtc_transport(options).await
        }

        async fn connect_transport(
            &self,
            transport_id: &str,
            dtls_parameters: DtlsParameters,
        ) -> EngineResult<DtlsParameters> {
            self.inner.connect_transport(transport_id, dtls_parameters).await
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
        ) -> EngineResult<ProducerInfo> {
            self.inner.produce(transport_id, kind, rtp_parameters).await
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer_id: &str,
            rtp_capabilities: &RtpCapabilities,
        ) -> EngineResult<ConsumerInfo> {
            self.inner
                .consume(transport_id, producer_id, rtp_capabilities)
                .await
        }

        async fn close_transport(&self, transport_id: &str) {
            self.inner.close_transport(transport_id).await
        }

        async fn close_producer(&self, producer_id: &str) {
            self.inner.close_producer(producer_id).await
        }

        async fn close_consumer(&self, consumer_id: &str) {
            self.inner.close_consumer(consumer_id).await
        }
    }

    #[tokio::test]
    async fn test_transport_created_after_close_is_released() {
        let engine = Arc::new(GatedEngine {
            inner: LocalEngine::new(None),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let options = TransportOptions {
            listen_ip: "127.0.0.1".parse().unwrap(),
            ..TransportOptions::default()
        };
        let router = Arc::new(
            RouterRegistry::initialize(
                engine.clone(),
                &crate::state::default_media_codecs(),
                options,
            )
            .await
            .unwrap(),
        );
        let directory = Arc::new(ProducerDirectory::new());
        let session = Arc::new(session(&router, &directory));

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.create_transport().await }
        });

        engine.entered.notified().await;
        session.close().await;
        engine.release.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SfuError::SessionClosed)));
        assert_eq!(engine.inner.stats().await.transports, 0);
        assert!(session.snapshot().await.transports.is_empty());
    }
}
