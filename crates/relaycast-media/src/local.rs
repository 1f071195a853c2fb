//! In-process media engine
//!
//! `LocalEngine` owns the negotiation state of every media-plane resource:
//! ICE-lite credentials, the listening sockets backing each transport's host
//! candidates, DTLS fingerprints, and producer/consumer RTP parameters.

use crate::dtls::{self, DtlsCertificate};
use crate::engine::{
    ConsumerInfo, EngineError, MediaEngine, ProducerInfo, Result, TransportOptions,
};
use crate::ortc;
use async_trait::async_trait;
use rand::Rng;
use relaycast_protocol::{
    DtlsParameters, IceCandidate, IceCandidateTcpType, IceCandidateType, IceParameters,
    MediaKind, Protocol, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportInfo,
};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::ice::rand::{generate_pwd, generate_ufrag};

/// Snapshot of the resources the engine currently holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct RouterState {
    capabilities: RtpCapabilities,
    certificate: DtlsCertificate,
}

struct LocalTransport {
    info: TransportInfo,
    /// Held so the advertised ports stay reserved until the transport closes
    udp: Option<UdpSocket>,
    tcp: Option<TcpListener>,
    remote_dtls: Option<DtlsParameters>,
}

impl LocalTransport {
    fn local_addrs(&self) -> Vec<SocketAddr> {
        let udp = self.udp.as_ref().and_then(|s| s.local_addr().ok());
        let tcp = self.tcp.as_ref().and_then(|s| s.local_addr().ok());
        udp.into_iter().chain(tcp).collect()
    }
}

struct LocalProducer {
    transport_id: String,
    kind: MediaKind,
    consumable_rtp_parameters: RtpParameters,
}

struct LocalConsumer {
    transport_id: String,
    producer_id: String,
}

pub struct LocalEngine {
    /// Inclusive RTC port range; `None` binds ephemeral ports
    port_range: Option<(u16, u16)>,
    router: RwLock<Option<RouterState>>,
    transports: RwLock<HashMap<String, LocalTransport>>,
    producers: RwLock<HashMap<String, LocalProducer>>,
    consumers: RwLock<HashMap<String, LocalConsumer>>,
}

impl LocalEngine {
    pub fn new(port_range: Option<(u16, u16)>) -> Self {
        Self {
            port_range,
            router: RwLock::new(None),
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            transports: self.transports.read().await.len(),
            producers: self.producers.read().await.len(),
            consumers: self.consumers.read().await.len(),
        }
    }

    /// Bind a socket on `ip`, walking the configured port range from a random
    /// starting point until a free port is found.
    async fn bind_in_range<T, F, Fut>(&self, ip: IpAddr, bind: F) -> Result<T>
    where
        F: Fn(SocketAddr) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let Some((min, max)) = self.port_range else {
            return Ok(bind(SocketAddr::new(ip, 0)).await?);
        };

        let span = u32::from(max.saturating_sub(min)) + 1;
        let start = rand::thread_rng().gen_range(0..span);

        for offset in 0..span {
            let port = (u32::from(min) + (start + offset) % span) as u16;
            match bind(SocketAddr::new(ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::PortsExhausted { min, max })
    }
}

/// RFC 8445 priority of a host candidate
fn ice_candidate_priority(local_preference: u32) -> u32 {
    const HOST_TYPE_PREFERENCE: u32 = 126;
    const COMPONENT_ID: u32 = 1;
    (HOST_TYPE_PREFERENCE << 24) + (local_preference << 8) + (256 - COMPONENT_ID)
}

fn host_candidate(protocol: Protocol, ip: &str, port: u16, preferred: bool) -> IceCandidate {
    let local_preference = if preferred { 65535 } else { 32767 };
    let (foundation, tcp_type) = match protocol {
        Protocol::Udp => ("udpcandidate", None),
        Protocol::Tcp => ("tcpcandidate", Some(IceCandidateTcpType::Passive)),
    };

    IceCandidate {
        foundation: foundation.to_string(),
        priority: ice_candidate_priority(local_preference),
        ip: ip.to_string(),
        address: ip.to_string(),
        protocol,
        port,
        candidate_type: IceCandidateType::Host,
        tcp_type,
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(&self, media_codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities> {
        let mut router = self.router.write().await;
        if router.is_some() {
            return Err(EngineError::RouterAlreadyCreated);
        }

        let capabilities = ortc::generate_router_rtp_capabilities(media_codecs)?;
        let certificate = DtlsCertificate::generate()?;

        tracing::info!(
            "Router created with {} codecs ({})",
            capabilities.codecs.len(),
            capabilities
                .codecs
                .iter()
                .map(|c| c.mime_type.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        *router = Some(RouterState {
            capabilities: capabilities.clone(),
            certificate,
        });

        Ok(capabilities)
    }

    async fn create_webrtc_transport(&self, options: &TransportOptions) -> Result<TransportInfo> {
        let router = self.router.read().await;
        let router = router.as_ref().ok_or(EngineError::RouterNotCreated)?;

        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::NoProtocolEnabled);
        }

        let udp = if options.enable_udp {
            Some(self.bind_in_range(options.listen_ip, UdpSocket::bind).await?)
        } else {
            None
        };
        let tcp = if options.enable_tcp {
            Some(self.bind_in_range(options.listen_ip, TcpListener::bind).await?)
        } else {
            None
        };

        let announced = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());

        let mut ice_candidates = Vec::new();
        if let Some(socket) = &udp {
            let port = socket.local_addr()?.port();
            ice_candidates.push(host_candidate(
                Protocol::Udp,
                &announced,
                port,
                options.prefer_udp,
            ));
        }
        if let Some(listener) = &tcp {
            let port = listener.local_addr()?.port();
            ice_candidates.push(host_candidate(
                Protocol::Tcp,
                &announced,
                port,
                !options.prefer_udp,
            ));
        }

        let info = TransportInfo {
            id: Uuid::new_v4().to_string(),
            ice_parameters: IceParameters {
                username_fragment: generate_ufrag(),
                password: generate_pwd(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: router.certificate.local_parameters(),
        };

        let transport = LocalTransport {
            info: info.clone(),
            udp,
            tcp,
            remote_dtls: None,
        };
        tracing::debug!(
            "Transport {} listening on {:?}",
            info.id,
            transport.local_addrs()
        );

        self.transports
            .write()
            .await
            .insert(info.id.clone(), transport);

        Ok(info)
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<DtlsParameters> {
        let mut transports = self.transports.write().await;
        let transport = transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;

        if transport.remote_dtls.is_some() {
            return Err(EngineError::AlreadyConnected(transport_id.to_string()));
        }

        dtls::validate_remote(&dtls_parameters)?;

        transport.info.dtls_parameters.role = dtls::local_role_for(dtls_parameters.role);
        transport.remote_dtls = Some(dtls_parameters);

        tracing::debug!(
            "Transport {} connected (local DTLS role {:?})",
            transport_id,
            transport.info.dtls_parameters.role
        );

        Ok(transport.info.dtls_parameters.clone())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo> {
        let router = self.router.read().await;
        let router = router.as_ref().ok_or(EngineError::RouterNotCreated)?;

        if !self.transports.read().await.contains_key(transport_id) {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }

        ortc::validate_rtp_parameters(kind, &rtp_parameters, &router.capabilities)?;
        let consumable_rtp_parameters =
            ortc::consumable_rtp_parameters(kind, &rtp_parameters, &router.capabilities);

        let info = ProducerInfo {
            id: Uuid::new_v4().to_string(),
            kind,
            consumable_rtp_parameters: consumable_rtp_parameters.clone(),
        };

        self.producers.write().await.insert(
            info.id.clone(),
            LocalProducer {
                transport_id: transport_id.to_string(),
                kind,
                consumable_rtp_parameters,
            },
        );

        Ok(info)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        if !self.transports.read().await.contains_key(transport_id) {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }

        let (kind, rtp_parameters) = {
            let producers = self.producers.read().await;
            let producer = producers
                .get(producer_id)
                .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;

            if !ortc::can_consume(&producer.consumable_rtp_parameters, rtp_capabilities) {
                return Err(EngineError::IncompatibleCapabilities(producer_id.to_string()));
            }

            let rtp_parameters = ortc::consumer_rtp_parameters(
                producer_id,
                producer.kind,
                &producer.consumable_rtp_parameters,
                rtp_capabilities,
            )?;
            (producer.kind, rtp_parameters)
        };

        let info = ConsumerInfo {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
        };

        self.consumers.write().await.insert(
            info.id.clone(),
            LocalConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );

        Ok(info)
    }

    async fn close_transport(&self, transport_id: &str) {
        let Some(transport) = self.transports.write().await.remove(transport_id) else {
            return;
        };

        // Anything still attached to the transport goes with it
        self.producers
            .write()
            .await
            .retain(|_, producer| producer.transport_id != transport_id);
        self.consumers
            .write()
            .await
            .retain(|_, consumer| consumer.transport_id != transport_id);

        tracing::debug!(
            "Transport {} closed, released {:?}",
            transport_id,
            transport.local_addrs()
        );
    }

    async fn close_producer(&self, producer_id: &str) {
        if self.producers.write().await.remove(producer_id).is_some() {
            tracing::debug!("Producer {} closed", producer_id);
        }
    }

    async fn close_consumer(&self, consumer_id: &str) {
        if let Some(consumer) = self.consumers.write().await.remove(consumer_id) {
            tracing::debug!(
                "Consumer {} of producer {} closed",
                consumer_id,
                consumer.producer_id
            );
        }
    }
}
