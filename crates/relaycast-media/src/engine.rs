//! Media Engine Adapter
//!
//! The signaling core never touches ICE, DTLS or RTP itself. Everything that
//! allocates or negotiates media-plane resources goes through [`MediaEngine`].

use async_trait::async_trait;
use relaycast_protocol::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportInfo,
};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("router has not been created")]
    RouterNotCreated,

    #[error("router has already been created")]
    RouterAlreadyCreated,

    #[error("invalid media codec: {0}")]
    InvalidCodec(String),

    #[error("failed to generate DTLS certificate: {0}")]
    Certificate(String),

    #[error("no free port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("transport must enable UDP, TCP or both")]
    NoProtocolEnabled,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("transport {0} is already connected")]
    AlreadyConnected(String),

    #[error("invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("RTP capabilities are not compatible with producer {0}")]
    IncompatibleCapabilities(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Where and how a WebRTC transport listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates instead of `listen_ip`
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some("127.0.0.1".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
    /// The producer's codecs mapped onto the router's payload types
    pub consumable_rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Capability-negotiating media engine.
///
/// Every method may suspend; none may block the runtime. Closing an unknown
/// or already closed resource is a no-op so teardown can run in any order.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start the engine's router with the given codec set and return the
    /// resulting router capabilities.
    async fn create_router(&self, media_codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities>;

    async fn create_webrtc_transport(&self, options: &TransportOptions) -> Result<TransportInfo>;

    /// Apply the remote endpoint's DTLS parameters and return the transport's
    /// local DTLS parameters with the role it settled on.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<DtlsParameters>;

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo>;

    async fn close_transport(&self, transport_id: &str);

    async fn close_producer(&self, producer_id: &str);

    async fn close_consumer(&self, consumer_id: &str);
}
