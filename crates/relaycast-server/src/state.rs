use crate::router::RouterRegistry;
use crate::sfu::SessionRegistry;
use crate::ws::connections::ConnectionManager;
use relaycast_media::TransportOptions;
use relaycast_protocol::{MediaKind, RtpCodecCapability};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Address the media transports bind to
    pub listen_ip: IpAddr,
    /// Address put into ICE candidates (e.g. the public IP behind NAT)
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub rtc_min_port: Option<u16>,
    pub rtc_max_port: Option<u16>,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some("127.0.0.1".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            rtc_min_port: None,
            rtc_max_port: None,
            media_codecs: default_media_codecs(),
        }
    }
}

/// One video and one audio codec
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Default::default(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Default::default(),
            rtcp_feedback: vec![],
        },
    ]
}

impl Config {
    /// Load from an optional `relaycast.toml` and `RELAYCAST_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("relaycast").required(false))
            .add_source(config::Environment::with_prefix("RELAYCAST"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.port_range()?;

        if config.announced_ip.is_none() && config.listen_ip.is_unspecified() {
            tracing::warn!(
                "announced_ip not set while listening on {}, ICE candidates are unreachable",
                config.listen_ip
            );
        }

        Ok(config)
    }

    /// The configured RTC port range, if any
    pub fn port_range(&self) -> anyhow::Result<Option<(u16, u16)>> {
        match (self.rtc_min_port, self.rtc_max_port) {
            (None, None) => Ok(None),
            (Some(min), Some(max)) if min <= max => Ok(Some((min, max))),
            (Some(min), Some(max)) => {
                anyhow::bail!("rtc_min_port {} is greater than rtc_max_port {}", min, max)
            }
            _ => anyhow::bail!("rtc_min_port and rtc_max_port must be set together"),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub router: Arc<RouterRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    /// The router must already be initialized; sessions cannot exist without it.
    pub fn new(config: Config, router: Arc<RouterRegistry>) -> Self {
        let sessions = Arc::new(SessionRegistry::new(router.clone()));
        let connections = Arc::new(ConnectionManager::new());

        Self {
            config,
            router,
            sessions,
            connections,
        }
    }
}
