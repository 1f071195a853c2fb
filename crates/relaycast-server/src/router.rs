//! Router Capability Registry
//!
//! Created once at startup. Holds the router's negotiated codec set and the
//! media engine every session talks to. Read-only after initialization.

use crate::error::{Result, SfuError};
use relaycast_media::{ortc, MediaEngine, TransportOptions};
use relaycast_protocol::{RtpCapabilities, RtpCodecCapability, RtpParameters};
use std::sync::Arc;

pub struct RouterRegistry {
    engine: Arc<dyn MediaEngine>,
    capabilities: RtpCapabilities,
    transport_options: TransportOptions,
}

impl RouterRegistry {
    /// Start the engine's router. Failure here is fatal for the process.
    pub async fn initialize(
        engine: Arc<dyn MediaEngine>,
        media_codecs: &[RtpCodecCapability],
        transport_options: TransportOptions,
    ) -> Result<Self> {
        let capabilities = engine
            .create_router(media_codecs)
            .await
            .map_err(SfuError::EngineInit)?;

        tracing::info!(
            "Router ready: {} codecs, {} header extensions",
            capabilities.codecs.len(),
            capabilities.header_extensions.len()
        );

        Ok(Self {
            engine,
            capabilities,
            transport_options,
        })
    }

    pub fn capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    pub fn engine(&self) -> &dyn MediaEngine {
        self.engine.as_ref()
    }

    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    /// Whether a client declaring `rtp_capabilities` can receive a producer
    /// whose consumable parameters are `consumable`.
    pub fn can_consume(
        &self,
        consumable: &RtpParameters,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        ortc::can_consume(consumable, rtp_capabilities)
    }
}
