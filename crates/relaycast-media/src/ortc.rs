//! Capability negotiation between the router, producers and consumers.
//!
//! Producers send with whatever payload types their client picked. Before a
//! producer can be consumed its codecs are rewritten onto the router's payload
//! types ("consumable" parameters), and a consumer receives the subset of those
//! codecs that its own declared capabilities can decode.

use crate::engine::{EngineError, Result};
use relaycast_protocol::{
    CodecParameters, MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension,
    RtpHeaderExtensionParameters, RtpParameters,
};
use std::collections::HashSet;
use std::ops::RangeInclusive;

const DYNAMIC_PAYLOAD_TYPES: RangeInclusive<u8> = 100..=127;

/// Header extensions the router offers to every endpoint
fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind: Some(kind),
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
    };

    vec![
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(
            MediaKind::Audio,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ext(MediaKind::Video, "urn:3gpp:video-orientation", 11),
    ]
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

/// Common view over codec capabilities and negotiated codec parameters
trait CodecDescriptor {
    fn mime_type(&self) -> &str;
    fn clock_rate(&self) -> u32;
    fn channels(&self) -> Option<u8>;
    fn parameters(&self) -> &CodecParameters;
}

impl CodecDescriptor for RtpCodecCapability {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
    fn channels(&self) -> Option<u8> {
        self.channels
    }
    fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }
}

impl CodecDescriptor for RtpCodecParameters {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
    fn channels(&self) -> Option<u8> {
        self.channels
    }
    fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }
}

fn packetization_mode(parameters: &CodecParameters) -> u64 {
    parameters
        .get("packetization-mode")
        .and_then(|value| {
            value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0)
}

fn codecs_match(a: &impl CodecDescriptor, b: &impl CodecDescriptor) -> bool {
    if !a.mime_type().eq_ignore_ascii_case(b.mime_type()) || a.clock_rate() != b.clock_rate() {
        return false;
    }

    if MediaKind::from_mime_type(a.mime_type()) == Some(MediaKind::Audio)
        && a.channels().unwrap_or(1) != b.channels().unwrap_or(1)
    {
        return false;
    }

    // H264 streams are only interchangeable with the same packetization mode
    if a.mime_type().eq_ignore_ascii_case("video/h264")
        && packetization_mode(a.parameters()) != packetization_mode(b.parameters())
    {
        return false;
    }

    true
}

fn is_rtx_mime(mime_type: &str) -> bool {
    mime_type.to_ascii_lowercase().ends_with("/rtx")
}

/// Build the router capability set from the configured media codecs.
pub fn generate_router_rtp_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities> {
    if media_codecs.is_empty() {
        return Err(EngineError::InvalidCodec(
            "router needs at least one media codec".to_string(),
        ));
    }

    let mut used_payload_types: HashSet<u8> = HashSet::new();
    for codec in media_codecs {
        if let Some(pt) = codec.preferred_payload_type {
            if !used_payload_types.insert(pt) {
                return Err(EngineError::InvalidCodec(format!(
                    "duplicate preferred payload type {}",
                    pt
                )));
            }
        }
    }
    let mut free_payload_types =
        DYNAMIC_PAYLOAD_TYPES.filter(|pt| !used_payload_types.contains(pt));

    let mut codecs: Vec<RtpCodecCapability> = Vec::with_capacity(media_codecs.len());
    for codec in media_codecs {
        if is_rtx_mime(&codec.mime_type) {
            return Err(EngineError::InvalidCodec(format!(
                "{} cannot be configured directly",
                codec.mime_type
            )));
        }

        match MediaKind::from_mime_type(&codec.mime_type) {
            Some(kind) if kind == codec.kind => {}
            _ => {
                return Err(EngineError::InvalidCodec(format!(
                    "{} does not match kind {}",
                    codec.mime_type, codec.kind
                )))
            }
        }

        if codec.clock_rate == 0 {
            return Err(EngineError::InvalidCodec(format!(
                "{} has no clock rate",
                codec.mime_type
            )));
        }

        if codecs.iter().any(|existing| codecs_match(existing, codec)) {
            return Err(EngineError::InvalidCodec(format!(
                "{} is configured twice",
                codec.mime_type
            )));
        }

        let preferred_payload_type = match codec.preferred_payload_type {
            Some(pt) => pt,
            None => free_payload_types.next().ok_or_else(|| {
                EngineError::InvalidCodec("ran out of dynamic payload types".to_string())
            })?,
        };

        let rtcp_feedback = if codec.rtcp_feedback.is_empty() {
            default_rtcp_feedback(codec.kind)
        } else {
            codec.rtcp_feedback.clone()
        };

        codecs.push(RtpCodecCapability {
            kind: codec.kind,
            mime_type: codec.mime_type.clone(),
            preferred_payload_type: Some(preferred_payload_type),
            clock_rate: codec.clock_rate,
            channels: match codec.kind {
                MediaKind::Audio => Some(codec.channels.unwrap_or(1)),
                MediaKind::Video => None,
            },
            parameters: codec.parameters.clone(),
            rtcp_feedback,
        });
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: default_header_extensions(),
    })
}

/// Check producer RTP parameters against the router before accepting them.
pub fn validate_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router: &RtpCapabilities,
) -> Result<()> {
    if rtp_parameters.encodings.is_empty() {
        return Err(EngineError::InvalidRtpParameters(
            "at least one encoding is required".to_string(),
        ));
    }

    let mut payload_types = HashSet::new();
    let mut media_codecs = 0;

    for codec in &rtp_parameters.codecs {
        if !payload_types.insert(codec.payload_type) {
            return Err(EngineError::InvalidRtpParameters(format!(
                "duplicate payload type {}",
                codec.payload_type
            )));
        }

        if codec.is_rtx() {
            continue;
        }
        media_codecs += 1;

        if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
            return Err(EngineError::InvalidRtpParameters(format!(
                "codec {} cannot be used for {} media",
                codec.mime_type, kind
            )));
        }

        let supported = router
            .codecs
            .iter()
            .any(|capability| capability.kind == kind && codecs_match(capability, codec));
        if !supported {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }
    }

    if media_codecs == 0 {
        return Err(EngineError::InvalidRtpParameters(
            "at least one media codec is required".to_string(),
        ));
    }

    Ok(())
}

/// Rewrite producer parameters onto the router's codec payload types.
///
/// Expects parameters already accepted by [`validate_rtp_parameters`].
pub fn consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router: &RtpCapabilities,
) -> RtpParameters {
    let codecs = rtp_parameters
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx())
        .filter_map(|codec| {
            let capability = router
                .codecs
                .iter()
                .find(|capability| capability.kind == kind && codecs_match(*capability, codec))?;

            Some(RtpCodecParameters {
                mime_type: capability.mime_type.clone(),
                payload_type: capability.preferred_payload_type?,
                clock_rate: capability.clock_rate,
                channels: capability.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: capability.rtcp_feedback.clone(),
            })
        })
        .collect();

    let header_extensions = router
        .header_extensions
        .iter()
        .filter(|ext| ext.kind.map_or(true, |ext_kind| ext_kind == kind))
        .map(|ext| RtpHeaderExtensionParameters {
            uri: ext.uri.clone(),
            id: ext.preferred_id,
            encrypt: ext.preferred_encrypt,
        })
        .collect();

    RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: rtp_parameters.encodings.clone(),
        rtcp: RtcpParameters {
            cname: rtp_parameters.rtcp.cname.clone(),
            reduced_size: true,
        },
    }
}

/// Whether a consumer declaring `capabilities` can decode the producer
pub fn can_consume(consumable: &RtpParameters, capabilities: &RtpCapabilities) -> bool {
    consumable
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx())
        .any(|codec| {
            capabilities
                .codecs
                .iter()
                .any(|capability| codecs_match(capability, codec))
        })
}

/// Negotiate the parameters a new consumer receives with.
pub fn consumer_rtp_parameters(
    producer_id: &str,
    kind: MediaKind,
    consumable: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Result<RtpParameters> {
    let codecs: Vec<RtpCodecParameters> = consumable
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx())
        .filter_map(|codec| {
            let capability = capabilities
                .codecs
                .iter()
                .find(|capability| codecs_match(*capability, codec))?;

            let mut negotiated = codec.clone();
            negotiated
                .rtcp_feedback
                .retain(|fb| capability.rtcp_feedback.contains(fb));
            Some(negotiated)
        })
        .collect();

    if codecs.is_empty() {
        return Err(EngineError::IncompatibleCapabilities(producer_id.to_string()));
    }

    let header_extensions = consumable
        .header_extensions
        .iter()
        .filter(|ext| {
            capabilities.header_extensions.iter().any(|declared| {
                declared.uri == ext.uri && declared.kind.map_or(true, |k| k == kind)
            })
        })
        .cloned()
        .collect();

    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(rand::random::<u32>()),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: consumable.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}
