use relaycast_media::EngineError;
use relaycast_protocol::DecodeError;
use thiserror::Error;
use uuid::Uuid;

/// Everything a signaling request or the startup sequence can fail with.
///
/// Only `EngineInit` is fatal. Every other variant is turned into an
/// `{error: message}` reply for the originating connection.
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Media engine failed to start: {0}")]
    EngineInit(#[source] EngineError),

    #[error("Session {0} already exists")]
    DuplicateSession(Uuid),

    #[error("Session {0} not found")]
    UnknownSession(Uuid),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Failed to create transport: {0}")]
    TransportAllocation(#[source] EngineError),

    #[error("Transport not found: {0}")]
    UnknownTransport(String),

    #[error("Failed to connect transport: {0}")]
    DtlsNegotiation(#[source] EngineError),

    #[error("No transport has been created for this session")]
    NoTransport,

    #[error("Failed to produce: {0}")]
    Produce(#[source] EngineError),

    #[error("Producer not found: {0}")]
    UnknownProducer(String),

    #[error("Cannot consume producer {0}: RTP capabilities are not compatible")]
    IncompatibleCapabilities(String),

    #[error("Failed to consume: {0}")]
    Consume(#[source] EngineError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

impl From<DecodeError> for SfuError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownMethod(method) => SfuError::UnknownMethod(method),
            other => SfuError::InvalidRequest(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
