//! Wire protocol shared by relaycast clients and the server.
//!
//! Requests travel as `RequestEnvelope { id, method, data }` JSON text frames and
//! are answered by exactly one `ServerMessage::Response` with the same id.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
