//! Signaling core
//!
//! One [`Session`] per client connection, indexed by the [`SessionRegistry`].
//! Producers are shared across sessions through the [`ProducerDirectory`].

mod directory;
mod registry;
mod session;

pub use directory::{ConsumerRef, ProducerDirectory, ProducerSummary};
pub use registry::{ConsumerClosed, SessionRegistry};
pub use session::{CloseSummary, OrphanedConsumer, Session};
