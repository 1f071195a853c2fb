//! Media engine side of relaycast
//!
//! This crate provides:
//! - The `MediaEngine` adapter trait the signaling core calls into
//! - ORTC-style capability matching between router, producers and consumers
//! - `LocalEngine`, the in-process engine the server runs with

pub mod dtls;
pub mod engine;
pub mod local;
pub mod ortc;

pub use engine::*;
pub use local::{EngineStats, LocalEngine};
