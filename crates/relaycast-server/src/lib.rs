//! relaycast server library
//!
//! Exposes the signaling server components for testing and embedding.

pub mod api;
pub mod error;
pub mod router;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::Result;
use relaycast_media::{LocalEngine, MediaEngine};
use std::sync::Arc;

/// Create the application with the in-process media engine
pub async fn create_app(config: state::Config) -> Result<axum::Router> {
    let engine = Arc::new(LocalEngine::new(config.port_range()?));
    create_app_with_engine(config, engine).await
}

/// Create the application on top of any media engine. The engine's router is
/// started here; failure to start it is returned before anything listens.
pub async fn create_app_with_engine(
    config: state::Config,
    engine: Arc<dyn MediaEngine>,
) -> Result<axum::Router> {
    let router = router::RouterRegistry::initialize(
        engine,
        &config.media_codecs,
        config.transport_options(),
    )
    .await?;

    let app_state = state::AppState::new(config, Arc::new(router));
    Ok(api::create_router(app_state))
}
