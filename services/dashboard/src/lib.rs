//! Voice Dashboard Service
//!
//! Terminal front end for `voice-dashboard-core`: environment configuration,
//! backend selection and the line-oriented console.

pub mod config;
pub mod console;

use config::MediaBackend;
use std::sync::Arc;
use voice_dashboard_core::media::{MediaService, loopback::LoopbackMediaService};

/// Builds the media service for the configured backend.
pub fn media_service(backend: &MediaBackend) -> anyhow::Result<Arc<dyn MediaService>> {
    match backend {
        MediaBackend::Loopback => Ok(Arc::new(LoopbackMediaService::new())),
        #[cfg(feature = "livekit")]
        MediaBackend::LiveKit => Ok(Arc::new(
            voice_dashboard_core::media::livekit::LiveKitMediaService::new(),
        )),
        #[cfg(not(feature = "livekit"))]
        MediaBackend::LiveKit => anyhow::bail!(
            "this build has no LiveKit support; rebuild with `--features livekit` or run with --loopback"
        ),
    }
}
