//! Presentation surface for remote audio.
//!
//! Mounting a track is a side channel of the call: the controller tells the
//! surface what to render and when to clear it, but the surface's contents are
//! not part of the session state.

use crate::media::RemoteTrack;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Something that can render subscribed remote audio.
pub trait AudioSurface: Send + Sync {
    /// Mounts `track` for playback.
    fn attach(&self, track: &RemoteTrack);
    /// Removes everything mounted so far.
    fn detach_all(&self);
}

/// An [`AudioSurface`] that only remembers what is mounted.
#[derive(Debug, Default)]
pub struct TrackRack {
    mounted: Mutex<Vec<RemoteTrack>>,
}

impl TrackRack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mounted(&self) -> Vec<RemoteTrack> {
        self.mounted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AudioSurface for TrackRack {
    fn attach(&self, track: &RemoteTrack) {
        info!(sid = %track.sid, name = %track.name, "Mounting remote audio");
        self.mounted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(track.clone());
    }

    fn detach_all(&self) {
        self.mounted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
