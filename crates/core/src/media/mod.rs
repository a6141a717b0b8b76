//! Abstraction over the hosted real-time media service.
//!
//! The controller never talks to a concrete SDK. It asks a [`MediaService`] for
//! a connection, receives an exclusively owned [`MediaConnection`] handle plus
//! the connection's event stream, and reacts to the [`MediaEvent`]s arriving on
//! that stream.

#[cfg(feature = "livekit")]
pub mod livekit;
pub mod loopback;

use crate::{error::MediaError, token::Credential};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Kind of a remote media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A track published by a remote participant and subscribed by us.
///
/// The track's lifetime belongs to the media service; this is only a
/// description of it that a presentation surface can mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub sid: String,
    pub name: String,
    pub kind: TrackKind,
}

/// Events emitted on a connection's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The transport handshake completed.
    Connected,
    /// The remote side closed the room or the transport dropped.
    Disconnected,
    /// A remote track was subscribed.
    TrackSubscribed {
        track: RemoteTrack,
        /// Sid of the publication the track was subscribed through.
        publication: String,
        /// Identity of the participant publishing the track.
        participant: String,
    },
}

/// Capabilities requested when joining a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub audio: bool,
    pub video: bool,
}

impl ConnectOptions {
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

/// Handle to an established media connection.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Asks the service to leave the room. The service owns the cleanup of its
    /// own tracks.
    async fn disconnect(&self) -> Result<(), MediaError>;
}

/// An established connection together with its event stream.
pub struct MediaSession {
    pub connection: Box<dyn MediaConnection>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

/// Entry point of a media backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaService: Send + Sync {
    async fn connect(
        &self,
        ws_host: &str,
        credential: Credential,
        options: ConnectOptions,
    ) -> Result<MediaSession, MediaError>;
}
