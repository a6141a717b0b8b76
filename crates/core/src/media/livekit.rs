//! LiveKit backend for [`MediaService`], enabled with the `livekit` feature.

use super::{
    ConnectOptions, MediaConnection, MediaError, MediaEvent, MediaService, MediaSession,
    RemoteTrack, TrackKind,
};
use crate::token::Credential;
use async_trait::async_trait;
use livekit::prelude::{RemoteTrack as LiveKitTrack, Room, RoomEvent, RoomOptions};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Joins LiveKit rooms through the native Rust SDK.
#[derive(Debug, Default, Clone)]
pub struct LiveKitMediaService;

impl LiveKitMediaService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaService for LiveKitMediaService {
    async fn connect(
        &self,
        ws_host: &str,
        credential: Credential,
        options: ConnectOptions,
    ) -> Result<MediaSession, MediaError> {
        // Subscription is all-or-nothing in the SDK; unwanted kinds are
        // filtered out of the event stream below.
        let mut room_options = RoomOptions::default();
        room_options.auto_subscribe = options.audio || options.video;

        let (room, mut room_events) = Room::connect(ws_host, credential.expose(), room_options)
            .await
            .map_err(|e| MediaError::ConnectFailed(e.to_string()))?;
        info!(room = %room.name(), "Joined LiveKit room");

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = room_events.recv().await {
                let Some(mapped) = map_room_event(event, options) else {
                    continue;
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
            debug!("LiveKit event stream closed");
        });

        Ok(MediaSession {
            connection: Box::new(LiveKitConnection { room }),
            events,
        })
    }
}

/// Translates the SDK's room events, dropping track kinds not asked for.
fn map_room_event(event: RoomEvent, options: ConnectOptions) -> Option<MediaEvent> {
    match event {
        RoomEvent::Connected { .. } => Some(MediaEvent::Connected),
        RoomEvent::Disconnected { .. } => Some(MediaEvent::Disconnected),
        RoomEvent::TrackSubscribed {
            track,
            publication,
            participant,
            ..
        } => {
            let kind = match &track {
                LiveKitTrack::Audio(_) => TrackKind::Audio,
                LiveKitTrack::Video(_) => TrackKind::Video,
            };
            let wanted = match kind {
                TrackKind::Audio => options.audio,
                TrackKind::Video => options.video,
            };
            if !wanted {
                debug!(sid = %track.sid(), %kind, "Dropping track of an unrequested kind");
                return None;
            }
            Some(MediaEvent::TrackSubscribed {
                track: RemoteTrack {
                    sid: track.sid().to_string(),
                    name: track.name(),
                    kind,
                },
                publication: publication.sid().to_string(),
                participant: participant.identity().to_string(),
            })
        }
        _ => None,
    }
}

struct LiveKitConnection {
    room: Room,
}

#[async_trait]
impl MediaConnection for LiveKitConnection {
    async fn disconnect(&self) -> Result<(), MediaError> {
        self.room
            .close()
            .await
            .map_err(|e| MediaError::Disconnect(e.to_string()))
    }
}
