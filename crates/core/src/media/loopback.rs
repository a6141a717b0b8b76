//! An in-process media service for dry runs and tests.
//!
//! `LoopbackMediaService` behaves like a well-behaved room: the connect call
//! succeeds, `Connected` is announced and the "agent" publishes one audio
//! track. Every step can be scripted: connects can fail or be held open until
//! released, automatic events can be turned off and arbitrary events injected
//! into the live connection. Connect and disconnect calls are counted so that
//! callers can check how the handle was treated. Credentials are only kept
//! as a fingerprint.

use super::{
    ConnectOptions, MediaConnection, MediaError, MediaEvent, MediaService, MediaSession,
    RemoteTrack, TrackKind,
};
use crate::token::Credential;
use async_trait::async_trait;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, info};

/// Identity the loopback "agent" publishes its audio under.
pub const LOOPBACK_AGENT_IDENTITY: &str = "loopback-agent";

#[derive(Debug, Clone)]
struct Script {
    connect_failure: Option<String>,
    disconnect_failure: Option<String>,
    announce_connected: bool,
    publish_agent_audio: bool,
    publish_video: bool,
    hold_connects: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect_failure: None,
            disconnect_failure: None,
            announce_connected: true,
            publish_agent_audio: true,
            publish_video: false,
            hold_connects: false,
        }
    }
}

struct Inner {
    script: Mutex<Script>,
    live: Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
    last_credential: Mutex<Option<u64>>,
    last_options: Mutex<Option<ConnectOptions>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    connect_started: Notify,
    releases: Semaphore,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            script: Mutex::default(),
            live: Mutex::default(),
            last_credential: Mutex::default(),
            last_options: Mutex::default(),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            connect_started: Notify::new(),
            releases: Semaphore::new(0),
        }
    }
}

fn fingerprint(token: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    hasher.finish()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted media service. Cloning shares the script and the counters.
#[derive(Clone, Default)]
pub struct LoopbackMediaService {
    inner: Arc<Inner>,
}

impl LoopbackMediaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following connect fail with `reason`.
    pub fn with_connect_failure(self, reason: impl Into<String>) -> Self {
        lock(&self.inner.script).connect_failure = Some(reason.into());
        self
    }

    /// Makes every following disconnect report `reason`.
    pub fn with_disconnect_failure(self, reason: impl Into<String>) -> Self {
        lock(&self.inner.script).disconnect_failure = Some(reason.into());
        self
    }

    /// Turns off the automatic `Connected` and track announcements.
    pub fn silent(self) -> Self {
        {
            let mut script = lock(&self.inner.script);
            script.announce_connected = false;
            script.publish_agent_audio = false;
        }
        self
    }

    /// Also announces a video track after the agent audio.
    pub fn with_video_track(self) -> Self {
        lock(&self.inner.script).publish_video = true;
        self
    }

    /// Holds each connect call until [`release_connect`](Self::release_connect).
    pub fn holding_connects(self) -> Self {
        lock(&self.inner.script).hold_connects = true;
        self
    }

    /// Lets one held connect call proceed.
    pub fn release_connect(&self) {
        self.inner.releases.add_permits(1);
    }

    /// Resolves once a connect call has started (including held ones).
    pub async fn connect_attempted(&self) {
        self.inner.connect_started.notified().await;
    }

    /// Pushes `event` into the most recent live connection.
    ///
    /// Returns `false` when there is no connection or nobody listens anymore.
    pub fn emit(&self, event: MediaEvent) -> bool {
        match lock(&self.inner.live).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Whether the most recent connect call presented `token`.
    pub fn last_credential_was(&self, token: &str) -> bool {
        *lock(&self.inner.last_credential) == Some(fingerprint(token))
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        *lock(&self.inner.last_options)
    }
}

#[async_trait]
impl MediaService for LoopbackMediaService {
    async fn connect(
        &self,
        ws_host: &str,
        credential: Credential,
        options: ConnectOptions,
    ) -> Result<MediaSession, MediaError> {
        let id = self.inner.connects.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.inner.last_credential) = Some(fingerprint(credential.expose()));
        *lock(&self.inner.last_options) = Some(options);
        self.inner.connect_started.notify_one();
        debug!(%ws_host, connection = id, "Loopback connect requested");

        let script = lock(&self.inner.script).clone();
        if script.hold_connects {
            let permit = self
                .inner
                .releases
                .acquire()
                .await
                .map_err(|e| MediaError::ConnectFailed(e.to_string()))?;
            permit.forget();
        }

        if let Some(reason) = script.connect_failure {
            return Err(MediaError::ConnectFailed(reason));
        }

        let (tx, events) = mpsc::unbounded_channel();
        if script.announce_connected {
            let _ = tx.send(MediaEvent::Connected);
        }
        if script.publish_agent_audio && options.audio {
            let _ = tx.send(MediaEvent::TrackSubscribed {
                track: RemoteTrack {
                    sid: format!("TR_loopback_audio_{id}"),
                    name: "agent-voice".to_string(),
                    kind: TrackKind::Audio,
                },
                publication: format!("PUB_loopback_audio_{id}"),
                participant: LOOPBACK_AGENT_IDENTITY.to_string(),
            });
        }
        if script.publish_video {
            let _ = tx.send(MediaEvent::TrackSubscribed {
                track: RemoteTrack {
                    sid: format!("TR_loopback_video_{id}"),
                    name: "agent-camera".to_string(),
                    kind: TrackKind::Video,
                },
                publication: format!("PUB_loopback_video_{id}"),
                participant: LOOPBACK_AGENT_IDENTITY.to_string(),
            });
        }
        *lock(&self.inner.live) = Some(tx);
        info!(connection = id, "Loopback room joined");

        Ok(MediaSession {
            connection: Box::new(LoopbackConnection {
                id,
                inner: self.inner.clone(),
            }),
            events,
        })
    }
}

struct LoopbackConnection {
    id: usize,
    inner: Arc<Inner>,
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    async fn disconnect(&self) -> Result<(), MediaError> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        debug!(connection = self.id, "Loopback disconnect requested");
        lock(&self.inner.live).take();
        match lock(&self.inner.script).disconnect_failure.clone() {
            Some(reason) => Err(MediaError::Disconnect(reason)),
            None => Ok(()),
        }
    }
}
