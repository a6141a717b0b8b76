//! The call controller task and the handle used to drive it.
//!
//! One tokio task owns the [`SessionState`]. User commands arrive through a
//! [`CallSession`] handle; token/connect results and media events arrive on an
//! internal queue. Both are processed one message at a time, so transitions
//! never interleave. Observers follow the call through a `watch` channel of
//! [`SessionSnapshot`]s.

use super::state::{CallPhase, SessionSnapshot, SessionState};
use crate::{
    error::CallError,
    media::{ConnectOptions, MediaConnection, MediaEvent, MediaService, MediaSession},
    surface::AudioSurface,
    token::TokenClient,
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DEFAULT_ROOM_NAME: &str = "mre-voice-room";
pub const DEFAULT_IDENTITY: &str = "frontend-caller";
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_QUEUE: usize = 32;

/// Fixed parameters of every call placed by one controller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws_host: String,
    pub room_name: String,
    pub identity: String,
    pub token_timeout: Duration,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub connect_options: ConnectOptions,
}

impl SessionConfig {
    pub fn new(ws_host: impl Into<String>) -> Self {
        Self {
            ws_host: ws_host.into(),
            room_name: DEFAULT_ROOM_NAME.to_string(),
            identity: DEFAULT_IDENTITY.to_string(),
            token_timeout: DEFAULT_TOKEN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            connect_options: ConnectOptions::AUDIO_ONLY,
        }
    }
}

enum Command {
    SetPrompt {
        text: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Start {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
    Toggle {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// How far a setup task has got. Shared between the task and the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupStage {
    FetchingToken,
    Connecting,
    Cancelled,
}

struct PendingSetup {
    epoch: u64,
    stage: Arc<Mutex<SetupStage>>,
    handle: JoinHandle<()>,
}

enum Internal {
    SetupFinished {
        epoch: u64,
        outcome: Result<MediaSession, CallError>,
    },
    Media {
        epoch: u64,
        event: MediaEvent,
    },
}

/// Handle to a running call controller.
///
/// Clones share the same controller. Once the last handle is dropped the
/// controller tears the call down and exits; [`shutdown`](Self::shutdown) does
/// the same and waits for it.
#[derive(Clone)]
pub struct CallSession {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl CallSession {
    /// Spawns the controller task on the current tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        tokens: Arc<dyn TokenClient>,
        media: Arc<dyn MediaService>,
        surface: Arc<dyn AudioSurface>,
    ) -> Self {
        let state = SessionState::new(config.room_name.clone(), config.identity.clone());
        let (snapshot_tx, snapshots) = watch::channel(state.snapshot());
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let controller = Controller {
            state,
            config: Arc::new(config),
            tokens,
            media,
            surface,
            internal_tx,
            snapshot_tx,
            pending_setups: Vec::new(),
            pending_start: None,
            forwarder: None,
        };
        let span = info_span!("call_controller", room = %controller.config.room_name);
        tokio::spawn(controller.run(command_rx, internal_rx).instrument(span));

        Self {
            commands,
            snapshots,
        }
    }

    /// Queues a command and hands back the receiver for its reply.
    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<oneshot::Receiver<T>, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        Ok(response)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let response = self.submit(make).await?;
        response.await.map_err(|_| CallError::ControllerStopped)
    }

    /// Replaces the prompt sent with the next call.
    pub async fn set_prompt(&self, text: impl Into<String>) -> Result<(), CallError> {
        let text = text.into();
        self.request(|reply| Command::SetPrompt { text, reply })
            .await?
    }

    /// Places a call with the current prompt.
    ///
    /// Fails only with [`CallError::AlreadyInCall`] (or when the controller is
    /// gone). Token and connect failures are reported through the status; the
    /// returned future settles once the setup attempt has.
    pub async fn start_call(&self) -> Result<(), CallError> {
        self.begin_start().await?.outcome().await
    }

    /// Queues a start and returns as soon as it is queued.
    ///
    /// Commands sent afterwards through any handle are processed after this
    /// one; the setup outcome is awaited separately through the returned
    /// [`PendingCall`].
    pub async fn begin_start(&self) -> Result<PendingCall, CallError> {
        let response = self.submit(|reply| Command::Start { reply }).await?;
        Ok(PendingCall { response })
    }

    /// Hangs up. Does nothing when there is no call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Starts a call when idle, ends it otherwise.
    pub async fn toggle(&self) -> Result<(), CallError> {
        self.begin_toggle().await?.outcome().await
    }

    /// Queued counterpart of [`toggle`](Self::toggle), see [`begin_start`](Self::begin_start).
    pub async fn begin_toggle(&self) -> Result<PendingCall, CallError> {
        let response = self.submit(|reply| Command::Toggle { reply }).await?;
        Ok(PendingCall { response })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Tears the call down and stops the controller.
    pub async fn shutdown(self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

/// A start or toggle the controller has accepted but not yet answered.
#[must_use = "dropping a PendingCall discards the setup outcome"]
pub struct PendingCall {
    response: oneshot::Receiver<Result<(), CallError>>,
}

impl PendingCall {
    /// Resolves like [`CallSession::start_call`].
    pub async fn outcome(self) -> Result<(), CallError> {
        self.response
            .await
            .map_err(|_| CallError::ControllerStopped)?
    }
}

struct Controller {
    state: SessionState,
    config: Arc<SessionConfig>,
    tokens: Arc<dyn TokenClient>,
    media: Arc<dyn MediaService>,
    surface: Arc<dyn AudioSurface>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    pending_setups: Vec<PendingSetup>,
    pending_start: Option<(u64, oneshot::Sender<Result<(), CallError>>)>,
    forwarder: Option<JoinHandle<()>>,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("Call controller started");
        loop {
            tokio::select! {
                biased;
                Some(msg) = internal.recv() => self.handle_internal(msg).await,
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown(&mut internal).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.teardown(&mut internal).await;
                        break;
                    }
                },
            }
        }
        info!("Call controller stopped");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.state.snapshot());
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetPrompt { text, reply } => {
                let result = self.state.set_prompt(text);
                if result.is_ok() {
                    self.publish();
                }
                let _ = reply.send(result);
            }
            Command::Start { reply } => self.start(reply),
            Command::End { reply } => {
                self.end().await;
                let _ = reply.send(());
            }
            Command::Toggle { reply } => {
                if self.state.phase() == CallPhase::Idle {
                    self.start(reply);
                } else {
                    self.end().await;
                    let _ = reply.send(Ok(()));
                }
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, reply: oneshot::Sender<Result<(), CallError>>) {
        let epoch = match self.state.begin_start() {
            Ok(epoch) => epoch,
            Err(err) => {
                warn!(phase = ?self.state.phase(), "Start requested while a call is in progress");
                let _ = reply.send(Err(err));
                return;
            }
        };
        self.publish();
        info!(epoch, prompt_len = self.state.prompt().len(), "Starting call");

        let config = self.config.clone();
        let tokens = self.tokens.clone();
        let media = self.media.clone();
        let prompt = self.state.prompt().to_string();
        let tx = self.internal_tx.clone();
        let stage = Arc::new(Mutex::new(SetupStage::FetchingToken));
        let task_stage = stage.clone();
        let span = info_span!("call_setup", epoch);
        let handle = tokio::spawn(
            async move {
                let outcome = establish(
                    &config,
                    tokens.as_ref(),
                    media.as_ref(),
                    &prompt,
                    &task_stage,
                )
                .await;
                let _ = tx.send(Internal::SetupFinished { epoch, outcome });
            }
            .instrument(span),
        );
        self.pending_setups.push(PendingSetup {
            epoch,
            stage,
            handle,
        });
        self.pending_start = Some((epoch, reply));
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::SetupFinished { epoch, outcome } => {
                self.pending_setups.retain(|setup| setup.epoch != epoch);
                self.finish_setup(epoch, outcome).await;
                self.publish();
                self.resolve_start(Some(epoch));
            }
            Internal::Media { epoch, event } => {
                self.handle_media(epoch, event);
                self.publish();
            }
        }
    }

    async fn finish_setup(&mut self, epoch: u64, outcome: Result<MediaSession, CallError>) {
        match outcome {
            Ok(MediaSession { connection, events }) => {
                match self.state.adopt_connection(epoch, connection) {
                    Ok(()) => {
                        info!(epoch, "Media connection open, waiting for agent audio");
                        self.spawn_forwarder(epoch, events);
                    }
                    Err(stale) => {
                        warn!(epoch, "Connection arrived for a cancelled call, closing it");
                        self.disconnect(stale).await;
                    }
                }
            }
            Err(err) => {
                let applied = match err {
                    CallError::TokenRequestFailed(_) | CallError::TokenResponseInvalid(_) => {
                        self.state.token_failed(epoch)
                    }
                    _ => self.state.connect_failed(epoch),
                };
                if applied {
                    error!(epoch, error = %err, "Call setup failed");
                } else {
                    debug!(epoch, error = %err, "Ignoring failure of a cancelled call");
                }
            }
        }
    }

    fn handle_media(&mut self, epoch: u64, event: MediaEvent) {
        match event {
            MediaEvent::Connected => {
                if self.state.on_connected(epoch) {
                    info!(epoch, "Call is active");
                }
            }
            MediaEvent::Disconnected => {
                if self.state.on_disconnected(epoch) {
                    info!(epoch, "Room disconnected by remote side");
                    if let Some(forwarder) = self.forwarder.take() {
                        forwarder.abort();
                    }
                    self.surface.detach_all();
                }
            }
            MediaEvent::TrackSubscribed {
                track,
                publication,
                participant,
            } => {
                if self.state.on_track_subscribed(epoch, track.kind) {
                    info!(epoch, sid = %track.sid, %publication, %participant, "Attaching agent audio");
                    self.surface.attach(&track);
                } else {
                    debug!(epoch, sid = %track.sid, kind = %track.kind, "Ignoring track");
                }
            }
        }
    }

    fn spawn_forwarder(&mut self, epoch: u64, mut events: mpsc::UnboundedReceiver<MediaEvent>) {
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Media { epoch, event }).is_err() {
                    return;
                }
            }
            // A stream that ends on its own means the room is gone.
            let _ = tx.send(Internal::Media {
                epoch,
                event: MediaEvent::Disconnected,
            });
        });
        if let Some(previous) = self.forwarder.replace(handle) {
            previous.abort();
        }
    }

    async fn end(&mut self) {
        if !self.state.begin_end() {
            debug!("End requested with no call in progress");
            return;
        }
        self.publish();
        info!("Ending call");

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(connection) = self.state.take_connection() {
            self.disconnect(connection).await;
        }
        self.surface.detach_all();
        self.state.finish_end();
        self.publish();
        self.resolve_start(None);
    }

    async fn teardown(&mut self, internal: &mut mpsc::UnboundedReceiver<Internal>) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(connection) = self.state.teardown() {
            info!("Tearing down open call");
            self.disconnect(connection).await;
        }
        self.surface.detach_all();

        // A setup inside `connect` would leave behind a connection nobody
        // owns, so it is waited for. One still fetching its token holds
        // nothing yet and is dropped.
        for setup in self.pending_setups.drain(..) {
            let connecting = {
                let mut stage = setup.stage.lock().unwrap_or_else(PoisonError::into_inner);
                if *stage == SetupStage::FetchingToken {
                    *stage = SetupStage::Cancelled;
                    false
                } else {
                    true
                }
            };
            if connecting {
                let _ = setup.handle.await;
            } else {
                debug!(epoch = setup.epoch, "Abandoning setup still waiting for its token");
                setup.handle.abort();
            }
        }
        while let Ok(msg) = internal.try_recv() {
            if let Internal::SetupFinished {
                outcome: Ok(session),
                ..
            } = msg
            {
                self.disconnect(session.connection).await;
            }
        }
        self.publish();
        self.resolve_start(None);
    }

    /// Fire-and-forget from the session's point of view: the handle is gone
    /// afterwards whatever the service answers.
    async fn disconnect(&self, connection: Box<dyn MediaConnection>) {
        match timeout(self.config.disconnect_timeout, connection.disconnect()).await {
            Ok(Ok(())) => debug!("Media connection closed"),
            Ok(Err(e)) => warn!(error = %e, "Disconnect failed, handle released anyway"),
            Err(_) => warn!(
                timeout = ?self.config.disconnect_timeout,
                "Disconnect timed out, handle released anyway"
            ),
        }
    }

    /// Answers the caller waiting in `start_call`, if any.
    fn resolve_start(&mut self, epoch: Option<u64>) {
        let matches = match (&self.pending_start, epoch) {
            (Some(_), None) => true,
            (Some((pending, _)), Some(epoch)) => *pending == epoch,
            (None, _) => false,
        };
        if matches {
            if let Some((_, reply)) = self.pending_start.take() {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Token fetch followed by the media connect, both bounded in time.
async fn establish(
    config: &SessionConfig,
    tokens: &dyn TokenClient,
    media: &dyn MediaService,
    prompt: &str,
    stage: &Mutex<SetupStage>,
) -> Result<MediaSession, CallError> {
    let credential = timeout(
        config.token_timeout,
        tokens.request_token(&config.room_name, &config.identity, prompt),
    )
    .await
    .map_err(|_| {
        CallError::TokenRequestFailed(format!(
            "no answer within {:?}",
            config.token_timeout
        ))
    })??;

    {
        let mut stage = stage.lock().unwrap_or_else(PoisonError::into_inner);
        if *stage == SetupStage::Cancelled {
            return Err(CallError::ControllerStopped);
        }
        *stage = SetupStage::Connecting;
    }

    let session = timeout(
        config.connect_timeout,
        media.connect(&config.ws_host, credential, config.connect_options),
    )
    .await
    .map_err(|_| {
        CallError::MediaConnectFailed(format!(
            "handshake did not finish within {:?}",
            config.connect_timeout
        ))
    })??;

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{MediaError, TokenError},
        media::MockMediaService,
        session::CallStatus,
        surface::TrackRack,
        token::{Credential, MockTokenClient},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    struct CountingConnection {
        disconnects: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl MediaConnection for CountingConnection {
        async fn disconnect(&self) -> Result<(), MediaError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MediaError::Disconnect("socket already closed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            token_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            disconnect_timeout: Duration::from_millis(200),
            ..SessionConfig::new("wss://media.test")
        }
    }

    fn token_ok() -> MockTokenClient {
        let mut tokens = MockTokenClient::new();
        tokens
            .expect_request_token()
            .times(1)
            .returning(|_, _, _| Ok(Credential::new("t1")));
        tokens
    }

    /// A media service whose single connection's event sender is handed back.
    fn media_ok(
        disconnects: Arc<AtomicUsize>,
        fail_disconnect: bool,
    ) -> (MockMediaService, mpsc::UnboundedSender<MediaEvent>) {
        let (tx, events) = mpsc::unbounded_channel();
        let mut media = MockMediaService::new();
        media.expect_connect().times(1).return_once(move |_, _, _| {
            Ok(MediaSession {
                connection: Box::new(CountingConnection {
                    disconnects,
                    fail: fail_disconnect,
                }),
                events,
            })
        });
        (media, tx)
    }

    fn spawn(tokens: MockTokenClient, media: MockMediaService) -> CallSession {
        CallSession::spawn(
            test_config(),
            Arc::new(tokens),
            Arc::new(media),
            Arc::new(TrackRack::new()),
        )
    }

    async fn wait_for_status(session: &CallSession, status: CallStatus) -> SessionSnapshot {
        let mut rx = session.subscribe();
        timeout(WAIT, rx.wait_for(|s| s.status == status))
            .await
            .expect("status not reached in time")
            .expect("controller stopped")
            .clone()
    }

    #[tokio::test]
    async fn test_token_failure_skips_connect() {
        let mut tokens = MockTokenClient::new();
        tokens
            .expect_request_token()
            .times(1)
            .returning(|_, _, _| Err(TokenError::ResponseInvalid("text/html".into())));
        let mut media = MockMediaService::new();
        media.expect_connect().never();

        let session = spawn(tokens, media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::TokenFetchFailed);
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert!(!snapshot.connected);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_handle() {
        let mut media = MockMediaService::new();
        media
            .expect_connect()
            .times(1)
            .returning(|_, _, _| Err(MediaError::ConnectFailed("401".into())));

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::ConnectFailed);
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert!(!snapshot.connected);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_room_identity_and_prompt_reach_token_client() {
        let mut tokens = MockTokenClient::new();
        tokens
            .expect_request_token()
            .withf(|room, user, prompt| {
                room.to_string() == DEFAULT_ROOM_NAME
                    && user.to_string() == DEFAULT_IDENTITY
                    && prompt.to_string() == "Hello agent"
            })
            .times(1)
            .returning(|_, _, _| Err(TokenError::RequestFailed("offline".into())));
        let mut media = MockMediaService::new();
        media.expect_connect().never();

        let session = spawn(tokens, media);
        session.set_prompt("Hello agent").await.unwrap();
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();

        assert_eq!(session.snapshot().status, CallStatus::TokenFetchFailed);
        assert_eq!(session.snapshot().prompt, "Hello agent");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_without_token_request() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (media, _events) = media_ok(disconnects.clone(), false);

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        assert_eq!(session.snapshot().status, CallStatus::AwaitingAgentAudio);
        assert_eq!(session.snapshot().phase, CallPhase::Connecting);

        let err = session.start_call().await.unwrap_err();
        assert!(matches!(err, CallError::AlreadyInCall));
        assert!(matches!(
            session.set_prompt("edited").await,
            Err(CallError::PromptLocked)
        ));
        session.shutdown().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_only_after_connected_event() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (media, events) = media_ok(disconnects.clone(), false);

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        assert_ne!(session.snapshot().status, CallStatus::Active);

        events.send(MediaEvent::Connected).unwrap();
        let snapshot = wait_for_status(&session, CallStatus::Active).await;
        assert_eq!(snapshot.phase, CallPhase::Active);
        assert_eq!(snapshot.toggle_label(), "End Call");

        session.end_call().await.unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::NoCall);
        assert!(!snapshot.connected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        session.shutdown().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_disconnect_does_not_send_disconnect() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (media, events) = media_ok(disconnects.clone(), false);

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        events.send(MediaEvent::Connected).unwrap();
        wait_for_status(&session, CallStatus::Active).await;

        events.send(MediaEvent::Disconnected).unwrap();
        let snapshot = wait_for_status(&session, CallStatus::EndedByAgent).await;
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert!(!snapshot.connected);

        session.shutdown().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_event_stream_ends_call() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (media, events) = media_ok(disconnects.clone(), false);

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        drop(events);

        let snapshot = wait_for_status(&session, CallStatus::EndedByAgent).await;
        assert_eq!(snapshot.phase, CallPhase::Idle);
        session.shutdown().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_disconnect_still_releases_handle() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (media, _events) = media_ok(disconnects.clone(), true);

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        session.end_call().await.unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::NoCall);
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert!(!snapshot.connected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        session.shutdown().await;
    }

    struct StalledTokens;

    #[async_trait]
    impl TokenClient for StalledTokens {
        async fn request_token(
            &self,
            _room: &str,
            _identity: &str,
            _prompt: &str,
        ) -> Result<Credential, TokenError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_token_fetch_is_bounded() {
        let mut media = MockMediaService::new();
        media.expect_connect().never();

        let session = CallSession::spawn(
            test_config(),
            Arc::new(StalledTokens),
            Arc::new(media),
            Arc::new(TrackRack::new()),
        );
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        assert_eq!(session.snapshot().status, CallStatus::TokenFetchFailed);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_token_fetch() {
        let mut media = MockMediaService::new();
        media.expect_connect().never();

        let config = SessionConfig {
            token_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let session = CallSession::spawn(
            config,
            Arc::new(StalledTokens),
            Arc::new(media),
            Arc::new(TrackRack::new()),
        );
        let pending = session.begin_start().await.unwrap();
        let mut snapshots = session.subscribe();
        timeout(WAIT, snapshots.wait_for(|s| s.phase == CallPhase::Connecting))
            .await
            .unwrap()
            .unwrap();

        timeout(WAIT, session.shutdown())
            .await
            .expect("shutdown waited for the stalled token fetch");
        assert!(timeout(WAIT, pending.outcome()).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_end_without_call_is_noop() {
        let mut tokens = MockTokenClient::new();
        tokens.expect_request_token().never();
        let mut media = MockMediaService::new();
        media.expect_connect().never();

        let session = spawn(tokens, media);
        session.end_call().await.unwrap();
        assert_eq!(session.snapshot().status, CallStatus::NoCall);
        assert_eq!(session.snapshot().epoch, 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_unusable_after_controller_stops() {
        let session = spawn(MockTokenClient::new(), MockMediaService::new());
        let other = session.clone();
        session.shutdown().await;

        assert!(matches!(
            other.start_call().await,
            Err(CallError::ControllerStopped)
        ));
    }

    #[tokio::test]
    async fn test_dropping_every_handle_tears_down() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (media, _events) = media_ok(disconnects.clone(), false);

        let session = spawn(token_ok(), media);
        timeout(WAIT, session.start_call()).await.unwrap().unwrap();
        drop(session);

        timeout(WAIT, async {
            while disconnects.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("teardown did not disconnect");
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
