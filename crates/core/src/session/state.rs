//! Call state and its transitions.
//!
//! `SessionState` is plain data plus synchronous transition methods. It does no
//! I/O: the controller decides when to call the media service and feeds the
//! results back in here. Every transition that concerns a particular call
//! attempt carries that attempt's epoch, and anything tagged with an epoch other
//! than the current one is refused.

use crate::{error::CallError, media::MediaConnection, media::TrackKind};
use std::fmt;

/// Coarse lifecycle phase of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Connecting,
    Active,
}

/// The user-facing status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    NoCall,
    Starting,
    AwaitingAgentAudio,
    Active,
    EndedByAgent,
    Disconnecting,
    TokenFetchFailed,
    ConnectFailed,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallStatus::NoCall => "No call initiated",
            CallStatus::Starting => "Starting call…",
            CallStatus::AwaitingAgentAudio => "Connected, waiting for agent audio…",
            CallStatus::Active => "Call is active",
            CallStatus::EndedByAgent => "Call ended by agent",
            CallStatus::Disconnecting => "Disconnecting…",
            CallStatus::TokenFetchFailed => "Token fetch failed",
            CallStatus::ConnectFailed => "LiveKit connect failed",
        };
        f.write_str(text)
    }
}

/// What a presentation layer needs to draw the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: CallPhase,
    pub status: CallStatus,
    pub prompt: String,
    pub epoch: u64,
    pub connected: bool,
}

impl SessionSnapshot {
    /// Label of the single start/end toggle.
    pub fn toggle_label(&self) -> &'static str {
        match self.phase {
            CallPhase::Idle => "Start Call",
            CallPhase::Connecting | CallPhase::Active => "End Call",
        }
    }

    pub fn prompt_editable(&self) -> bool {
        self.phase == CallPhase::Idle
    }
}

/// The single call owned by a controller.
pub struct SessionState {
    room_name: String,
    identity: String,
    prompt: String,
    phase: CallPhase,
    status: CallStatus,
    epoch: u64,
    connection: Option<Box<dyn MediaConnection>>,
}

impl SessionState {
    pub fn new(room_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            identity: identity.into(),
            prompt: String::new(),
            phase: CallPhase::Idle,
            status: CallStatus::NoCall,
            epoch: 0,
            connection: None,
        }
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// True while `epoch` names the call attempt in progress.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.phase != CallPhase::Idle && epoch == self.epoch
    }

    /// Replaces the prompt. Refused while a call is in progress.
    pub fn set_prompt(&mut self, text: String) -> Result<(), CallError> {
        if self.phase != CallPhase::Idle {
            return Err(CallError::PromptLocked);
        }
        self.prompt = text;
        Ok(())
    }

    /// Idle → Connecting. Returns the epoch of the new attempt.
    pub fn begin_start(&mut self) -> Result<u64, CallError> {
        if self.phase != CallPhase::Idle {
            return Err(CallError::AlreadyInCall);
        }
        self.epoch += 1;
        self.phase = CallPhase::Connecting;
        self.status = CallStatus::Starting;
        Ok(self.epoch)
    }

    /// Connecting → Idle after the token could not be obtained.
    pub fn token_failed(&mut self, epoch: u64) -> bool {
        self.abort_setup(epoch, CallStatus::TokenFetchFailed)
    }

    /// Connecting → Idle after the media connect failed.
    pub fn connect_failed(&mut self, epoch: u64) -> bool {
        self.abort_setup(epoch, CallStatus::ConnectFailed)
    }

    fn abort_setup(&mut self, epoch: u64, status: CallStatus) -> bool {
        if !self.is_current(epoch) || self.phase != CallPhase::Connecting || self.has_connection() {
            return false;
        }
        self.phase = CallPhase::Idle;
        self.status = status;
        true
    }

    /// Takes ownership of a freshly opened connection.
    ///
    /// A connection that arrives for an attempt which has since been ended is
    /// handed back so the caller can close it.
    pub fn adopt_connection(
        &mut self,
        epoch: u64,
        connection: Box<dyn MediaConnection>,
    ) -> Result<(), Box<dyn MediaConnection>> {
        if !self.is_current(epoch) || self.phase != CallPhase::Connecting || self.has_connection() {
            return Err(connection);
        }
        self.connection = Some(connection);
        self.status = CallStatus::AwaitingAgentAudio;
        Ok(())
    }

    /// The transport reported the handshake as complete.
    pub fn on_connected(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) || !self.has_connection() {
            return false;
        }
        self.phase = CallPhase::Active;
        self.status = CallStatus::Active;
        true
    }

    /// Whether a subscribed track of `kind` should be mounted.
    pub fn on_track_subscribed(&self, epoch: u64, kind: TrackKind) -> bool {
        self.is_current(epoch) && self.has_connection() && kind == TrackKind::Audio
    }

    /// The remote side went away. The handle is released without asking the
    /// service to disconnect again.
    pub fn on_disconnected(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.connection = None;
        self.phase = CallPhase::Idle;
        self.status = CallStatus::EndedByAgent;
        self.epoch += 1;
        true
    }

    /// First half of a user-requested hang up.
    ///
    /// Invalidates the current attempt and shows the disconnecting status.
    /// Returns `false` when there is nothing to end.
    pub fn begin_end(&mut self) -> bool {
        if self.phase == CallPhase::Idle {
            return false;
        }
        self.status = CallStatus::Disconnecting;
        self.epoch += 1;
        true
    }

    /// Hands out the connection handle, leaving none behind.
    pub fn take_connection(&mut self) -> Option<Box<dyn MediaConnection>> {
        self.connection.take()
    }

    /// Second half of a hang up.
    pub fn finish_end(&mut self) {
        self.connection = None;
        self.phase = CallPhase::Idle;
        self.status = CallStatus::NoCall;
    }

    /// Unconditional cleanup when the owner goes away.
    pub fn teardown(&mut self) -> Option<Box<dyn MediaConnection>> {
        if self.phase != CallPhase::Idle {
            self.epoch += 1;
        }
        self.phase = CallPhase::Idle;
        self.status = CallStatus::NoCall;
        self.connection.take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            status: self.status,
            prompt: self.prompt.clone(),
            epoch: self.epoch,
            connected: self.has_connection(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use async_trait::async_trait;

    struct NullConnection;

    #[async_trait]
    impl MediaConnection for NullConnection {
        async fn disconnect(&self) -> Result<(), MediaError> {
            Ok(())
        }
    }

    fn connected_state() -> (SessionState, u64) {
        let mut state = SessionState::new("mre-voice-room", "frontend-caller");
        let epoch = state.begin_start().unwrap();
        assert!(state.adopt_connection(epoch, Box::new(NullConnection)).is_ok());
        (state, epoch)
    }

    #[test]
    fn test_status_text() {
        assert_eq!(CallStatus::NoCall.to_string(), "No call initiated");
        assert_eq!(CallStatus::Starting.to_string(), "Starting call…");
        assert_eq!(
            CallStatus::AwaitingAgentAudio.to_string(),
            "Connected, waiting for agent audio…"
        );
        assert_eq!(CallStatus::Active.to_string(), "Call is active");
        assert_eq!(CallStatus::EndedByAgent.to_string(), "Call ended by agent");
        assert_eq!(CallStatus::Disconnecting.to_string(), "Disconnecting…");
        assert_eq!(CallStatus::TokenFetchFailed.to_string(), "Token fetch failed");
        assert_eq!(CallStatus::ConnectFailed.to_string(), "LiveKit connect failed");
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut state = SessionState::new("room", "caller");
        assert_eq!(state.phase(), CallPhase::Idle);
        assert_eq!(state.status(), CallStatus::NoCall);

        let epoch = state.begin_start().unwrap();
        assert_eq!(state.phase(), CallPhase::Connecting);
        assert_eq!(state.status(), CallStatus::Starting);

        assert!(state.adopt_connection(epoch, Box::new(NullConnection)).is_ok());
        assert_eq!(state.phase(), CallPhase::Connecting);
        assert_eq!(state.status(), CallStatus::AwaitingAgentAudio);

        assert!(state.on_connected(epoch));
        assert_eq!(state.phase(), CallPhase::Active);
        assert_eq!(state.status(), CallStatus::Active);

        assert!(state.begin_end());
        assert_eq!(state.status(), CallStatus::Disconnecting);
        assert!(state.take_connection().is_some());
        state.finish_end();
        assert_eq!(state.phase(), CallPhase::Idle);
        assert_eq!(state.status(), CallStatus::NoCall);
        assert!(!state.has_connection());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut state = SessionState::new("room", "caller");
        let epoch = state.begin_start().unwrap();
        assert!(matches!(state.begin_start(), Err(CallError::AlreadyInCall)));
        assert_eq!(state.epoch(), epoch);

        assert!(state.adopt_connection(epoch, Box::new(NullConnection)).is_ok());
        state.on_connected(epoch);
        assert!(matches!(state.begin_start(), Err(CallError::AlreadyInCall)));
    }

    #[test]
    fn test_prompt_locked_while_in_call() {
        let mut state = SessionState::new("room", "caller");
        state.set_prompt("Hello agent".into()).unwrap();
        state.begin_start().unwrap();

        assert!(matches!(
            state.set_prompt("changed".into()),
            Err(CallError::PromptLocked)
        ));
        assert_eq!(state.prompt(), "Hello agent");
    }

    #[test]
    fn test_setup_failures_return_to_idle() {
        let mut state = SessionState::new("room", "caller");
        let epoch = state.begin_start().unwrap();
        assert!(state.token_failed(epoch));
        assert_eq!(state.phase(), CallPhase::Idle);
        assert_eq!(state.status(), CallStatus::TokenFetchFailed);

        let epoch = state.begin_start().unwrap();
        assert!(state.connect_failed(epoch));
        assert_eq!(state.phase(), CallPhase::Idle);
        assert_eq!(state.status(), CallStatus::ConnectFailed);
        assert!(!state.has_connection());
    }

    #[test]
    fn test_connection_for_ended_attempt_is_handed_back() {
        let mut state = SessionState::new("room", "caller");
        let epoch = state.begin_start().unwrap();
        assert!(state.begin_end());
        state.finish_end();

        assert!(state.adopt_connection(epoch, Box::new(NullConnection)).is_err());
        assert!(!state.has_connection());
        assert!(!state.token_failed(epoch));
        assert_eq!(state.status(), CallStatus::NoCall);
    }

    #[test]
    fn test_stale_connection_rejected_after_restart() {
        let mut state = SessionState::new("room", "caller");
        let first = state.begin_start().unwrap();
        state.begin_end();
        state.finish_end();
        let second = state.begin_start().unwrap();
        assert_ne!(first, second);

        assert!(state.adopt_connection(first, Box::new(NullConnection)).is_err());
        assert!(state.adopt_connection(second, Box::new(NullConnection)).is_ok());
    }

    #[test]
    fn test_remote_disconnect_releases_handle() {
        let (mut state, epoch) = connected_state();
        state.on_connected(epoch);

        assert!(state.on_disconnected(epoch));
        assert_eq!(state.phase(), CallPhase::Idle);
        assert_eq!(state.status(), CallStatus::EndedByAgent);
        assert!(!state.has_connection());

        // A repeated event for the same attempt changes nothing.
        assert!(!state.on_disconnected(epoch));
        assert!(!state.on_connected(epoch));
        assert_eq!(state.status(), CallStatus::EndedByAgent);
    }

    #[test]
    fn test_only_audio_tracks_are_mounted() {
        let (state, epoch) = connected_state();
        assert!(state.on_track_subscribed(epoch, TrackKind::Audio));
        assert!(!state.on_track_subscribed(epoch, TrackKind::Video));
        assert!(!state.on_track_subscribed(epoch + 1, TrackKind::Audio));
    }

    #[test]
    fn test_connected_is_idempotent() {
        let (mut state, epoch) = connected_state();
        assert!(state.on_connected(epoch));
        assert!(state.on_connected(epoch));
        assert_eq!(state.phase(), CallPhase::Active);
    }

    #[test]
    fn test_teardown_is_unconditional() {
        let (mut state, epoch) = connected_state();
        state.on_connected(epoch);

        assert!(state.teardown().is_some());
        assert_eq!(state.phase(), CallPhase::Idle);
        assert!(!state.has_connection());
        assert!(state.teardown().is_none());
    }

    #[test]
    fn test_end_from_idle_is_noop() {
        let mut state = SessionState::new("room", "caller");
        assert!(!state.begin_end());
        assert_eq!(state.status(), CallStatus::NoCall);
        assert_eq!(state.epoch(), 0);
    }

    #[test]
    fn test_snapshot_toggle_label() {
        let mut state = SessionState::new("room", "caller");
        assert_eq!(state.snapshot().toggle_label(), "Start Call");
        assert!(state.snapshot().prompt_editable());

        state.begin_start().unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.toggle_label(), "End Call");
        assert!(!snapshot.prompt_editable());
        assert!(!snapshot.connected);
    }
}
