//! Error types shared by the token client, the media layer and the call controller.

/// Failures from the token service.
///
/// The two variants are kept apart so a caller can tell a dead or unreachable
/// token server from one that answered with something other than a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    RequestFailed(String),
    #[error("token response invalid: {0}")]
    ResponseInvalid(String),
}

/// Failures reported by a media service implementation.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media connect failed: {0}")]
    ConnectFailed(String),
    #[error("media disconnect failed: {0}")]
    Disconnect(String),
}

/// Errors surfaced by the call controller.
///
/// Only `AlreadyInCall`, `PromptLocked` and `ControllerStopped` ever reach a
/// caller of [`crate::session::CallSession`]. The remaining variants are
/// produced while a call is being set up and are folded into the session
/// status instead of being returned.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("token request failed: {0}")]
    TokenRequestFailed(String),
    #[error("token response invalid: {0}")]
    TokenResponseInvalid(String),
    #[error("media connect failed: {0}")]
    MediaConnectFailed(String),
    #[error("a call is already in progress")]
    AlreadyInCall,
    #[error("the prompt cannot be edited while a call is in progress")]
    PromptLocked,
    #[error("the call controller has stopped")]
    ControllerStopped,
}

impl From<TokenError> for CallError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::RequestFailed(msg) => Self::TokenRequestFailed(msg),
            TokenError::ResponseInvalid(msg) => Self::TokenResponseInvalid(msg),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        Self::MediaConnectFailed(err.to_string())
    }
}
