//! Call Session Controller
//!
//! - `state`: the call's phase, status and connection handle, with pure transitions.
//! - `controller`: the task that drives token fetch, media connect and event handling.

mod controller;
pub mod state;

pub use controller::{
    CallSession, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCONNECT_TIMEOUT, DEFAULT_IDENTITY,
    DEFAULT_ROOM_NAME, DEFAULT_TOKEN_TIMEOUT, PendingCall, SessionConfig,
};
pub use state::{CallPhase, CallStatus, SessionSnapshot, SessionState};
