//! Voice Dashboard Core
//!
//! Everything needed to place a voice call to a remote conversational agent:
//! fetching a room credential from the token service, joining the media room,
//! mounting the agent's audio and tearing the call down again. Process-level
//! concerns (configuration, logging, terminal I/O) live in the dashboard service.

pub mod error;
pub mod media;
pub mod session;
pub mod surface;
pub mod token;

pub use error::{CallError, MediaError, TokenError};
pub use session::{CallPhase, CallSession, CallStatus, SessionConfig, SessionSnapshot};
