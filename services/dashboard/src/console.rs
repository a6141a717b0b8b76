//! Line-oriented terminal dashboard.
//!
//! Each input line is parsed into a [`ConsoleCommand`] and run against the
//! [`CallSession`]. Everything meant for the user, command replies and status
//! changes alike, is pushed onto one output channel so a single printer task
//! owns stdout.

use std::str::FromStr;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use voice_dashboard_core::{
    CallError, CallPhase, CallSession, CallStatus, SessionSnapshot,
    session::PendingCall,
    media::{RemoteTrack, TrackKind},
    surface::AudioSurface,
};

pub const HELP: &str = "\
Commands:
  <enter>, toggle  start or end the call (follows the button label)
  start            start a call with the current prompt
  end              end the current call
  prompt <text>    replace the prompt
  + <text>         append a line to the prompt
  clear            empty the prompt
  show             print the prompt
  status           print the current status
  help             print this help
  quit             end any call and exit";

/// A single parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Toggle,
    Start,
    End,
    SetPrompt(String),
    AppendPrompt(String),
    ClearPrompt,
    ShowPrompt,
    Status,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),
    #[error("'{0}' needs some text after it")]
    MissingArgument(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(ConsoleCommand::Toggle);
        }

        if let Some(rest) = line.trim_start().strip_prefix('+') {
            let text = rest.strip_prefix(' ').unwrap_or(rest);
            return Ok(ConsoleCommand::AppendPrompt(text.to_string()));
        }

        let trimmed = line.trim();
        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim_start()),
            None => (trimmed, ""),
        };

        match word.to_lowercase().as_str() {
            "toggle" => Ok(ConsoleCommand::Toggle),
            "start" => Ok(ConsoleCommand::Start),
            "end" | "hangup" => Ok(ConsoleCommand::End),
            "prompt" if rest.is_empty() => Err(ParseCommandError::MissingArgument("prompt")),
            "prompt" => Ok(ConsoleCommand::SetPrompt(rest.to_string())),
            "clear" => Ok(ConsoleCommand::ClearPrompt),
            "show" => Ok(ConsoleCommand::ShowPrompt),
            "status" => Ok(ConsoleCommand::Status),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            _ => Err(ParseCommandError::Unknown(word.to_string())),
        }
    }
}

/// Whether the input loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// One status line, e.g. `[End Call] Status: Call is active`.
pub fn render_status(snapshot: &SessionSnapshot) -> String {
    format!("[{}] Status: {}", snapshot.toggle_label(), snapshot.status)
}

/// Runs parsed commands against a session and reports back on `output`.
pub struct Console {
    session: CallSession,
    output: mpsc::UnboundedSender<String>,
}

impl Console {
    pub fn new(session: CallSession, output: mpsc::UnboundedSender<String>) -> Self {
        Self { session, output }
    }

    fn say(&self, line: impl Into<String>) {
        // The printer only goes away at shutdown.
        let _ = self.output.send(line.into());
    }

    /// Parses and runs one input line.
    pub async fn handle_line(&self, line: &str) -> Flow {
        match line.parse::<ConsoleCommand>() {
            Ok(command) => self.execute(command).await,
            Err(e) => {
                self.say(e.to_string());
                Flow::Continue
            }
        }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Flow {
        debug!(?command, "Console command");
        match command {
            // A call setup can take as long as the token and connect timeouts
            // combined. The command is queued here, in input order, and only
            // its outcome is awaited off the input loop.
            ConsoleCommand::Toggle => {
                let pending = self.session.begin_toggle().await;
                self.await_outcome(pending);
            }
            ConsoleCommand::Start => {
                let pending = self.session.begin_start().await;
                self.await_outcome(pending);
            }
            ConsoleCommand::End => {
                if let Err(e) = self.session.end_call().await {
                    self.report(e);
                }
            }
            ConsoleCommand::SetPrompt(text) => self.update_prompt(text).await,
            ConsoleCommand::AppendPrompt(line) => {
                let current = self.session.snapshot().prompt;
                let text = if current.is_empty() {
                    line
                } else {
                    format!("{current}\n{line}")
                };
                self.update_prompt(text).await;
            }
            ConsoleCommand::ClearPrompt => self.update_prompt(String::new()).await,
            ConsoleCommand::ShowPrompt => {
                let prompt = self.session.snapshot().prompt;
                if prompt.is_empty() {
                    self.say("(prompt is empty)");
                } else {
                    self.say(format!("Prompt:\n{prompt}"));
                }
            }
            ConsoleCommand::Status => self.say(render_status(&self.session.snapshot())),
            ConsoleCommand::Help => self.say(HELP),
            ConsoleCommand::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    async fn update_prompt(&self, text: String) {
        match self.session.set_prompt(text).await {
            Ok(()) => self.say("Prompt updated."),
            Err(e) => self.report(e),
        }
    }

    fn await_outcome(&self, pending: Result<PendingCall, CallError>) {
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) => return self.report(e),
        };
        let output = self.output.clone();
        tokio::spawn(async move {
            if let Err(e) = pending.outcome().await {
                let _ = output.send(describe(&e));
            }
        });
    }

    fn report(&self, error: CallError) {
        self.say(describe(&error));
    }
}

fn describe(error: &CallError) -> String {
    match error {
        CallError::PromptLocked => "The prompt can only be edited while no call is active.".into(),
        other => format!("Error: {other}"),
    }
}

/// Pushes a status line onto `output` whenever the phase or status changes.
///
/// Prompt-only edits are not echoed. Returns once the session is gone.
pub async fn forward_status(
    mut snapshots: watch::Receiver<SessionSnapshot>,
    output: mpsc::UnboundedSender<String>,
) {
    let mut last: Option<(CallPhase, CallStatus)> = None;
    loop {
        let line = {
            let snapshot = snapshots.borrow_and_update();
            let key = (snapshot.phase, snapshot.status);
            if last == Some(key) {
                None
            } else {
                last = Some(key);
                Some(render_status(&snapshot))
            }
        };
        if let Some(line) = line {
            if output.send(line).is_err() {
                break;
            }
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

/// Announces mounted agent audio on the console.
pub struct ConsoleSurface {
    output: mpsc::UnboundedSender<String>,
}

impl ConsoleSurface {
    pub fn new(output: mpsc::UnboundedSender<String>) -> Self {
        Self { output }
    }
}

impl AudioSurface for ConsoleSurface {
    fn attach(&self, track: &RemoteTrack) {
        if track.kind != TrackKind::Audio {
            warn!(sid = %track.sid, kind = %track.kind, "Refusing to mount non-audio track");
            return;
        }
        let _ = self
            .output
            .send(format!("Playing agent audio: {} ({})", track.name, track.sid));
    }

    fn detach_all(&self) {
        let _ = self.output.send("Agent audio stopped.".to_string());
    }
}
