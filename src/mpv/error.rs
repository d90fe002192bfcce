//! MPV client error types.

use thiserror::Error;

use super::process::ProcessError;

/// Errors surfaced to callers of the MPV engine.
#[derive(Debug, Error)]
pub enum MpvError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("IPC I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Failed to encode command: {0}")]
  Encode(#[source] serde_json::Error),

  #[error("Failed to decode reply data: {0}")]
  Decode(#[source] serde_json::Error),

  /// MPV answered with an error message for this request.
  #[error("MPV command failed: {0}")]
  Command(String),

  #[error("Command timeout")]
  Timeout,

  /// The dispatch loop has ended; no reply can be correlated anymore.
  #[error("MPV engine stopped")]
  Stopped,

  #[error("Invalid configuration: {0}")]
  Config(String),

  #[error("MPV was already started")]
  AlreadyStarted,

  #[error("MPV was not started")]
  NotStarted,
}

impl MpvError {
  /// The MPV-side error message, if this is a command failure.
  pub fn command_message(&self) -> Option<&str> {
    match self {
      MpvError::Command(message) => Some(message),
      _ => None,
    }
  }
}
