//! Player configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mpv::DEFAULT_EVENT_CAPACITY;

/// How to launch MPV and size the IPC engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  /// IPC socket/pipe path (None = per-process default).
  #[serde(default)]
  pub ipc_path: Option<String>,

  /// Events buffered before new ones are dropped.
  #[serde(default = "default_event_capacity")]
  pub event_capacity: usize,

  /// Attempts to connect to the IPC socket after spawning MPV.
  #[serde(default = "default_connect_retries")]
  pub connect_retries: u32,

  /// Delay before the first connection attempt, in milliseconds.
  #[serde(default = "default_startup_delay_ms")]
  pub startup_delay_ms: u64,

  /// Time MPV gets to exit after `quit` before it is killed, in milliseconds.
  #[serde(default = "default_quit_timeout_ms")]
  pub quit_timeout_ms: u64,
}

fn default_event_capacity() -> usize {
  DEFAULT_EVENT_CAPACITY
}

fn default_connect_retries() -> u32 {
  10
}

fn default_startup_delay_ms() -> u64 {
  200
}

fn default_quit_timeout_ms() -> u64 {
  1000
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      ipc_path: None,
      event_capacity: default_event_capacity(),
      connect_retries: default_connect_retries(),
      startup_delay_ms: default_startup_delay_ms(),
      quit_timeout_ms: default_quit_timeout_ms(),
    }
  }
}

impl PlayerConfig {
  /// Parse a JSON config document. Missing fields take their defaults.
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.event_capacity == 0 {
      return Err("Event capacity must be at least 1".to_string());
    }
    if self.connect_retries == 0 {
      return Err("Connect retries must be at least 1".to_string());
    }
    if self.quit_timeout_ms == 0 || self.quit_timeout_ms > 60_000 {
      return Err("Quit timeout must be between 1 and 60000 milliseconds".to_string());
    }
    if self.mpv_args.iter().any(|arg| arg.starts_with("--input-ipc-server")) {
      return Err("IPC server is managed by the client; use ipcPath instead".to_string());
    }
    Ok(())
  }

  pub fn startup_delay(&self) -> Duration {
    Duration::from_millis(self.startup_delay_ms)
  }

  pub fn quit_timeout(&self) -> Duration {
    Duration::from_millis(self.quit_timeout_ms)
  }
}
