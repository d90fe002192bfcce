//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;

/// Identifier correlating a command with its reply. Zero means "no request".
pub type RequestId = u64;

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  pub request_id: RequestId,
}

impl MpvCommand {
  pub fn new(command: Vec<Value>, request_id: RequestId) -> Self {
    Self {
      command,
      request_id,
    }
  }

  /// Serialize to a single newline-terminated JSON line.
  pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(self)?;
    line.push(b'\n');
    Ok(line)
  }

  /// Parse a command line back (trailing newline allowed).
  pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(line.trim_end())
  }
}

/// Build command words from any list of JSON-convertible values.
///
/// ```
/// let words = mpv_ipc::args(["set_property", "pause"]);
/// assert_eq!(words.len(), 2);
/// ```
pub fn args<I, V>(words: I) -> Vec<Value>
where
  I: IntoIterator<Item = V>,
  V: Into<Value>,
{
  words.into_iter().map(Into::into).collect()
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("Invalid JSON frame: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Frame is neither a request reply nor an event")]
  Uncorrelated,
  #[error("Frame is not a JSON object")]
  NotAnObject,
}

/// One decoded line received from MPV.
#[derive(Debug)]
pub enum Frame {
  /// `error` was `"success"`. `data` is `None` when absent or `null`.
  Success {
    request_id: RequestId,
    data: Option<Box<RawValue>>,
  },
  /// `error` carried a failure message.
  Failure {
    request_id: RequestId,
    error: String,
  },
  /// Unsolicited event. `raw` is the whole line so a shape can decode every field.
  Event { name: String, raw: String },
}

/// Fields common to replies and events. Everything else is left opaque.
#[derive(Deserialize)]
struct FrameHeader {
  #[serde(default)]
  request_id: Option<i64>,
  #[serde(default)]
  event: Option<String>,
  #[serde(default)]
  error: Option<String>,
  #[serde(default)]
  data: Option<Box<RawValue>>,
}

impl Frame {
  /// Classify a JSON line from MPV.
  pub fn decode(line: &str) -> Result<Self, FrameError> {
    let header: FrameHeader = serde_json::from_str(line)?;
    // Derived structs also accept arrays by position.
    if !line.trim_start().starts_with('{') {
      return Err(FrameError::NotAnObject);
    }

    let request_id = header
      .request_id
      .and_then(|id| RequestId::try_from(id).ok())
      .filter(|id| *id != 0);

    if let (Some(request_id), Some(error)) = (request_id, header.error) {
      if error == "success" {
        return Ok(Frame::Success {
          request_id,
          data: header.data,
        });
      }
      if !error.is_empty() {
        return Ok(Frame::Failure { request_id, error });
      }
    }

    match header.event {
      Some(name) => Ok(Frame::Event {
        name,
        raw: line.to_string(),
      }),
      None => Err(FrameError::Uncorrelated),
    }
  }

  pub fn request_id(&self) -> Option<RequestId> {
    match self {
      Frame::Success { request_id, .. } | Frame::Failure { request_id, .. } => Some(*request_id),
      Frame::Event { .. } => None,
    }
  }
}
