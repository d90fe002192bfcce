//! Correlation table for in-flight requests.
//!
//! Every registered request is completed exactly once: by a matching reply,
//! by a failure reply, or by the table closing when the dispatch loop ends.
//! The lock covers map mutation only; reply payloads are decoded after the
//! entry has been removed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::sync::oneshot;

use super::error::MpvError;
use super::protocol::RequestId;

/// What the dispatch loop hands to a pending request.
pub(crate) enum Outcome {
  Data(Option<Box<RawValue>>),
  Failed(MpvError),
}

impl Outcome {
  /// Decode the reply into the caller's type. Missing data decodes as `null`.
  fn materialize<T: DeserializeOwned>(self) -> Result<T, MpvError> {
    match self {
      Outcome::Data(data) => {
        let text = data.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(text).map_err(MpvError::Decode)
      }
      Outcome::Failed(err) => Err(err),
    }
  }
}

type Completion = Box<dyn FnOnce(Outcome) + Send>;

struct TableState {
  last_id: RequestId,
  pending: HashMap<RequestId, Completion>,
  closed: bool,
}

/// Request ID allocator and pending request map.
pub(crate) struct RequestTable {
  state: Mutex<TableState>,
}

impl RequestTable {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(TableState {
        last_id: 0,
        pending: HashMap::new(),
        closed: false,
      }),
    }
  }

  /// Allocate an ID and store the completion for it.
  pub fn register<F>(&self, complete: F) -> Result<RequestId, MpvError>
  where
    F: FnOnce(Outcome) + Send + 'static,
  {
    let mut state = self.state.lock();
    if state.closed {
      return Err(MpvError::Stopped);
    }
    state.last_id += 1;
    let request_id = state.last_id;
    state.pending.insert(request_id, Box::new(complete));
    Ok(request_id)
  }

  /// Register a request whose reply is decoded into `T`.
  pub fn register_typed<T>(self: &Arc<Self>) -> Result<(RequestId, Reply<T>), MpvError>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let request_id = self.register(move |outcome| {
      // The caller may have stopped waiting.
      let _ = tx.send(outcome.materialize::<T>());
    })?;
    Ok((
      request_id,
      Reply {
        request_id,
        rx,
        table: Arc::downgrade(self),
      },
    ))
  }

  /// Deliver reply data. Returns `false` if the request is unknown.
  pub fn resolve(&self, request_id: RequestId, data: Option<Box<RawValue>>) -> bool {
    self.complete(request_id, Outcome::Data(data))
  }

  /// Deliver an MPV error message. Returns `false` if the request is unknown.
  pub fn fail(&self, request_id: RequestId, error: String) -> bool {
    self.complete(request_id, Outcome::Failed(MpvError::Command(error)))
  }

  fn complete(&self, request_id: RequestId, outcome: Outcome) -> bool {
    let entry = self.state.lock().pending.remove(&request_id);
    match entry {
      Some(complete) => {
        complete(outcome);
        true
      }
      None => false,
    }
  }

  /// Drop a request without completing it.
  pub fn remove(&self, request_id: RequestId) -> bool {
    self.state.lock().pending.remove(&request_id).is_some()
  }

  /// Refuse new requests and fail every outstanding one with `Stopped`.
  /// Returns how many requests were failed.
  pub fn close(&self) -> usize {
    let drained: Vec<Completion> = {
      let mut state = self.state.lock();
      state.closed = true;
      state.pending.drain().map(|(_, complete)| complete).collect()
    };
    let count = drained.len();
    for complete in drained {
      complete(Outcome::Failed(MpvError::Stopped));
    }
    count
  }

  #[cfg(test)]
  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  pub fn len(&self) -> usize {
    self.state.lock().pending.len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Completion handle for one command. Resolves to the decoded reply.
///
/// Dropping it abandons the reply; the request stays registered until MPV
/// answers or the engine stops.
#[must_use = "a Reply does nothing unless awaited"]
pub struct Reply<T> {
  request_id: RequestId,
  rx: oneshot::Receiver<Result<T, MpvError>>,
  table: Weak<RequestTable>,
}

impl<T> Reply<T> {
  pub fn request_id(&self) -> RequestId {
    self.request_id
  }

  /// Wait at most `duration`. On expiry the request is unregistered and a
  /// late reply is reported as unknown.
  pub async fn timeout(self, duration: Duration) -> Result<T, MpvError> {
    let request_id = self.request_id;
    let table = self.table.clone();
    match tokio::time::timeout(duration, self).await {
      Ok(result) => result,
      Err(_) => {
        log::warn!(
          "MPV command timeout after {:?}, request_id={}",
          duration,
          request_id
        );
        if let Some(table) = table.upgrade() {
          table.remove(request_id);
        }
        Err(MpvError::Timeout)
      }
    }
  }
}

impl<T> Future for Reply<T> {
  type Output = Result<T, MpvError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      // Sender dropped without an outcome: the request was removed.
      Poll::Ready(Err(_)) => Poll::Ready(Err(MpvError::Stopped)),
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<T> std::fmt::Debug for Reply<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Reply")
      .field("request_id", &self.request_id)
      .finish()
  }
}
