//! Async IPC connection to MPV.
//!
//! One reader task decodes every line MPV sends and routes it: replies go to
//! the request that is waiting for them, events go to the shared event queue.
//! One writer task puts whole frames on the stream so concurrent commands
//! never interleave.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::MpvError;
use super::events::{EventShapes, EventSink, MpvEvent};
use super::pending::{Reply, RequestTable};
use super::protocol::{args, Frame, MpvCommand};

/// Whether the dispatch loop is still correlating replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
  Running,
  Stopped,
}

/// Writer channel message.
enum WriteMessage {
  Command {
    data: Vec<u8>,
    ack: oneshot::Sender<io::Result<()>>,
  },
  Close,
}

/// MPV IPC connection.
pub struct MpvIpc {
  requests: Arc<RequestTable>,
  shapes: Arc<EventShapes>,
  event_rx: Receiver<MpvEvent>,
  write_tx: Sender<WriteMessage>,
  state_rx: watch::Receiver<EngineState>,
  cancel: CancellationToken,
  reader_handle: Mutex<Option<JoinHandle<()>>>,
  _writer_handle: JoinHandle<()>,
}

impl MpvIpc {
  /// Connect to MPV IPC socket/pipe.
  pub async fn connect(
    path: &str,
    retry_count: u32,
    event_capacity: usize,
  ) -> Result<Self, MpvError> {
    Self::connect_with_shapes(
      path,
      retry_count,
      event_capacity,
      Arc::new(EventShapes::new()),
    )
    .await
  }

  pub(crate) async fn connect_with_shapes(
    path: &str,
    retry_count: u32,
    event_capacity: usize,
    shapes: Arc<EventShapes>,
  ) -> Result<Self, MpvError> {
    let mut last_error = None;

    for attempt in 0..retry_count {
      if attempt > 0 {
        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
      }

      match Self::try_connect(path, event_capacity, shapes.clone()).await {
        Ok(ipc) => return Ok(ipc),
        Err(e) => {
          log::debug!("IPC connect attempt {} failed: {}", attempt + 1, e);
          last_error = Some(e);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| MpvError::ConnectionFailed("No connection attempts".into())))
  }

  #[cfg(windows)]
  async fn try_connect(
    path: &str,
    event_capacity: usize,
    shapes: Arc<EventShapes>,
  ) -> Result<Self, MpvError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new()
      .open(path)
      .map_err(|e| MpvError::ConnectionFailed(format!("Failed to open pipe: {}", e)))?;

    let (reader, writer) = tokio::io::split(client);
    Ok(Self::setup(reader, writer, event_capacity, shapes))
  }

  #[cfg(not(windows))]
  async fn try_connect(
    path: &str,
    event_capacity: usize,
    shapes: Arc<EventShapes>,
  ) -> Result<Self, MpvError> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(path)
      .await
      .map_err(|e| MpvError::ConnectionFailed(e.to_string()))?;

    let (reader, writer) = stream.into_split();
    Ok(Self::setup(reader, writer, event_capacity, shapes))
  }

  /// Run the engine over an already open stream pair.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn attach<R, W>(reader: R, writer: W, event_capacity: usize) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    Self::setup(reader, writer, event_capacity, Arc::new(EventShapes::new()))
  }

  fn setup<R, W>(reader: R, writer: W, event_capacity: usize, shapes: Arc<EventShapes>) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let requests = Arc::new(RequestTable::new());
    let events = EventSink::new(event_capacity);
    let event_rx = events.subscribe();
    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();
    let (state_tx, state_rx) = watch::channel(EngineState::Running);
    let cancel = CancellationToken::new();

    // Spawn reader task
    let reader_handle = tokio::spawn(Self::reader_loop(
      reader,
      Dispatcher {
        requests: requests.clone(),
        shapes: shapes.clone(),
        events,
      },
      state_tx,
      cancel.clone(),
    ));

    // Spawn writer task
    let writer_handle = tokio::spawn(Self::writer_loop(writer, write_rx, cancel.clone()));

    Self {
      requests,
      shapes,
      event_rx,
      write_tx,
      state_rx,
      cancel,
      reader_handle: Mutex::new(Some(reader_handle)),
      _writer_handle: writer_handle,
    }
  }

  async fn reader_loop<R: AsyncRead + Unpin>(
    reader: R,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<EngineState>,
    cancel: CancellationToken,
  ) {
    log::info!("MPV IPC reader loop started");
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
      line.clear();
      let read = tokio::select! {
        _ = cancel.cancelled() => {
          log::info!("MPV IPC reader cancelled");
          break;
        }
        read = buf_reader.read_line(&mut line) => read,
      };

      match read {
        Ok(0) => {
          log::info!("MPV IPC connection closed");
          break;
        }
        Ok(_) => {
          let trimmed = line.trim();
          if trimmed.is_empty() {
            continue;
          }

          match Frame::decode(trimmed) {
            Ok(frame) => dispatcher.route(frame),
            Err(e) => {
              // Without a usable frame no further reply can be trusted.
              log::error!("Unusable MPV frame, stopping: {} - {}", e, trimmed);
              break;
            }
          }
        }
        Err(e) => {
          log::error!("MPV IPC read error: {}", e);
          break;
        }
      }
    }

    let abandoned = dispatcher.requests.close();
    if abandoned > 0 {
      log::warn!("MPV engine stopped with {} requests outstanding", abandoned);
    }
    dispatcher.events.close();
    cancel.cancel();
    let _ = state_tx.send(EngineState::Stopped);
    log::info!("MPV IPC reader loop stopped");
  }

  async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    write_rx: Receiver<WriteMessage>,
    cancel: CancellationToken,
  ) {
    log::info!("MPV IPC writer loop started");

    loop {
      let msg = tokio::select! {
        _ = cancel.cancelled() => break,
        msg = write_rx.recv() => match msg {
          Ok(msg) => msg,
          Err(_) => break,
        },
      };

      match msg {
        WriteMessage::Command { data, ack } => {
          let result = tokio::select! {
            _ = cancel.cancelled() => Err(io::Error::new(
              io::ErrorKind::Interrupted,
              "MPV IPC writer cancelled",
            )),
            result = write_frame(&mut writer, &data) => result,
          };
          let failed = result.is_err();
          if let Err(e) = &result {
            log::error!("MPV IPC write error: {}", e);
          }
          let _ = ack.send(result);
          if failed {
            // A broken stream ends the whole engine.
            cancel.cancel();
            break;
          }
        }
        WriteMessage::Close => {
          log::info!("MPV IPC writer closing");
          if let Err(e) = writer.shutdown().await {
            log::debug!("MPV IPC shutdown error: {}", e);
          }
          break;
        }
      }
    }

    write_rx.close();
    while let Ok(msg) = write_rx.try_recv() {
      if let WriteMessage::Command { ack, .. } = msg {
        let _ = ack.send(Err(io::Error::new(
          io::ErrorKind::BrokenPipe,
          "MPV IPC writer stopped",
        )));
      }
    }
  }

  /// Send a command and return a handle for its reply.
  ///
  /// Returns once the frame is written; the reply is awaited separately on
  /// the returned [`Reply`]. On an encode or write failure nothing stays
  /// registered.
  pub async fn execute<T>(&self, command: Vec<Value>) -> Result<Reply<T>, MpvError>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let (request_id, reply) = self.requests.register_typed::<T>()?;

    let data = match MpvCommand::new(command, request_id).encode() {
      Ok(data) => data,
      Err(e) => {
        self.requests.remove(request_id);
        return Err(MpvError::Encode(e));
      }
    };
    log::debug!(
      "Sending MPV command: {}",
      String::from_utf8_lossy(&data).trim_end()
    );

    if let Err(e) = self.write(data).await {
      self.requests.remove(request_id);
      return Err(e);
    }

    Ok(reply)
  }

  /// Send a command and wait for its reply.
  pub async fn command<T>(&self, command: Vec<Value>) -> Result<T, MpvError>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.execute::<T>(command).await?.await
  }

  async fn write(&self, data: Vec<u8>) -> Result<(), MpvError> {
    let (ack_tx, ack_rx) = oneshot::channel();
    self
      .write_tx
      .send(WriteMessage::Command { data, ack: ack_tx })
      .await
      .map_err(|_| MpvError::Stopped)?;

    match ack_rx.await {
      Ok(result) => result.map_err(MpvError::Io),
      Err(_) => Err(MpvError::Stopped),
    }
  }

  /// Names of every command MPV understands.
  pub async fn command_names(&self) -> Result<Vec<String>, MpvError> {
    #[derive(Deserialize)]
    struct CommandInfo {
      name: String,
    }

    let commands: Vec<CommandInfo> = self
      .command(args(["get_property", "command-list"]))
      .await?;
    Ok(commands.into_iter().map(|c| c.name).collect())
  }

  /// Names of every property MPV exposes.
  pub async fn property_names(&self) -> Result<Vec<String>, MpvError> {
    self.command(args(["get_property", "property-list"])).await
  }

  /// Decode every future `name` event into `T`.
  pub fn register_event_shape<T>(&self, name: impl Into<String>)
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.shapes.register::<T>(name);
  }

  /// Decode only the next `name` event into `T`.
  pub fn register_event_shape_once<T>(&self, name: impl Into<String>)
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.shapes.register_once::<T>(name);
  }

  /// Get the event receiver for property changes and other events.
  ///
  /// All receivers share one queue; each event reaches exactly one of them.
  pub fn events(&self) -> Receiver<MpvEvent> {
    self.event_rx.clone()
  }

  pub fn state(&self) -> EngineState {
    *self.state_rx.borrow()
  }

  pub fn is_running(&self) -> bool {
    self.state() == EngineState::Running
  }

  /// Number of requests still waiting for a reply.
  pub fn pending_requests(&self) -> usize {
    self.requests.len()
  }

  /// Wait until the reader loop has stopped and every request is settled.
  pub async fn wait_stopped(&self) {
    let mut state_rx = self.state_rx.clone();
    let _ = state_rx
      .wait_for(|state| *state == EngineState::Stopped)
      .await;
    let handle = self.reader_handle.lock().take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        log::error!("MPV IPC reader task failed: {}", e);
      }
    }
  }

  /// Close the write side after frames already queued.
  pub fn close(&self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
  }

  /// Stop reading and writing immediately.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }
}

impl Drop for MpvIpc {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

/// Routes decoded frames; owned by the reader task.
struct Dispatcher {
  requests: Arc<RequestTable>,
  shapes: Arc<EventShapes>,
  events: EventSink,
}

impl Dispatcher {
  fn route(&self, frame: Frame) {
    match frame {
      Frame::Success { request_id, data } => {
        log::debug!("MPV reader: received response for request_id={}", request_id);
        if !self.requests.resolve(request_id, data) {
          log::warn!("MPV reply for unknown request_id={}", request_id);
        }
      }
      Frame::Failure { request_id, error } => {
        log::debug!(
          "MPV reader: received error for request_id={}: {}",
          request_id,
          error
        );
        if !self.requests.fail(request_id, error) {
          log::warn!("MPV error reply for unknown request_id={}", request_id);
        }
      }
      Frame::Event { name, raw } => {
        log::debug!("MPV reader: received event {}", name);
        let event = match self.shapes.materialize(&name, &raw) {
          Ok(event) => event,
          Err(e) => {
            log::warn!("MPV event {} does not match its shape: {}", name, e);
            match MpvEvent::generic(name.as_str(), &raw) {
              Ok(event) => event,
              Err(e) => {
                log::warn!("Dropping undecodable MPV event {}: {}", name, e);
                return;
              }
            }
          }
        };
        self.events.try_push(event);
      }
    }
  }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
  writer.write_all(data).await?;
  writer.flush().await
}
