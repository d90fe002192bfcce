//! High-level MPV client: owns the player process and its IPC engine.

use std::sync::Arc;

use async_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::process::Child;

use super::error::MpvError;
use super::events::{EventShapes, MpvEvent};
use super::ipc::MpvIpc;
use super::pending::Reply;
use super::process::{cleanup_ipc, ipc_path, spawn_mpv, terminate};
use super::protocol::args;
use crate::config::PlayerConfig;

/// Process handle plus the socket it was started with.
struct Running {
  child: Child,
  ipc_path: String,
}

/// High-level MPV client.
///
/// Event shapes registered here survive restarts of the player.
#[derive(Clone)]
pub struct MpvClient {
  config: Arc<RwLock<PlayerConfig>>,
  shapes: Arc<EventShapes>,
  process: Arc<Mutex<Option<Running>>>,
  ipc: Arc<Mutex<Option<Arc<MpvIpc>>>>,
  lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl MpvClient {
  /// Create a new MPV client.
  pub fn new(config: PlayerConfig) -> Self {
    Self {
      config: Arc::new(RwLock::new(config)),
      shapes: Arc::new(EventShapes::new()),
      process: Arc::new(Mutex::new(None)),
      ipc: Arc::new(Mutex::new(None)),
      lifecycle: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  /// Update configuration (takes effect on next start).
  pub fn set_config(&self, config: PlayerConfig) {
    *self.config.write() = config;
  }

  pub fn config(&self) -> PlayerConfig {
    self.config.read().clone()
  }

  /// Start MPV and connect to IPC.
  pub async fn start(&self) -> Result<(), MpvError> {
    let _lifecycle = self.lifecycle.lock().await;
    if self.is_connected() {
      return Err(MpvError::AlreadyStarted);
    }
    // A previous engine that stopped on its own is cleared first.
    self.shutdown().await?;

    let config = self.config();
    config.validate().map_err(MpvError::Config)?;

    let path = ipc_path(&config);
    cleanup_ipc(&path);

    let child = spawn_mpv(&config, &path)?;
    *self.process.lock() = Some(Running {
      child,
      ipc_path: path.clone(),
    });

    // Wait a bit for MPV to create the socket
    tokio::time::sleep(config.startup_delay()).await;

    let connected = MpvIpc::connect_with_shapes(
      &path,
      config.connect_retries,
      config.event_capacity,
      self.shapes.clone(),
    )
    .await;

    match connected {
      Ok(ipc_conn) => {
        *self.ipc.lock() = Some(Arc::new(ipc_conn));
        log::info!("MPV client connected");
        Ok(())
      }
      Err(e) => {
        log::error!("MPV IPC connection failed: {}", e);
        self.shutdown().await?;
        Err(e)
      }
    }
  }

  /// Quit MPV, close the connection and wait for the process to exit.
  ///
  /// Requests still waiting for a reply fail with [`MpvError::Stopped`].
  pub async fn stop(&self) -> Result<(), MpvError> {
    let _lifecycle = self.lifecycle.lock().await;
    if self.ipc.lock().is_none() && self.process.lock().is_none() {
      return Err(MpvError::NotStarted);
    }
    self.shutdown().await
  }

  async fn shutdown(&self) -> Result<(), MpvError> {
    let quit_timeout = self.config().quit_timeout();
    let ipc = self.ipc.lock().take();
    let running = self.process.lock().take();

    if let Some(ipc) = &ipc {
      if ipc.is_running() {
        log::info!("Sending quit to MPV");
        let quit = ipc.execute::<Value>(args(["quit"]));
        match tokio::time::timeout(quit_timeout, quit).await {
          Ok(Ok(_reply)) => {}
          Ok(Err(e)) => log::warn!("MPV quit command failed: {}", e),
          Err(_) => {
            log::warn!("MPV quit not written within {:?}, cancelling", quit_timeout);
            ipc.cancel();
          }
        }
      }
      ipc.close();
    }

    let mut result = Ok(());
    if let Some(mut running) = running {
      result = terminate(&mut running.child, quit_timeout)
        .await
        .map_err(MpvError::from);
      cleanup_ipc(&running.ipc_path);
    }

    if let Some(ipc) = ipc {
      if tokio::time::timeout(quit_timeout, ipc.wait_stopped())
        .await
        .is_err()
      {
        log::warn!("MPV IPC did not close, cancelling");
        ipc.cancel();
        ipc.wait_stopped().await;
      }
      log::info!("MPV client stopped");
    }

    result
  }

  /// Check if the engine is attached and still running.
  pub fn is_connected(&self) -> bool {
    self
      .ipc
      .lock()
      .as_ref()
      .map(|ipc| ipc.is_running())
      .unwrap_or(false)
  }

  /// Get a clone of the IPC connection.
  fn get_ipc(&self) -> Result<Arc<MpvIpc>, MpvError> {
    let guard = self.ipc.lock();
    guard.clone().ok_or(MpvError::NotStarted)
  }

  /// Send a command; the reply is awaited on the returned handle.
  pub async fn execute<T>(&self, command: Vec<Value>) -> Result<Reply<T>, MpvError>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.get_ipc()?.execute(command).await
  }

  /// Send a command and wait for its reply.
  pub async fn command<T>(&self, command: Vec<Value>) -> Result<T, MpvError>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.get_ipc()?.command(command).await
  }

  pub async fn command_names(&self) -> Result<Vec<String>, MpvError> {
    self.get_ipc()?.command_names().await
  }

  pub async fn property_names(&self) -> Result<Vec<String>, MpvError> {
    self.get_ipc()?.property_names().await
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

  pub fn unregister_event_shape(&self, name: &str) -> bool {
    self.shapes.unregister(name)
  }

  /// Get event receiver for property changes and other events.
  pub fn events(&self) -> Option<Receiver<MpvEvent>> {
    let guard = self.ipc.lock();
    guard.as_ref().map(|ipc| ipc.events())
  }
}
