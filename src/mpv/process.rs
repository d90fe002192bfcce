//! MPV process detection, spawning and shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::PlayerConfig;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
  #[error("Failed to stop MPV: {0}")]
  StopFailed(#[source] std::io::Error),
}

/// Get the IPC socket/pipe path for MPV.
pub fn ipc_path(config: &PlayerConfig) -> String {
  if let Some(path) = config.ipc_path.as_ref().filter(|p| !p.is_empty()) {
    return path.clone();
  }
  default_ipc_path()
}

fn default_ipc_path() -> String {
  let name = format!("mpv-ipc-{}", std::process::id());
  #[cfg(windows)]
  {
    format!(r"\\.\pipe\{}", name)
  }
  #[cfg(not(windows))]
  {
    dirs::runtime_dir()
      .unwrap_or_else(std::env::temp_dir)
      .join(format!("{}.sock", name))
      .to_string_lossy()
      .into_owned()
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths
    .iter()
    .map(PathBuf::from)
    .find(|path| path.exists())
}

/// Spawn MPV with its JSON IPC server listening on `ipc`.
pub fn spawn_mpv(config: &PlayerConfig, ipc: &str) -> Result<Child, ProcessError> {
  let mpv_exe = config
    .mpv_path
    .as_ref()
    .filter(|p| !p.is_empty())
    .map(PathBuf::from)
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  log::info!("Spawning MPV: {:?} with IPC: {}", mpv_exe, ipc);
  if !config.mpv_args.is_empty() {
    log::info!("Extra MPV args: {:?}", config.mpv_args);
  }

  let child = Command::new(&mpv_exe)
    .arg(format!("--input-ipc-server={}", ipc))
    .arg("--idle")
    .arg("--no-terminal")
    .args(&config.mpv_args)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()?;

  Ok(child)
}

/// Wait up to `grace` for MPV to exit on its own, then kill it.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<(), ProcessError> {
  let pid = child.id();
  match tokio::time::timeout(grace, child.wait()).await {
    Ok(Ok(status)) => {
      log::info!("MPV process (pid: {:?}) exited with: {}", pid, status);
    }
    Ok(Err(e)) => return Err(ProcessError::StopFailed(e)),
    Err(_) => {
      log::warn!("MPV did not quit within {:?}, killing pid {:?}", grace, pid);
      child.kill().await.map_err(ProcessError::StopFailed)?;
    }
  }
  Ok(())
}

/// Remove a stale IPC socket.
pub fn cleanup_ipc(path: &str) {
  #[cfg(not(windows))]
  {
    let _ = std::fs::remove_file(path);
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = path;
}
