//! Client for the mpv JSON IPC protocol.
//!
//! Commands are correlated with their replies by request ID, so any number of
//! them can be in flight on one connection. Events MPV pushes on its own are
//! delivered through a bounded queue that never stalls reply handling.
//!
//! ```no_run
//! use mpv_ipc::{args, MpvClient, PlayerConfig};
//!
//! # async fn run() -> Result<(), mpv_ipc::MpvError> {
//! let client = MpvClient::new(PlayerConfig::default());
//! client.start().await?;
//! let volume: f64 = client.command(args(["get_property", "volume"])).await?;
//! println!("volume: {}", volume);
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod mpv;

pub use config::PlayerConfig;
pub use mpv::*;
