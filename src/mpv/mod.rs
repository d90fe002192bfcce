//! MPV JSON IPC module - drives an external MPV player over its JSON IPC socket.
//!
//! Architecture:
//! - `protocol.rs` - Command encoding and inbound frame classification
//! - `pending.rs` - Request ID allocation and reply correlation
//! - `events.rs` - Event shapes and the bounded event queue
//! - `ipc.rs` - Reader/writer tasks over an async stream (Named Pipes on Windows, Unix Sockets elsewhere)
//! - `process.rs` - MPV binary detection, spawning and termination
//! - `client.rs` - High-level client owning the process and connection

mod client;
mod error;
mod events;
mod ipc;
mod pending;
mod process;
mod protocol;

pub use client::MpvClient;
pub use error::MpvError;
pub use events::{EventPayload, MpvEvent, DEFAULT_EVENT_CAPACITY};
pub use ipc::{EngineState, MpvIpc};
pub use pending::Reply;
pub use process::{cleanup_ipc, find_mpv, ipc_path, ProcessError};
pub use protocol::{args, Frame, FrameError, MpvCommand, RequestId};
