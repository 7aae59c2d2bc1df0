//! # pairlink-core
//!
//! Shared library for Pairlink containing the signaling codec, the command
//! protocol, and the domain entities describing a paired session.
//!
//! This crate is used by the peer application and its tests.
//! It has zero dependencies on OS APIs, async runtimes, or network sockets.
//!
//! # Architecture overview
//!
//! Pairlink pairs exactly two devices without a central server.  The devices
//! exchange a small *setup blob* out of band (copy/paste, QR code, or a typed
//! token), open one bidirectional channel, and exchange short commands over
//! it.  When the session ends, persisted session records are invalidated.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How values travel between the devices.  Setup blobs and
//!   command frames are JSON text; the raw-stream transport uses a small line
//!   protocol (`HELLO <token>`, `OK`, `PING <ms>`, ...).
//!
//! - **`domain`** – Pure data with no I/O: the connection state machine's
//!   vocabulary (roles, states, snapshots) and the session records
//!   (reconnect tokens, sync checkpoints, cache entries).

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `pairlink_core::SetupBlob` instead of `pairlink_core::protocol::signaling::SetupBlob`.
pub use domain::connection::{ChannelState, ConnectionSnapshot, ConnectionState, Role};
pub use domain::session::{
    CacheEntry, CheckpointKey, ReconnectToken, ScopeType, SessionMode, SyncCheckpoint, TokenStatus,
};
pub use protocol::command::{decode_command, encode_command, now_millis, Command, CommandType};
pub use protocol::line::LineMessage;
pub use protocol::signaling::{decode_setup, encode_setup, SetupBlob, SetupKind, SignalingError};
