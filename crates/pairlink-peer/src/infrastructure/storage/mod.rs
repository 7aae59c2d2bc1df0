//! Storage infrastructure.
//!
//! - **`config`** – TOML configuration in the platform config directory, with
//!   defaults for a first run.
//! - **`session_store`** – Reconnect tokens, sync checkpoints, and cache
//!   entries, optionally persisted as a JSON snapshot.
//! - **`integrity`** – Read-only scans for records whose references no
//!   longer resolve.

pub mod config;
pub mod integrity;
pub mod session_store;

pub use integrity::OrphanReport;
pub use session_store::{InvalidationReport, SessionStore, StoreError};
