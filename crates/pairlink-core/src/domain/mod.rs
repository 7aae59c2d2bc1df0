//! Domain layer: pure data describing connections and sessions.
//!
//! Nothing in this module performs I/O.  The peer application owns the
//! behaviour; these types are the vocabulary it publishes and persists.

pub mod connection;
pub mod session;
