//! Infrastructure layer for the peer application.
//!
//! Contains the OS-facing adapters: TCP sockets and frame links, the
//! negotiation strategies, the peer-connection seam, and file-system storage
//! (configuration and the session store).

pub mod negotiation;
pub mod network;
pub mod peer;
pub mod storage;
