//! Connection vocabulary: roles, lifecycle states, and the published snapshot.
//!
//! # Connection lifecycle
//!
//! A controller moves through these states for one connection attempt:
//!
//! ```text
//!                 initiate                 local setup ready
//! Idle ──────────────────►  Negotiating  ───────────────────►  SetupProduced
//!   │                            ▲                                   │
//!   │  accept(remote offer)      │                                   │ remote setup applied /
//!   └────────────────────────────┘                                   │ channel open
//!                         local setup ready                          ▼
//!           Negotiating ───────────────────► AwaitingRemoteSetup ──► Connected
//!                                                                     │
//!                                                 channel closed      ▼
//!                                                               Disconnected
//! ```
//!
//! Any state moves to `Failed` on an unexpected transport failure, and any
//! state returns to `Idle` on reset.  Neither `Disconnected` nor `Failed` is
//! terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the pairing protocol this device plays.
///
/// Exactly one role is active per connection attempt.  `None` means no role
/// has been selected yet (or the controller was reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// No role selected.
    #[default]
    None,
    /// Produces the offer (or listens, on the raw-stream transport).
    Initiator,
    /// Answers the offer (or dials, on the raw-stream transport).
    Responder,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Local setup is being produced (address gathering, listener bind, dial).
    Negotiating,
    /// Initiator: the local offer is ready to be relayed out of band.
    SetupProduced,
    /// Responder: the local answer is ready; waiting for the initiator to apply it.
    AwaitingRemoteSetup,
    /// The channel is open.
    Connected,
    /// The channel closed after being connected.
    Disconnected,
    /// An unexpected failure ended the attempt.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::SetupProduced => "setup_produced",
            ConnectionState::AwaitingRemoteSetup => "awaiting_remote_setup",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Returns `true` while a local setup has been produced and the channel
    /// has not opened yet.
    pub fn is_pending_open(self) -> bool {
        matches!(
            self,
            ConnectionState::SetupProduced | ConnectionState::AwaitingRemoteSetup
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the bidirectional message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// No channel exists.
    #[default]
    Absent,
    /// The channel exists but the peer has not completed the setup.
    Connecting,
    /// Frames can be sent and received.
    Open,
    /// The channel was closed by either side.
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Absent => "absent",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of a controller published to observers after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub role: Role,
    pub channel_state: ChannelState,
    /// Human-readable description of the most recent failure, if any.
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    /// The snapshot of a freshly constructed (or reset) controller.
    pub fn idle() -> Self {
        Self::default()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
