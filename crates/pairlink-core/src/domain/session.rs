//! Session records persisted alongside a paired connection.
//!
//! - [`ReconnectToken`]: one per logical session, keyed by `session_id`.
//! - [`SyncCheckpoint`]: last-agreed shared state for a scope, keyed by
//!   [`CheckpointKey`] (scope type + scope id).
//! - [`CacheEntry`]: disposable data scoped to a session, keyed by `cache_id`.
//!
//! All timestamps are Unix epoch milliseconds.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`ReconnectToken`].
///
/// The only legal transition is `Active -> Invalidated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Invalidated,
}

/// How the follower side was tracking the session when it last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Pages follow the authoritative side.
    #[default]
    Follow,
    /// Pages are browsed independently.
    Free,
}

/// Credential that lets a device rejoin a session it already authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectToken {
    pub session_id: String,
    pub secret: String,
    pub status: TokenStatus,
    pub last_mode: SessionMode,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ReconnectToken {
    /// Creates an active token for a freshly authenticated session.
    pub fn new(session_id: impl Into<String>, secret: impl Into<String>, now: i64) -> Self {
        Self {
            session_id: session_id.into(),
            secret: secret.into(),
            status: TokenStatus::Active,
            last_mode: SessionMode::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    /// Marks the token invalidated.  Calling this on an invalidated token
    /// only refreshes `updated_at`.
    pub fn invalidate(&mut self, now: i64) {
        self.status = TokenStatus::Invalidated;
        self.updated_at = now;
    }
}

/// Kind of collaboration scope a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// Two paired devices, one leading.
    SoloPair,
    /// The authoritative side of a group session.
    GroupLeader,
    /// A following member of a group session.
    GroupFollower,
}

/// Composite key of a [`SyncCheckpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub scope_type: ScopeType,
    pub scope_id: String,
}

impl CheckpointKey {
    pub fn new(scope_type: ScopeType, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type,
            scope_id: scope_id.into(),
        }
    }
}

/// Last-agreed shared state for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub scope_type: ScopeType,
    pub scope_id: String,
    /// Identifier of the song (content record) currently shown.
    pub song_ref: String,
    pub page_index: u32,
    /// Monotonic revision; a remote update is accepted only if it is newer.
    pub revision: u64,
    pub last_change_ts: i64,
    pub last_change_sender_id: String,
    pub updated_at: i64,
}

impl SyncCheckpoint {
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(self.scope_type, self.scope_id.clone())
    }

    /// Returns `true` if `self` should replace `current`.
    pub fn supersedes(&self, current: &SyncCheckpoint) -> bool {
        self.revision > current.revision
    }
}

/// Derived, time-bounded data tied to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_id: String,
    pub session_id: String,
    pub content_ref: String,
    /// `None` means the entry only goes away with its session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl CacheEntry {
    /// An entry whose expiry is at or before `now` is logically dead.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
