//! Session record store.
//!
//! Holds reconnect tokens, sync checkpoints, and cache entries in three
//! ordered tables behind one lock.  When a path is configured every write is
//! persisted as a JSON snapshot before it becomes visible:
//!
//! 1. clone the tables and apply the change to the copy,
//! 2. write the copy to `<path>.tmp` and rename it over `<path>`,
//! 3. swap the copy in.
//!
//! A failure in step 2 leaves both the file and the in-memory tables at their
//! previous state.  Readers take the shared lock, so they see either all of a
//! write or none of it.
//!
//! Cache entries past their `expires_at` stay in the table until
//! [`SessionStore::evict_expired_cache`] runs, but every reader skips them.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use pairlink_core::{CacheEntry, CheckpointKey, ReconnectToken, SyncCheckpoint};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for session store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing session store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The store file exists but is not a valid snapshot.
    #[error("session store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The tables could not be serialized.
    #[error("failed to serialize session store: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Invalidating a session failed; nothing was changed.
    #[error("failed to invalidate session {session_id}: {source}")]
    StorageInvalidationFailure {
        session_id: String,
        #[source]
        source: Box<StoreError>,
    },
}

/// What [`SessionStore::invalidate_session`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// The deleted token, in its final `Invalidated` state.
    pub token: Option<ReconnectToken>,
    /// Number of cache entries deleted with it.
    pub cache_removed: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub(crate) tokens: BTreeMap<String, ReconnectToken>,
    pub(crate) checkpoints: BTreeMap<CheckpointKey, SyncCheckpoint>,
    pub(crate) cache: BTreeMap<String, CacheEntry>,
}

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    tokens: Vec<ReconnectToken>,
    #[serde(default)]
    checkpoints: Vec<SyncCheckpoint>,
    #[serde(default)]
    cache: Vec<CacheEntry>,
}

impl From<StoreFile> for Tables {
    fn from(file: StoreFile) -> Self {
        Self {
            tokens: file
                .tokens
                .into_iter()
                .map(|t| (t.session_id.clone(), t))
                .collect(),
            checkpoints: file.checkpoints.into_iter().map(|c| (c.key(), c)).collect(),
            cache: file
                .cache
                .into_iter()
                .map(|e| (e.cache_id.clone(), e))
                .collect(),
        }
    }
}

impl From<&Tables> for StoreFile {
    fn from(tables: &Tables) -> Self {
        Self {
            tokens: tables.tokens.values().cloned().collect(),
            checkpoints: tables.checkpoints.values().cloned().collect(),
            cache: tables.cache.values().cloned().collect(),
        }
    }
}

pub struct SessionStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl SessionStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            path: None,
        }
    }

    /// Opens the store backed by `path`, starting empty if the file does not
    /// exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read and
    /// [`StoreError::Corrupt`] if it is not a valid snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<StoreFile>(&content)
                .map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
                .into(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!("session store: opened {}", path.display());
        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ── Reconnect tokens ──────────────────────────────────────────────────────

    /// Inserts or replaces the token for its session.
    pub fn upsert_token(&self, token: ReconnectToken) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.tokens.insert(token.session_id.clone(), token);
        })
    }

    pub fn token(&self, session_id: &str) -> Option<ReconnectToken> {
        self.tables.read().tokens.get(session_id).cloned()
    }

    pub fn tokens(&self) -> Vec<ReconnectToken> {
        self.tables.read().tokens.values().cloned().collect()
    }

    // ── Sync checkpoints ──────────────────────────────────────────────────────

    /// Inserts or replaces the checkpoint for its scope unconditionally.
    pub fn upsert_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.checkpoints.insert(checkpoint.key(), checkpoint);
        })
    }

    pub fn checkpoint(&self, key: &CheckpointKey) -> Option<SyncCheckpoint> {
        self.tables.read().checkpoints.get(key).cloned()
    }

    pub fn checkpoints(&self) -> Vec<SyncCheckpoint> {
        self.tables.read().checkpoints.values().cloned().collect()
    }

    /// Stores a checkpoint received from the peer if its scope has none yet
    /// or its revision is newer.  Returns whether it was stored.
    pub fn accept_remote_checkpoint(&self, incoming: SyncCheckpoint) -> Result<bool, StoreError> {
        let key = incoming.key();
        {
            let tables = self.tables.read();
            if let Some(current) = tables.checkpoints.get(&key) {
                if !incoming.supersedes(current) {
                    debug!(
                        "session store: ignoring checkpoint {:?}/{} rev {} (have rev {})",
                        key.scope_type, key.scope_id, incoming.revision, current.revision
                    );
                    return Ok(false);
                }
            }
        }
        // Re-checked under the write lock; another writer may have won.
        self.mutate(|t| {
            let newer = t
                .checkpoints
                .get(&key)
                .map_or(true, |current| incoming.supersedes(current));
            if newer {
                t.checkpoints.insert(key, incoming);
            }
            newer
        })
    }

    // ── Cache entries ─────────────────────────────────────────────────────────

    pub fn insert_cache_entry(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.cache.insert(entry.cache_id.clone(), entry);
        })
    }

    /// The entry with `cache_id`, or `None` if it is missing or expired at `now`.
    pub fn cache_entry(&self, cache_id: &str, now: i64) -> Option<CacheEntry> {
        self.tables
            .read()
            .cache
            .get(cache_id)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    /// Live cache entries of one session.
    pub fn cache_entries_for_session(&self, session_id: &str, now: i64) -> Vec<CacheEntry> {
        let tables = self.tables.read();
        live_entries(&tables, session_id, now)
    }

    /// A session's token and live cache entries, read in one critical section.
    pub fn session_records(
        &self,
        session_id: &str,
        now: i64,
    ) -> (Option<ReconnectToken>, Vec<CacheEntry>) {
        let tables = self.tables.read();
        (
            tables.tokens.get(session_id).cloned(),
            live_entries(&tables, session_id, now),
        )
    }

    /// Physical number of cache rows, expired ones included.
    pub fn cache_len(&self) -> usize {
        self.tables.read().cache.len()
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Invalidates and deletes the session's token together with every cache
    /// entry of the session, as one write.
    ///
    /// Invalidating an unknown session succeeds with an empty report.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageInvalidationFailure`] if the write could
    /// not be persisted.  The store is unchanged in that case.
    pub fn invalidate_session(&self, session_id: &str) -> Result<InvalidationReport, StoreError> {
        let now = pairlink_core::now_millis();
        let report = self
            .mutate(|t| {
                let token = t.tokens.remove(session_id).map(|mut token| {
                    token.invalidate(now);
                    token
                });
                let before = t.cache.len();
                t.cache.retain(|_, e| e.session_id != session_id);
                InvalidationReport {
                    token,
                    cache_removed: before - t.cache.len(),
                }
            })
            .map_err(|source| {
                warn!("session store: invalidating {session_id} failed: {source}");
                StoreError::StorageInvalidationFailure {
                    session_id: session_id.to_string(),
                    source: Box::new(source),
                }
            })?;

        info!(
            "session store: invalidated {session_id} (token: {}, cache entries: {})",
            report.token.is_some(),
            report.cache_removed
        );
        Ok(report)
    }

    /// Deletes every cache entry with `expires_at <= now` and returns how
    /// many were removed.  Entries without an expiry are kept.
    pub fn evict_expired_cache(&self, now: i64) -> Result<usize, StoreError> {
        if !self.tables.read().cache.values().any(|e| e.is_expired(now)) {
            return Ok(0);
        }
        let removed = self.mutate(|t| {
            let before = t.cache.len();
            t.cache.retain(|_, e| !e.is_expired(now));
            before - t.cache.len()
        })?;
        debug!("session store: evicted {removed} expired cache entries");
        Ok(removed)
    }

    /// Runs `f` against a consistent view of the tables.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.read())
    }

    /// Applies `f` to a copy of the tables, persists the copy, then swaps it
    /// in.  Without a backing file the change is applied in place.
    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, StoreError> {
        let mut tables = self.tables.write();
        let Some(path) = self.path.as_deref() else {
            return Ok(f(&mut tables));
        };

        let mut next = tables.clone();
        let out = f(&mut next);
        persist(path, &next)?;
        *tables = next;
        Ok(out)
    }
}

fn live_entries(tables: &Tables, session_id: &str, now: i64) -> Vec<CacheEntry> {
    tables
        .cache
        .values()
        .filter(|e| e.session_id == session_id && !e.is_expired(now))
        .cloned()
        .collect()
}

fn persist(path: &Path, tables: &Tables) -> Result<(), StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = serde_json::to_string_pretty(&StoreFile::from(tables))?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, content).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
