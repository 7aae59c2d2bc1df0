//! Integrity scans over the session store.
//!
//! Scans only report.  Deleting what they find is left to the operator
//! (`pairlink store invalidate <session>`), because an orphan may be the
//! symptom of a bug worth inspecting first.

use std::collections::BTreeSet;

use pairlink_core::{CacheEntry, SyncCheckpoint};

use super::session_store::SessionStore;

/// Records whose references no longer resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Cache entries whose session has no reconnect token.
    pub cache_entries: Vec<CacheEntry>,
    /// Checkpoints pointing at a song id outside the known set.
    pub checkpoints: Vec<SyncCheckpoint>,
}

impl OrphanReport {
    pub fn is_empty(&self) -> bool {
        self.cache_entries.is_empty() && self.checkpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cache_entries.len() + self.checkpoints.len()
    }
}

impl SessionStore {
    /// Finds cache entries without an owning token and checkpoints whose
    /// `song_ref` is not in `known_songs`.  Nothing is deleted.
    pub fn find_orphan_references(&self, known_songs: &BTreeSet<String>) -> OrphanReport {
        self.read(|tables| OrphanReport {
            cache_entries: tables
                .cache
                .values()
                .filter(|e| !tables.tokens.contains_key(&e.session_id))
                .cloned()
                .collect(),
            checkpoints: tables
                .checkpoints
                .values()
                .filter(|c| !known_songs.contains(&c.song_ref))
                .cloned()
                .collect(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
