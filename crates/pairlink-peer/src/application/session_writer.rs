//! Session-store writes issued by the connection controller.
//!
//! The controller decides what to record while it holds its state lock and
//! queues a [`StoreOp`].  One writer task per controller applies the queue in
//! order, outside that lock, on a blocking thread when the store persists to
//! disk.  Queue order is decision order, so a session is never invalidated
//! before its token was registered.

use std::sync::Arc;

use pairlink_core::{
    now_millis, CheckpointKey, Command, CommandType, ReconnectToken, ScopeType, SyncCheckpoint,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::infrastructure::storage::SessionStore;

/// The collaboration scope whose checkpoint follows the peer's page turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointScope {
    pub scope_type: ScopeType,
    pub scope_id: String,
    /// Song shown in this scope; recorded on every checkpoint.
    pub song_ref: String,
    /// Recorded as the sender of changes that arrive from the peer.
    pub peer_id: String,
}

impl CheckpointScope {
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(self.scope_type, self.scope_id.clone())
    }
}

pub(crate) enum StoreOp {
    /// Register an active reconnect token for a connected session.
    Register { session_id: String },
    /// End a session: invalidate its token and drop its cache entries.
    Invalidate { session_id: String },
    /// Apply a page turn received from the peer to the scope's checkpoint.
    Advance {
        scope: CheckpointScope,
        command: Command,
    },
    /// Completes once every earlier operation has been applied.
    Barrier(oneshot::Sender<()>),
}

/// The checkpoint that results from applying `command` on top of `current`.
///
/// `NEXT` moves one page forward and `PREV` one page back, never below page 0.
/// Every accepted change bumps the revision by one.
pub(crate) fn advance(
    current: Option<&SyncCheckpoint>,
    scope: &CheckpointScope,
    command: &Command,
    now: i64,
) -> SyncCheckpoint {
    let (page_index, revision) = current.map_or((0, 0), |c| (c.page_index, c.revision));
    let page_index = match command.command_type {
        CommandType::Next => page_index.saturating_add(1),
        CommandType::Prev => page_index.saturating_sub(1),
        CommandType::Ping | CommandType::Pong => page_index,
    };
    SyncCheckpoint {
        scope_type: scope.scope_type,
        scope_id: scope.scope_id.clone(),
        song_ref: scope.song_ref.clone(),
        page_index,
        revision: revision + 1,
        last_change_ts: command.ts,
        last_change_sender_id: scope.peer_id.clone(),
        updated_at: now,
    }
}

/// Applies queued operations until every sender is gone.
pub(crate) async fn run_store_writer(
    store: Arc<SessionStore>,
    mut ops: mpsc::UnboundedReceiver<StoreOp>,
) {
    while let Some(op) = ops.recv().await {
        let op = match op {
            StoreOp::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            op => op,
        };
        if store.path().is_none() {
            apply(&store, op);
            continue;
        }
        let store = Arc::clone(&store);
        if let Err(e) = tokio::task::spawn_blocking(move || apply(&store, op)).await {
            warn!("session store: write task failed: {e}");
        }
    }
    debug!("session store: writer stopped");
}

fn apply(store: &SessionStore, op: StoreOp) {
    match op {
        StoreOp::Register { session_id } => {
            let secret = Uuid::new_v4().simple().to_string();
            let token = ReconnectToken::new(session_id.clone(), secret, now_millis());
            if let Err(e) = store.upsert_token(token) {
                warn!("session store: could not register session {session_id}: {e}");
            }
        }
        StoreOp::Invalidate { session_id } => {
            // The store logs the outcome itself.
            let _ = store.invalidate_session(&session_id);
        }
        StoreOp::Advance { scope, command } => {
            let next = advance(store.checkpoint(&scope.key()).as_ref(), &scope, &command, now_millis());
            let revision = next.revision;
            match store.accept_remote_checkpoint(next) {
                Ok(true) => debug!(
                    "session store: {:?}/{} at rev {revision}",
                    scope.scope_type, scope.scope_id
                ),
                Ok(false) => {}
                Err(e) => warn!("session store: checkpoint for {} not saved: {e}", scope.scope_id),
            }
        }
        StoreOp::Barrier(done) => {
            let _ = done.send(());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> CheckpointScope {
        CheckpointScope {
            scope_type: ScopeType::SoloPair,
            scope_id: "pair-1".to_string(),
            song_ref: "song-7".to_string(),
            peer_id: "tablet".to_string(),
        }
    }

    #[test]
    fn test_first_next_starts_a_checkpoint_at_page_one() {
        let next = advance(None, &scope(), &Command::new(CommandType::Next, 42), 100);

        assert_eq!(next.page_index, 1);
        assert_eq!(next.revision, 1);
        assert_eq!(next.last_change_ts, 42);
        assert_eq!(next.last_change_sender_id, "tablet");
        assert_eq!(next.song_ref, "song-7");
        assert_eq!(next.updated_at, 100);
    }

    #[test]
    fn test_prev_never_goes_below_first_page() {
        // Arrange
        let first = advance(None, &scope(), &Command::new(CommandType::Prev, 1), 1);

        // Act
        let second = advance(Some(&first), &scope(), &Command::new(CommandType::Prev, 2), 2);

        // Assert
        assert_eq!(first.page_index, 0);
        assert_eq!(second.page_index, 0);
        assert_eq!(second.revision, 2, "every turn is a new revision");
    }

    #[tokio::test]
    async fn test_writer_applies_operations_in_queue_order() {
        // Arrange
        let store = Arc::new(SessionStore::in_memory());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_store_writer(Arc::clone(&store), rx));

        // Act
        tx.send(StoreOp::Register { session_id: "s1".to_string() }).unwrap();
        tx.send(StoreOp::Advance { scope: scope(), command: Command::new(CommandType::Next, 1) })
            .unwrap();
        tx.send(StoreOp::Advance { scope: scope(), command: Command::new(CommandType::Next, 2) })
            .unwrap();
        tx.send(StoreOp::Invalidate { session_id: "s1".to_string() }).unwrap();
        let (done, settled) = oneshot::channel();
        tx.send(StoreOp::Barrier(done)).unwrap();
        settled.await.unwrap();

        // Assert
        assert!(store.token("s1").is_none(), "registered, then invalidated");
        let checkpoint = store.checkpoint(&scope().key()).unwrap();
        assert_eq!((checkpoint.page_index, checkpoint.revision), (2, 2));

        drop(tx);
        writer.await.unwrap();
    }
}
