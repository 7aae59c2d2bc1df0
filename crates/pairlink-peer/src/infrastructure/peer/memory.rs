//! In-process [`PeerConnection`] implementation.
//!
//! Two `MemoryPeer`s sharing a [`MemoryRendezvous`] behave like a pair of
//! browsers on the same LAN: the initiator's offer names a session id, the
//! responder claims the parked data channel for that session, and applying
//! the answer opens the channel on both sides.
//!
//! Gathering finishes after `gather_delay`; `None` means it never finishes,
//! which is how gathering timeouts are exercised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pairlink_core::{SetupBlob, SetupKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::{GatheringState, PeerConnection, PeerFactory};
use crate::infrastructure::negotiation::NegotiationError;
use crate::infrastructure::network::link::{FrameLink, Framing, LinkHandle};

/// Data channels parked by initiators, keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct MemoryRendezvous {
    pending: Arc<Mutex<HashMap<String, FrameLink>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of offers nobody has answered yet.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn park(&self, session: String, link: FrameLink) {
        self.pending.lock().insert(session, link);
    }

    fn claim(&self, session: &str) -> Option<FrameLink> {
        self.pending.lock().remove(session)
    }
}

#[derive(Default)]
struct PeerInner {
    session: Option<String>,
    local_kind: Option<SetupKind>,
    link: Option<LinkHandle>,
    gather_task: Option<JoinHandle<()>>,
    closed: bool,
}

pub struct MemoryPeer {
    rendezvous: MemoryRendezvous,
    gather_delay: Option<Duration>,
    gathering: Arc<watch::Sender<GatheringState>>,
    inner: Mutex<PeerInner>,
}

impl MemoryPeer {
    pub fn new(rendezvous: MemoryRendezvous, gather_delay: Option<Duration>) -> Self {
        let (gathering, _) = watch::channel(GatheringState::New);
        Self {
            rendezvous,
            gather_delay,
            gathering: Arc::new(gathering),
            inner: Mutex::new(PeerInner::default()),
        }
    }

    /// Number of live gathering observers.
    pub fn gathering_listener_count(&self) -> usize {
        self.gathering.receiver_count()
    }

    fn start_gathering(&self, inner: &mut PeerInner) {
        self.gathering.send_replace(GatheringState::Gathering);
        match self.gather_delay {
            Some(delay) if delay.is_zero() => {
                self.gathering.send_replace(GatheringState::Complete);
            }
            Some(delay) => {
                let gathering = Arc::clone(&self.gathering);
                inner.gather_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    gathering.send_replace(GatheringState::Complete);
                }));
            }
            None => {}
        }
    }

    fn ensure_usable(inner: &PeerInner) -> Result<(), NegotiationError> {
        if inner.closed {
            return Err(NegotiationError::Peer("peer connection is closed".to_string()));
        }
        if inner.session.is_some() {
            return Err(NegotiationError::Peer(
                "local description already created".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn create_offer(&self) -> Result<FrameLink, NegotiationError> {
        let mut inner = self.inner.lock();
        Self::ensure_usable(&inner)?;

        let session = Uuid::new_v4().simple().to_string();
        let (local, remote) = FrameLink::pair(Framing::Json);
        self.rendezvous.park(session.clone(), remote);
        debug!("memory peer: offering session {session}");

        inner.link = Some(local.handle().clone());
        inner.session = Some(session);
        inner.local_kind = Some(SetupKind::Offer);
        self.start_gathering(&mut inner);
        Ok(local)
    }

    async fn accept_offer(&self, offer: &SetupBlob) -> Result<FrameLink, NegotiationError> {
        let mut inner = self.inner.lock();
        Self::ensure_usable(&inner)?;

        let session = session_of(offer.payload()).ok_or_else(|| {
            NegotiationError::Peer("offer is not a memory session description".to_string())
        })?;
        let link = self.rendezvous.claim(&session).ok_or_else(|| {
            NegotiationError::Peer(format!("no pending offer for session {session}"))
        })?;
        debug!("memory peer: answering session {session}");

        inner.link = Some(link.handle().clone());
        inner.session = Some(session);
        inner.local_kind = Some(SetupKind::Answer);
        self.start_gathering(&mut inner);
        Ok(link)
    }

    async fn apply_answer(&self, answer: &SetupBlob) -> Result<(), NegotiationError> {
        let inner = self.inner.lock();
        if inner.closed || inner.local_kind != Some(SetupKind::Offer) {
            return Err(NegotiationError::NoActiveOffer);
        }
        let (Some(session), Some(link)) = (inner.session.as_deref(), inner.link.as_ref()) else {
            return Err(NegotiationError::NoActiveOffer);
        };

        match session_of(answer.payload()) {
            Some(remote) if remote == session => {
                link.mark_open();
                Ok(())
            }
            Some(remote) => Err(NegotiationError::Peer(format!(
                "answer is for session {remote}, expected {session}"
            ))),
            None => Err(NegotiationError::Peer(
                "answer is not a memory session description".to_string(),
            )),
        }
    }

    fn local_description(&self) -> Option<SetupBlob> {
        let inner = self.inner.lock();
        let session = inner.session.as_deref()?;
        let kind = inner.local_kind?;
        let gathered = *self.gathering.borrow() == GatheringState::Complete;
        Some(SetupBlob::new(kind, describe(session, kind, gathered)))
    }

    fn gathering_state(&self) -> watch::Receiver<GatheringState> {
        self.gathering.subscribe()
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(task) = inner.gather_task.take() {
            task.abort();
        }
        if let Some(link) = inner.link.take() {
            link.close();
        }
        if inner.local_kind == Some(SetupKind::Offer) {
            if let Some(session) = inner.session.as_deref() {
                self.rendezvous.claim(session);
            }
        }
    }
}

/// Builds [`MemoryPeer`]s sharing one rendezvous.
#[derive(Debug, Clone)]
pub struct MemoryPeerFactory {
    rendezvous: MemoryRendezvous,
    gather_delay: Option<Duration>,
}

impl MemoryPeerFactory {
    pub fn new(rendezvous: MemoryRendezvous, gather_delay: Option<Duration>) -> Self {
        Self {
            rendezvous,
            gather_delay,
        }
    }
}

impl PeerFactory for MemoryPeerFactory {
    fn create(&self) -> Arc<dyn PeerConnection> {
        Arc::new(MemoryPeer::new(self.rendezvous.clone(), self.gather_delay))
    }
}

fn describe(session: &str, kind: SetupKind, gathered: bool) -> String {
    let setup = match kind {
        SetupKind::Offer => "actpass",
        SetupKind::Answer => "active",
    };
    let mut sdp = format!(
        "v=0\r\no=- {session} 2 IN IP4 127.0.0.1\r\ns=pairlink-memory\r\na=setup:{setup}\r\n"
    );
    if gathered {
        sdp.push_str("a=candidate:1 1 udp 2122260223 127.0.0.1 9 typ host\r\na=end-of-candidates\r\n");
    }
    sdp
}

fn session_of(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::link::LinkState;

    fn peer(rendezvous: &MemoryRendezvous) -> MemoryPeer {
        MemoryPeer::new(rendezvous.clone(), Some(Duration::ZERO))
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_opens_both_ends() {
        // Arrange
        let rendezvous = MemoryRendezvous::new();
        let initiator = peer(&rendezvous);
        let responder = peer(&rendezvous);

        // Act
        let a = initiator.create_offer().await.unwrap();
        let offer = initiator.local_description().unwrap();
        let b = responder.accept_offer(&offer).await.unwrap();
        let answer = responder.local_description().unwrap();
        initiator.apply_answer(&answer).await.unwrap();

        // Assert
        assert_eq!(offer.kind(), SetupKind::Offer);
        assert_eq!(answer.kind(), SetupKind::Answer);
        assert_eq!(a.state(), LinkState::Open);
        assert_eq!(b.state(), LinkState::Open);
        assert_eq!(rendezvous.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_local_description_lists_candidates_only_after_gathering() {
        // Arrange
        let rendezvous = MemoryRendezvous::new();
        let slow = MemoryPeer::new(rendezvous.clone(), None);

        // Act
        let _link = slow.create_offer().await.unwrap();
        let before = slow.local_description().unwrap();
        slow.gathering.send_replace(GatheringState::Complete);
        let after = slow.local_description().unwrap();

        // Assert
        assert!(!before.payload().contains("a=candidate"));
        assert!(after.payload().contains("a=candidate"));
    }

    #[tokio::test]
    async fn test_answer_for_other_session_is_rejected() {
        // Arrange
        let rendezvous = MemoryRendezvous::new();
        let initiator = peer(&rendezvous);
        let _link = initiator.create_offer().await.unwrap();
        let foreign = SetupBlob::answer(describe("someone-else", SetupKind::Answer, true));

        // Act
        let result = initiator.apply_answer(&foreign).await;

        // Assert
        assert!(matches!(result, Err(NegotiationError::Peer(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_apply_answer_without_offer_is_no_active_offer() {
        let rendezvous = MemoryRendezvous::new();
        let initiator = peer(&rendezvous);
        let answer = SetupBlob::answer(describe("s", SetupKind::Answer, true));

        assert_eq!(
            initiator.apply_answer(&answer).await,
            Err(NegotiationError::NoActiveOffer)
        );
    }

    #[tokio::test]
    async fn test_close_releases_parked_offer_and_closes_link() {
        // Arrange
        let rendezvous = MemoryRendezvous::new();
        let initiator = peer(&rendezvous);
        let link = initiator.create_offer().await.unwrap();

        // Act
        initiator.close();
        initiator.close();

        // Assert
        assert_eq!(rendezvous.pending_len(), 0);
        assert_eq!(link.state(), LinkState::Closed);
        assert!(initiator.create_offer().await.is_err());
    }

    #[test]
    fn test_session_of_reads_origin_line() {
        let sdp = describe("abc123", SetupKind::Offer, false);
        assert_eq!(session_of(&sdp).as_deref(), Some("abc123"));
        assert_eq!(session_of("X"), None);
    }
}
