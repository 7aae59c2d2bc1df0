//! Address-gathering negotiation over a [`PeerConnection`].
//!
//! ```text
//! Initiator                               Responder
//! create_offer ─► wait gathering ─► offer ──(out of band)──► accept_offer
//!                                                            wait gathering
//! apply_answer ◄──────────(out of band)──────────── answer ◄─┘
//!      └─► data channel opens on both sides
//! ```
//!
//! A local description is only relayed once gathering is complete, so the
//! peer receives every candidate in one blob.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pairlink_core::Role;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{unexpected_step, NegotiatedTransport, NegotiationError, NegotiationInput, Negotiator};
use crate::infrastructure::network::link::FrameLink;
use crate::infrastructure::peer::{GatheringState, PeerConnection, PeerFactory};

/// Default bound on the gathering wait.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits until `gathering` reports [`GatheringState::Complete`].
///
/// Resolves without suspending if gathering already finished.  The receiver is
/// consumed, so the registration is released on success, timeout, and
/// cancellation alike.
///
/// # Errors
///
/// - [`NegotiationError::GatheringTimeout`] if `limit` elapses first.
/// - [`NegotiationError::Peer`] if the peer connection is dropped mid-gathering.
pub async fn wait_for_gathering_complete(
    mut gathering: watch::Receiver<GatheringState>,
    limit: Duration,
) -> Result<(), NegotiationError> {
    if *gathering.borrow_and_update() == GatheringState::Complete {
        return Ok(());
    }

    match timeout(limit, gathering.wait_for(|s| *s == GatheringState::Complete)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(NegotiationError::Peer(
            "peer connection dropped during gathering".to_string(),
        )),
        Err(_) => Err(NegotiationError::GatheringTimeout(limit)),
    }
}

/// [`Negotiator`] for offer/answer transports.
///
/// Each `Start` or `RemoteOffer` step creates a fresh peer connection and
/// closes the previous one; `RemoteAnswer` applies to the connection created by
/// the last `Start`.
pub struct GatheringNegotiator {
    factory: Arc<dyn PeerFactory>,
    gather_timeout: Duration,
    current: Mutex<Option<Arc<dyn PeerConnection>>>,
}

impl GatheringNegotiator {
    pub fn new(factory: Arc<dyn PeerFactory>, gather_timeout: Duration) -> Self {
        Self {
            factory,
            gather_timeout,
            current: Mutex::new(None),
        }
    }

    fn fresh_peer(&self) -> Arc<dyn PeerConnection> {
        let peer = self.factory.create();
        if let Some(previous) = self.current.lock().replace(Arc::clone(&peer)) {
            previous.close();
        }
        peer
    }

    async fn gathered(
        &self,
        peer: &Arc<dyn PeerConnection>,
        link: FrameLink,
    ) -> Result<NegotiatedTransport, NegotiationError> {
        let gathering = peer.gathering_state();
        if let Err(e) = wait_for_gathering_complete(gathering, self.gather_timeout).await {
            link.handle().close();
            return Err(e);
        }
        let local = peer.local_description().ok_or_else(|| {
            NegotiationError::Peer("no local description after gathering".to_string())
        })?;
        Ok(NegotiatedTransport {
            local_setup: Some(local),
            link: Some(link),
        })
    }
}

#[async_trait]
impl Negotiator for GatheringNegotiator {
    fn name(&self) -> &'static str {
        "address-gathering"
    }

    async fn negotiate(
        &self,
        role: Role,
        input: NegotiationInput,
    ) -> Result<NegotiatedTransport, NegotiationError> {
        match (role, input) {
            (Role::Initiator, NegotiationInput::Start) => {
                let peer = self.fresh_peer();
                let link = peer.create_offer().await?;
                debug!("gathering: offer created, waiting up to {:?}", self.gather_timeout);
                let transport = self.gathered(&peer, link).await?;
                info!("gathering: local offer ready");
                Ok(transport)
            }
            (Role::Responder, NegotiationInput::RemoteOffer(offer)) => {
                let peer = self.fresh_peer();
                let link = peer.accept_offer(&offer).await?;
                debug!("gathering: answer created, waiting up to {:?}", self.gather_timeout);
                let transport = self.gathered(&peer, link).await?;
                info!("gathering: local answer ready");
                Ok(transport)
            }
            (Role::Initiator, NegotiationInput::RemoteAnswer(answer)) => {
                let peer = self
                    .current
                    .lock()
                    .clone()
                    .ok_or(NegotiationError::NoActiveOffer)?;
                peer.apply_answer(&answer).await?;
                info!("gathering: remote answer applied");
                Ok(NegotiatedTransport {
                    local_setup: None,
                    link: None,
                })
            }
            (role, input) => Err(unexpected_step(role, &input)),
        }
    }

    fn cancel(&self) {
        if let Some(peer) = self.current.lock().take() {
            peer.close();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
