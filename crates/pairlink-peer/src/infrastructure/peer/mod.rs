//! Peer-connection seam for the address-gathering transport.
//!
//! A [`PeerConnection`] is the offer/answer engine underneath the gathering
//! negotiator: it creates local descriptions, gathers addresses in the
//! background, applies the remote description, and eventually opens the data
//! channel it handed out as a [`FrameLink`].
//!
//! # Testability
//!
//! The `memory` implementation pairs two peers inside one process through a
//! shared [`MemoryRendezvous`], with a configurable gathering delay.  It backs
//! the `demo` command and the controller tests.

use std::sync::Arc;

use async_trait::async_trait;
use pairlink_core::SetupBlob;
use tokio::sync::watch;

use crate::infrastructure::negotiation::NegotiationError;
use crate::infrastructure::network::link::FrameLink;

pub mod memory;

pub use memory::{MemoryPeer, MemoryPeerFactory, MemoryRendezvous};

/// Progress of local address gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates the data channel and the local offer, and starts gathering.
    async fn create_offer(&self) -> Result<FrameLink, NegotiationError>;

    /// Applies a remote offer, creates the local answer, and starts gathering.
    async fn accept_offer(&self, offer: &SetupBlob) -> Result<FrameLink, NegotiationError>;

    /// Applies the remote answer to the outstanding offer.
    async fn apply_answer(&self, answer: &SetupBlob) -> Result<(), NegotiationError>;

    /// The local description including every candidate gathered so far.
    fn local_description(&self) -> Option<SetupBlob>;

    /// Observes gathering progress.  Dropping the receiver unregisters it.
    fn gathering_state(&self) -> watch::Receiver<GatheringState>;

    /// Closes the connection and its data channel.  Idempotent.
    fn close(&self);
}

/// Creates a fresh [`PeerConnection`] for each connection attempt.
pub trait PeerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn PeerConnection>;
}
