//! Transport negotiation.
//!
//! A negotiator drives one connection attempt up to the point where a
//! [`FrameLink`] exists.  Two styles are provided:
//!
//! - **`gathering`** – address-gathering style over a [`PeerConnection`]
//!   (offer/answer plus a wait for route discovery to finish).
//! - **`handshake`** – token-handshake style over a raw TCP stream
//!   (`HELLO <token>` / `OK` / `ERROR TOKEN`).
//!
//! Both implement [`Negotiator`], so the connection controller never branches
//! on the transport.  Which one a process uses is decided once at startup.
//!
//! [`PeerConnection`]: crate::infrastructure::peer::PeerConnection

use std::time::Duration;

use async_trait::async_trait;
use pairlink_core::{Role, SetupBlob};
use thiserror::Error;

use crate::infrastructure::network::link::FrameLink;

pub mod gathering;
pub mod handshake;

pub use gathering::{wait_for_gathering_complete, GatheringNegotiator, ICE_GATHER_TIMEOUT};
pub use handshake::{generate_token, HandshakeSettings, TokenHandshakeNegotiator};

/// Transport-level failures of a connection attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Address/route discovery did not finish in time.
    #[error("address gathering did not complete within {0:?}")]
    GatheringTimeout(Duration),

    /// Dialing or the `HELLO`/`OK` exchange did not finish in time.
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    /// The pairing token did not match.
    #[error("pairing token rejected")]
    AuthenticationRejected,

    /// The stream ended or errored while the session was in use.
    #[error("transport closed unexpectedly: {0}")]
    TransportClosedUnexpectedly(String),

    /// The peer connection refused a setup step.
    #[error("peer connection error: {0}")]
    Peer(String),

    /// `complete` was requested without an outstanding offer.
    #[error("no active offer context")]
    NoActiveOffer,

    /// A socket operation failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for NegotiationError {
    fn from(e: std::io::Error) -> Self {
        NegotiationError::Io(e.to_string())
    }
}

/// One step of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationInput {
    /// Initiator: produce the local offer.
    Start,
    /// Responder: answer the remote offer.
    RemoteOffer(SetupBlob),
    /// Initiator: apply the remote answer to the outstanding offer.
    RemoteAnswer(SetupBlob),
}

impl NegotiationInput {
    pub fn step_name(&self) -> &'static str {
        match self {
            NegotiationInput::Start => "start",
            NegotiationInput::RemoteOffer(_) => "answer an offer",
            NegotiationInput::RemoteAnswer(_) => "apply an answer",
        }
    }
}

/// Result of one negotiation step.
#[derive(Debug)]
pub struct NegotiatedTransport {
    /// Setup to relay to the peer out of band.  Always present after `Start`.
    pub local_setup: Option<SetupBlob>,
    /// The channel end created by this step, in `Connecting` or `Open` state.
    /// `None` when the step completed a link handed out earlier.
    pub link: Option<FrameLink>,
}

/// Strategy driving connectivity establishment for one controller.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Runs one negotiation step for `role`.
    ///
    /// # Errors
    ///
    /// Returns the [`NegotiationError`] that ended the step.  Dropping the
    /// returned future cancels the step and releases its listeners.
    async fn negotiate(
        &self,
        role: Role,
        input: NegotiationInput,
    ) -> Result<NegotiatedTransport, NegotiationError>;

    /// Tears down any transport state held between steps (open listener,
    /// outstanding peer connection).  Idempotent; never fails.
    fn cancel(&self);
}

pub(crate) fn unexpected_step(role: Role, input: &NegotiationInput) -> NegotiationError {
    NegotiationError::Peer(format!("{role} cannot {}", input.step_name()))
}
