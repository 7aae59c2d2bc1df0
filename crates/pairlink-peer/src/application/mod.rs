//! Application layer for the peer.
//!
//! # Sub-modules
//!
//! - **`connection_controller`** – The per-connection state machine: role
//!   selection, the offer/answer steps, reset, and snapshot publication.
//!
//! - **`message_channel`** – Typed commands over an open frame link, with
//!   automatic ping/pong handling.
//!
//! - **`subscribers`** – Callback registry with explicit unsubscription,
//!   shared by the controller and its channels so subscriptions survive
//!   reconnects.
//!
//! - **`session_writer`** – The ordered queue of session-store writes
//!   (reconnect tokens, checkpoint advances) the controller issues, applied
//!   off its lock.
//!
//! - **`event_log`** – The bounded diagnostic log shown by the CLI.
//!
//! The controller depends on the [`Negotiator`] trait only; which transport
//! sits behind it is decided once at startup.
//!
//! [`Negotiator`]: crate::infrastructure::negotiation::Negotiator

pub mod connection_controller;
pub mod event_log;
pub mod message_channel;
pub mod session_writer;
pub mod subscribers;

pub use connection_controller::{ConnectionController, ControllerError};
pub use event_log::{EventEntry, EventLog};
pub use message_channel::{ChannelError, ChannelNotice, MessageChannel};
pub use session_writer::CheckpointScope;
pub use subscribers::{Subscribers, Subscription};
