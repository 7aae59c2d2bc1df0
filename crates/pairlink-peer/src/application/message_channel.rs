//! Typed command channel over an open [`FrameLink`].
//!
//! Outbound commands are encoded according to the link's framing (JSON
//! command frames or `PING <ms>`-style lines).  Inbound frames are decoded by
//! a pump task and dispatched in arrival order:
//!
//! - `PING` is answered with `PONG` immediately and never reaches subscribers.
//! - `PONG` is matched against the last ping sent to measure round-trip time.
//! - Every other command goes to the command subscribers.
//! - `MSG <text>` goes to the text subscribers.
//! - Frames that fail to decode, including input the transport could not
//!   read as text, are dropped; the channel stays open.
//!
//! Each dispatch is also reported as a [`ChannelNotice`] so the owner can log
//! it and track decode errors.

use std::sync::Arc;
use std::time::Duration;

use pairlink_core::{
    decode_command, encode_command, ChannelState, Command, CommandType, LineMessage,
    SignalingError,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::subscribers::{Subscribers, Subscription};
use crate::infrastructure::network::link::{Frame, FrameLink, Framing, LinkHandle, LinkState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Sending requires the channel to be exactly `open`.
    #[error("channel is not open (state: {0})")]
    ChannelNotOpen(ChannelState),

    /// `MSG` payloads only exist on the line-framed transport.
    #[error("free-form text is not supported over {0:?} framing")]
    TextUnsupported(Framing),
}

/// What the inbound pump did with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// A command was delivered to subscribers.
    Delivered(Command),
    /// A frame could not be decoded and was dropped.
    DecodeFailed(SignalingError),
    /// A ping was answered.
    PingAnswered { ping: Command, pong: Command },
    /// A pong arrived; `rtt` is known if a ping was outstanding.
    PongReceived { pong: Command, rtt: Option<Duration> },
    /// Free-form text was delivered to text subscribers.
    Text(String),
}

enum Inbound {
    Command(Command),
    Text(String),
}

pub struct MessageChannel {
    framing: Framing,
    outbound: mpsc::UnboundedSender<Frame>,
    link: LinkHandle,
    commands: Arc<Subscribers<Command>>,
    last_ping: Arc<Mutex<Option<Instant>>>,
    pump: JoinHandle<()>,
}

impl MessageChannel {
    /// Takes ownership of `link` and starts dispatching its inbound frames.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        link: FrameLink,
        commands: Arc<Subscribers<Command>>,
        texts: Arc<Subscribers<String>>,
        notices: mpsc::UnboundedSender<ChannelNotice>,
    ) -> Self {
        let framing = link.framing();
        let (outbound, inbound, handle) = link.into_parts();
        let last_ping = Arc::new(Mutex::new(None));

        let pump = tokio::spawn(run_inbound(
            framing,
            inbound,
            outbound.clone(),
            Arc::clone(&commands),
            texts,
            notices,
            Arc::clone(&last_ping),
        ));

        Self {
            framing,
            outbound,
            link: handle,
            commands,
            last_ping,
            pump,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> ChannelState {
        self.link.state().channel_state()
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Encodes and transmits `command`, returning it for logging.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ChannelNotOpen`] unless the link is open.
    pub fn send(&self, command: Command) -> Result<Command, ChannelError> {
        self.transmit(encode_frame(self.framing, &command))?;
        debug!("channel: sent {}", command.command_type);
        Ok(command)
    }

    /// Sends a `PING` stamped now and starts timing the round trip.
    pub fn send_ping(&self) -> Result<Command, ChannelError> {
        let ping = self.send(Command::now(CommandType::Ping))?;
        *self.last_ping.lock() = Some(Instant::now());
        Ok(ping)
    }

    /// Sends `MSG <text>`.  Line breaks inside `text` become spaces.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::TextUnsupported`] on JSON-framed links and
    /// [`ChannelError::ChannelNotOpen`] unless the link is open.
    pub fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if self.framing != Framing::Line {
            return Err(ChannelError::TextUnsupported(self.framing));
        }
        self.transmit(LineMessage::Text(text.to_string()).to_line())
    }

    /// Subscribes to delivered commands.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Command) + Send + Sync + 'static,
    {
        self.commands.subscribe(callback)
    }

    /// Closes the link.  Idempotent.
    pub fn close(&self) {
        self.link.close();
    }

    fn transmit(&self, frame: String) -> Result<(), ChannelError> {
        let state = self.link.state();
        if state != LinkState::Open {
            return Err(ChannelError::ChannelNotOpen(state.channel_state()));
        }
        self.outbound
            .send(Frame::Text(frame))
            .map_err(|_| ChannelError::ChannelNotOpen(ChannelState::Closed))
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.pump.abort();
        self.link.close();
    }
}

fn encode_frame(framing: Framing, command: &Command) -> String {
    match framing {
        Framing::Json => encode_command(command),
        Framing::Line => LineMessage::Command(*command).to_line(),
    }
}

fn decode_frame(framing: Framing, frame: &Frame) -> Result<Inbound, SignalingError> {
    let frame = match frame {
        Frame::Text(text) => text.as_str(),
        Frame::Malformed(reason) => return Err(SignalingError::MalformedPayload(reason.clone())),
    };
    match framing {
        Framing::Json => decode_command(frame).map(Inbound::Command),
        Framing::Line => match LineMessage::parse(frame)? {
            LineMessage::Command(command) => Ok(Inbound::Command(command)),
            LineMessage::Text(text) => Ok(Inbound::Text(text)),
            other => Err(SignalingError::MalformedPayload(format!(
                "handshake line {:?} after authentication",
                other.to_line()
            ))),
        },
    }
}

async fn run_inbound(
    framing: Framing,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    commands: Arc<Subscribers<Command>>,
    texts: Arc<Subscribers<String>>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
    last_ping: Arc<Mutex<Option<Instant>>>,
) {
    while let Some(frame) = inbound.recv().await {
        let notice = match decode_frame(framing, &frame) {
            Ok(Inbound::Command(ping)) if ping.command_type == CommandType::Ping => {
                let pong = Command::now(CommandType::Pong);
                let _ = outbound.send(Frame::Text(encode_frame(framing, &pong)));
                ChannelNotice::PingAnswered { ping, pong }
            }
            Ok(Inbound::Command(pong)) if pong.command_type == CommandType::Pong => {
                let rtt = last_ping.lock().take().map(|sent| sent.elapsed());
                ChannelNotice::PongReceived { pong, rtt }
            }
            Ok(Inbound::Command(command)) => {
                commands.publish(&command);
                ChannelNotice::Delivered(command)
            }
            Ok(Inbound::Text(text)) => {
                texts.publish(&text);
                ChannelNotice::Text(text)
            }
            Err(e) => {
                warn!("channel: dropping undecodable frame: {e}");
                ChannelNotice::DecodeFailed(e)
            }
        };
        let _ = notices.send(notice);
    }
    debug!("channel: inbound stream ended");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
