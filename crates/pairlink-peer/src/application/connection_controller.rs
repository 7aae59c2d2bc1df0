//! ConnectionController: the per-connection state machine.
//!
//! One controller owns one role, at most one message channel, and the
//! negotiation currently in flight.  All of that lives in a single [`Core`]
//! behind one mutex; every transition is made and published while that lock
//! is held, so snapshot subscribers observe transitions in the order they
//! happened and never see a half-applied change.
//!
//! ```text
//! Idle ──initiate──► Negotiating ──offer ready──► SetupProduced ──┐
//! Idle ──accept────► Negotiating ──answer ready─► AwaitingRemoteSetup ──┤
//!                                                                 ├─ channel open ─► Connected
//! Connected ── channel closed ──► Disconnected                    │
//! any ── transport failure ──► Failed      any ── reset ──► Idle ◄┘
//! ```
//!
//! # Error handling
//!
//! Validation errors (wrong role, wrong state, undecodable blob, channel not
//! open) are returned to the caller and change nothing.  Transport errors
//! move the controller to `Failed` (before the channel opened) or
//! `Disconnected` (after), and are recorded in the snapshot's `last_error`
//! and in the event log.
//!
//! # Session records
//!
//! With a session store attached, connecting registers a reconnect token,
//! ending the session invalidates it, and page turns from the peer advance
//! the followed [`CheckpointScope`].  Those writes are queued while the lock is
//! held and applied by a separate writer task, so file I/O never runs under
//! the controller lock.
//!
//! # Cancellation
//!
//! Every negotiation step runs in its own task.  [`ConnectionController::reset`]
//! bumps a generation counter, aborts that task, and tells the negotiator to
//! release its listener or peer connection.  Results and link events from an
//! older generation are discarded, so nothing a torn-down transport reports
//! afterwards reaches `last_error`.

use std::sync::{Arc, Weak};

use pairlink_core::{
    decode_setup, encode_setup, ChannelState, Command, CommandType, ConnectionSnapshot,
    ConnectionState, Role, SetupBlob, SetupKind, SignalingError,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_log::{EventEntry, EventLog};
use super::message_channel::{ChannelError, ChannelNotice, MessageChannel};
use super::session_writer::{run_store_writer, CheckpointScope, StoreOp};
use super::subscribers::{Subscribers, Subscription};
use crate::infrastructure::negotiation::{
    NegotiatedTransport, NegotiationError, NegotiationInput, Negotiator,
};
use crate::infrastructure::network::link::{FrameLink, LinkState};
use crate::infrastructure::storage::SessionStore;

/// Snapshots buffered per subscriber before it starts lagging.
const SNAPSHOT_BUFFER: usize = 64;

type StepResult = Result<NegotiatedTransport, NegotiationError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cannot {action}: requires the {required} role, current role is {actual}")]
    RoleMismatch {
        action: &'static str,
        required: Role,
        actual: Role,
    },

    #[error("cannot {action} while {state}")]
    InvalidStateTransition {
        action: &'static str,
        state: ConnectionState,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The attempt was torn down by `reset` or `select_role`.
    #[error("connection attempt cancelled by reset")]
    Cancelled,
}

#[derive(Default)]
struct Core {
    generation: u64,
    role: Role,
    state: ConnectionState,
    last_error: Option<String>,
    /// `last_error` came from an undecodable inbound frame.
    decode_error: bool,
    local_setup: Option<SetupBlob>,
    /// Offer received as responder; both sides derive the session id from it.
    remote_offer: Option<SetupBlob>,
    channel: Option<MessageChannel>,
    negotiation: Option<AbortHandle>,
    supervisor: Option<JoinHandle<()>>,
    session_id: Option<String>,
    /// Survives resets; only [`ConnectionController::follow_checkpoint`] changes it.
    checkpoint_scope: Option<CheckpointScope>,
    events: EventLog,
}

impl Core {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            role: self.role,
            channel_state: self
                .channel
                .as_ref()
                .map_or(ChannelState::Absent, MessageChannel::state),
            last_error: self.last_error.clone(),
        }
    }
}

struct Inner {
    negotiator: Arc<dyn Negotiator>,
    store_ops: Option<mpsc::UnboundedSender<StoreOp>>,
    core: Mutex<Core>,
    snapshots: broadcast::Sender<ConnectionSnapshot>,
    commands: Arc<Subscribers<Command>>,
    texts: Arc<Subscribers<String>>,
}

/// Cloneable handle to one connection's state machine.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl ConnectionController {
    pub fn new(negotiator: Arc<dyn Negotiator>) -> Self {
        Self::build(negotiator, None)
    }

    /// A controller that registers a reconnect token for every connected
    /// session and invalidates it when the session ends.
    ///
    /// Must be called from within a Tokio runtime; the store writer runs as
    /// a task.
    pub fn with_store(negotiator: Arc<dyn Negotiator>, store: Arc<SessionStore>) -> Self {
        let (ops, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_store_writer(store, queue));
        Self::build(negotiator, Some(ops))
    }

    fn build(
        negotiator: Arc<dyn Negotiator>,
        store_ops: Option<mpsc::UnboundedSender<StoreOp>>,
    ) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                negotiator,
                store_ops,
                core: Mutex::new(Core::default()),
                snapshots,
                commands: Subscribers::new(),
                texts: Subscribers::new(),
            }),
        }
    }

    pub fn negotiator_name(&self) -> &'static str {
        self.inner.negotiator.name()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Tears down any existing connection and assigns `role`.
    pub fn select_role(&self, role: Role) {
        let mut core = self.inner.core.lock();
        self.inner.teardown(&mut core);
        core.role = role;
        info!("controller: role set to {role}");
        self.inner.publish(&core);
    }

    /// Initiator only, from `Idle`: produces the local offer.
    ///
    /// # Errors
    ///
    /// Validation errors leave the controller unchanged.  A
    /// [`ControllerError::Negotiation`] error means the controller is now
    /// `Failed`.  [`ControllerError::Cancelled`] means a reset intervened.
    pub async fn initiate_connection(&self) -> Result<SetupBlob, ControllerError> {
        let (generation, task) = self.inner.begin_step(
            "initiate a connection",
            Role::Initiator,
            &[ConnectionState::Idle],
            Some(ConnectionState::Negotiating),
            || Ok(NegotiationInput::Start),
        )?;

        self.inner
            .finish_step(generation, task, |inner, core, transport| {
                let NegotiatedTransport { local_setup, link } = transport;
                let Some(offer) = local_setup else {
                    if let Some(link) = link {
                        link.handle().close();
                    }
                    return Err(NegotiationError::Peer(
                        "negotiator produced no offer".to_string(),
                    ));
                };
                core.local_setup = Some(offer.clone());
                core.state = ConnectionState::SetupProduced;
                core.events.push_now("local offer ready");
                if let Some(link) = link {
                    inner.install_link(core, link);
                }
                Ok(offer)
            })
            .await
    }

    /// Responder only, from `Idle`: answers the remote offer.
    ///
    /// Returns the local answer to relay back, or `None` when the transport
    /// needs no answer (the token handshake connects directly).
    pub async fn accept_connection(
        &self,
        remote_setup: &str,
    ) -> Result<Option<SetupBlob>, ControllerError> {
        let (generation, task) = self.inner.begin_step(
            "accept a connection",
            Role::Responder,
            &[ConnectionState::Idle],
            Some(ConnectionState::Negotiating),
            || decode_setup(remote_setup, SetupKind::Offer).map(NegotiationInput::RemoteOffer),
        )?;

        self.inner
            .finish_step(generation, task, |inner, core, transport| {
                let NegotiatedTransport { local_setup, link } = transport;
                let Some(link) = link else {
                    return Err(NegotiationError::Peer(
                        "negotiator produced no channel".to_string(),
                    ));
                };
                core.local_setup = local_setup.clone();
                core.state = ConnectionState::AwaitingRemoteSetup;
                core.events.push_now("remote offer accepted");
                inner.install_link(core, link);
                Ok(local_setup)
            })
            .await
    }

    /// Initiator only, after the offer was produced: applies the remote answer.
    pub async fn complete_connection(&self, remote_setup: &str) -> Result<(), ControllerError> {
        let (generation, task) = self.inner.begin_step(
            "complete a connection",
            Role::Initiator,
            &[
                ConnectionState::SetupProduced,
                ConnectionState::AwaitingRemoteSetup,
            ],
            None,
            || decode_setup(remote_setup, SetupKind::Answer).map(NegotiationInput::RemoteAnswer),
        )?;

        self.inner
            .finish_step(generation, task, |inner, core, transport| {
                core.events.push_now("remote answer applied");
                if let Some(link) = transport.link {
                    inner.install_link(core, link);
                } else if let Some(state) = core.channel.as_ref().map(|c| c.link().state()) {
                    inner.apply_link_state(core, state);
                }
                Ok(())
            })
            .await
    }

    /// Returns to `Idle` with no role, cancelling any negotiation in flight
    /// and closing the channel.  Always succeeds; calling it repeatedly has no
    /// further effect.
    pub fn reset(&self) {
        let mut core = self.inner.core.lock();
        self.inner.teardown(&mut core);
        core.role = Role::None;
        debug!("controller: reset");
        self.inner.publish(&core);
    }

    /// Advances `scope`'s checkpoint in the session store on every `NEXT` or
    /// `PREV` received from the peer.  Replaces any previously followed scope.
    /// Without a store this only remembers the scope.
    pub fn follow_checkpoint(&self, scope: CheckpointScope) {
        info!("controller: following checkpoint {:?}/{}", scope.scope_type, scope.scope_id);
        self.inner.core.lock().checkpoint_scope = Some(scope);
    }

    /// Waits until every session-store write queued so far has been applied.
    pub async fn store_settled(&self) {
        let Some(ops) = &self.inner.store_ops else {
            return;
        };
        let (done, settled) = oneshot::channel();
        if ops.send(StoreOp::Barrier(done)).is_ok() {
            let _ = settled.await;
        }
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// Sends a command stamped now over the open channel.
    pub fn send(&self, command_type: CommandType) -> Result<Command, ControllerError> {
        let core = self.inner.core.lock();
        let channel = open_channel(&core)?;
        Ok(channel.send(Command::now(command_type))?)
    }

    /// Sends a `PING`; the matching `PONG` is logged with its round-trip time.
    pub fn send_ping(&self) -> Result<Command, ControllerError> {
        let core = self.inner.core.lock();
        Ok(open_channel(&core)?.send_ping()?)
    }

    /// Sends `MSG <text>` over a line-framed channel.
    pub fn send_text(&self, text: &str) -> Result<(), ControllerError> {
        let core = self.inner.core.lock();
        open_channel(&core)?.send_text(text)?;
        Ok(())
    }

    /// Subscribes to inbound commands.  The subscription survives reconnects.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Command) + Send + Sync + 'static,
    {
        self.inner.commands.subscribe(callback)
    }

    /// Subscribes to inbound `MSG` payloads.
    pub fn on_text<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.inner.texts.subscribe(callback)
    }

    // ── Observation ───────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.core.lock().snapshot()
    }

    /// The current snapshot plus a receiver for every later one, taken
    /// atomically so no transition falls between them.
    pub fn subscribe(&self) -> (ConnectionSnapshot, broadcast::Receiver<ConnectionSnapshot>) {
        let core = self.inner.core.lock();
        (core.snapshot(), self.inner.snapshots.subscribe())
    }

    /// Waits until a snapshot satisfies `predicate` and returns it.
    pub async fn wait_for<P>(&self, mut predicate: P) -> ConnectionSnapshot
    where
        P: FnMut(&ConnectionSnapshot) -> bool,
    {
        let (mut current, mut updates) = self.subscribe();
        loop {
            if predicate(&current) {
                return current;
            }
            current = match updates.recv().await {
                Ok(next) => next,
                Err(RecvError::Lagged(_)) => self.snapshot(),
                Err(RecvError::Closed) => return current,
            };
        }
    }

    /// Diagnostic events, oldest first.
    pub fn events(&self) -> Vec<EventEntry> {
        self.inner.core.lock().events.entries()
    }

    /// The last local setup produced (offer or answer).
    pub fn local_setup(&self) -> Option<SetupBlob> {
        self.inner.core.lock().local_setup.clone()
    }

    /// Id of the connected session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.inner.core.lock().session_id.clone()
    }
}

/// Both ends of one pairing see the same offer, so an id derived from it names
/// the session identically on both devices.
fn session_id_for(offer: Option<&SetupBlob>) -> String {
    match offer {
        Some(offer) => Uuid::new_v5(&Uuid::NAMESPACE_OID, encode_setup(offer).as_bytes()),
        None => Uuid::new_v4(),
    }
    .to_string()
}

fn open_channel(core: &Core) -> Result<&MessageChannel, ChannelError> {
    core.channel
        .as_ref()
        .ok_or(ChannelError::ChannelNotOpen(ChannelState::Absent))
}

// ── State machine internals ───────────────────────────────────────────────────

impl Inner {
    fn publish(&self, core: &Core) {
        // No receivers is fine; late subscribers read the current snapshot.
        let _ = self.snapshots.send(core.snapshot());
    }

    /// Queues a session-store write.  Called with the core lock held, which
    /// fixes the order the writer applies them in.
    fn record(&self, op: StoreOp) {
        if let Some(ops) = &self.store_ops {
            if ops.send(op).is_err() {
                warn!("controller: session store writer is gone");
            }
        }
    }

    /// Validates role, then state, then input, and only then transitions and
    /// spawns the negotiation step.
    fn begin_step(
        &self,
        action: &'static str,
        required: Role,
        allowed: &[ConnectionState],
        next: Option<ConnectionState>,
        input: impl FnOnce() -> Result<NegotiationInput, SignalingError>,
    ) -> Result<(u64, JoinHandle<StepResult>), ControllerError> {
        let mut core = self.core.lock();
        if core.role != required {
            return Err(ControllerError::RoleMismatch {
                action,
                required,
                actual: core.role,
            });
        }
        if !allowed.contains(&core.state) {
            return Err(ControllerError::InvalidStateTransition {
                action,
                state: core.state,
            });
        }
        let input = input()?;
        if let NegotiationInput::RemoteOffer(offer) = &input {
            core.remote_offer = Some(offer.clone());
        }

        debug!(
            "controller: {} step {:?} via {}",
            core.role,
            input.step_name(),
            self.negotiator.name()
        );
        let negotiator = Arc::clone(&self.negotiator);
        let role = core.role;
        let task = tokio::spawn(async move { negotiator.negotiate(role, input).await });
        core.negotiation = Some(task.abort_handle());

        if let Some(next) = next {
            core.state = next;
            self.publish(&core);
        }
        Ok((core.generation, task))
    }

    /// Awaits a step and applies its outcome, unless a reset superseded it.
    async fn finish_step<T>(
        self: &Arc<Self>,
        generation: u64,
        task: JoinHandle<StepResult>,
        on_success: impl FnOnce(&Arc<Self>, &mut Core, NegotiatedTransport) -> Result<T, NegotiationError>,
    ) -> Result<T, ControllerError> {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Err(ControllerError::Cancelled),
            Err(e) => Err(NegotiationError::Peer(format!("negotiation task failed: {e}"))),
        };

        let mut core = self.core.lock();
        if core.generation != generation {
            if let Ok(NegotiatedTransport {
                link: Some(link), ..
            }) = outcome
            {
                link.handle().close();
            }
            return Err(ControllerError::Cancelled);
        }
        core.negotiation = None;

        let result = outcome.and_then(|transport| on_success(self, &mut *core, transport));
        if let Err(e) = &result {
            self.record_failure(&mut core, ConnectionState::Failed, e);
        }
        self.publish(&core);
        result.map_err(ControllerError::from)
    }

    /// Wraps `link` in a message channel and starts supervising it.  A link
    /// that is already open or already dead is applied immediately.
    fn install_link(self: &Arc<Self>, core: &mut Core, link: FrameLink) {
        if let Some(previous) = core.channel.take() {
            previous.close();
        }
        if let Some(previous) = core.supervisor.take() {
            previous.abort();
        }

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let mut link_state = link.handle().subscribe();
        let current = link_state.borrow_and_update().clone();
        core.channel = Some(MessageChannel::open(
            link,
            Arc::clone(&self.commands),
            Arc::clone(&self.texts),
            notice_tx,
        ));
        core.supervisor = Some(tokio::spawn(supervise(
            Arc::downgrade(self),
            core.generation,
            link_state,
            notice_rx,
        )));
        if current != LinkState::Connecting {
            self.publish(core);
            self.apply_link_state(core, current);
        }
    }

    /// Returns `true` once the link reached a terminal state.
    fn apply_link_state(&self, core: &mut Core, link: LinkState) -> bool {
        match link {
            LinkState::Connecting => false,
            LinkState::Open => {
                if core.state.is_pending_open() {
                    self.mark_connected(core);
                }
                false
            }
            LinkState::Closed | LinkState::Failed(_) => {
                let connected = core.state == ConnectionState::Connected;
                let error = match link {
                    LinkState::Failed(e) => e,
                    _ if connected => NegotiationError::TransportClosedUnexpectedly(
                        "channel closed by peer".to_string(),
                    ),
                    _ => NegotiationError::TransportClosedUnexpectedly(
                        "channel closed before it opened".to_string(),
                    ),
                };
                if connected {
                    self.record_failure(core, ConnectionState::Disconnected, &error);
                    self.end_session(core);
                } else if core.state.is_pending_open() || core.state == ConnectionState::Negotiating
                {
                    self.record_failure(core, ConnectionState::Failed, &error);
                }
                true
            }
        }
    }

    fn mark_connected(&self, core: &mut Core) {
        core.state = ConnectionState::Connected;
        let offer = match core.role {
            Role::Initiator => core.local_setup.as_ref(),
            _ => core.remote_offer.as_ref(),
        };
        let session_id = session_id_for(offer);
        info!("controller: connected, session {session_id}");
        core.events.push_now(format!("connected (session {session_id})"));
        self.record(StoreOp::Register {
            session_id: session_id.clone(),
        });
        core.session_id = Some(session_id);
    }

    fn record_failure(&self, core: &mut Core, next: ConnectionState, error: &NegotiationError) {
        warn!("controller: {} -> {next}: {error}", core.state);
        core.state = next;
        core.last_error = Some(error.to_string());
        core.decode_error = false;
        core.events.push_now(format!("{next}: {error}"));
    }

    fn end_session(&self, core: &mut Core) {
        if let Some(session_id) = core.session_id.take() {
            core.events.push_now(format!("session {session_id} ended"));
            self.record(StoreOp::Invalidate { session_id });
        }
    }

    /// Cancels everything in flight and returns to `Idle`, keeping the role.
    fn teardown(&self, core: &mut Core) {
        core.generation += 1;
        if let Some(task) = core.negotiation.take() {
            task.abort();
        }
        if let Some(task) = core.supervisor.take() {
            task.abort();
        }
        self.negotiator.cancel();
        if let Some(channel) = core.channel.take() {
            channel.close();
        }
        self.end_session(core);
        core.local_setup = None;
        core.remote_offer = None;
        core.state = ConnectionState::Idle;
        core.last_error = None;
        core.decode_error = false;
    }

    fn on_link_state(&self, generation: u64, link: LinkState) -> bool {
        let mut core = self.core.lock();
        if core.generation != generation {
            return true;
        }
        let before = core.snapshot();
        let terminal = self.apply_link_state(&mut core, link);
        if core.snapshot() != before {
            self.publish(&core);
        }
        terminal
    }

    fn on_notice(&self, generation: u64, notice: ChannelNotice) {
        let mut core = self.core.lock();
        if core.generation != generation {
            return;
        }
        match notice {
            ChannelNotice::Delivered(command) => {
                debug!("controller: received {}", command.command_type);
                if let Some(scope) = &core.checkpoint_scope {
                    self.record(StoreOp::Advance {
                        scope: scope.clone(),
                        command,
                    });
                }
                if core.decode_error {
                    core.last_error = None;
                    core.decode_error = false;
                    self.publish(&core);
                }
            }
            ChannelNotice::DecodeFailed(e) => {
                core.last_error = Some(e.to_string());
                core.decode_error = true;
                core.events.push_now(format!("dropped inbound frame: {e}"));
                self.publish(&core);
            }
            ChannelNotice::PingAnswered { ping, .. } => {
                core.events.push_now(format!("answered PING {}", ping.ts));
            }
            ChannelNotice::PongReceived { pong, rtt } => {
                let message = match rtt {
                    Some(rtt) => format!("PONG {} (rtt {} ms)", pong.ts, rtt.as_millis()),
                    None => format!("PONG {} (no ping outstanding)", pong.ts),
                };
                core.events.push_now(message);
            }
            ChannelNotice::Text(text) => {
                info!("controller: MSG {text}");
                core.events.push_now(format!("MSG {text}"));
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if let Some(task) = core.negotiation.take() {
            task.abort();
        }
        if let Some(task) = core.supervisor.take() {
            task.abort();
        }
        if let Some(channel) = core.channel.take() {
            channel.close();
        }
        self.negotiator.cancel();
    }
}

/// Forwards link-state changes and channel notices of one generation to the
/// controller until the link dies or the controller is dropped.
async fn supervise(
    inner: Weak<Inner>,
    generation: u64,
    mut link_state: watch::Receiver<LinkState>,
    mut notices: mpsc::UnboundedReceiver<ChannelNotice>,
) {
    let mut notices_open = true;
    loop {
        tokio::select! {
            changed = link_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = link_state.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else { break };
                if inner.on_link_state(generation, state) {
                    break;
                }
            }
            notice = notices.recv(), if notices_open => match notice {
                Some(notice) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_notice(generation, notice);
                }
                None => notices_open = false,
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
