//! Token-handshake negotiation over a raw TCP stream.
//!
//! The initiator listens and advertises its address as the offer payload; the
//! responder dials that address and authenticates with the shared token:
//!
//! ```text
//! Responder (connector)                 Initiator (acceptor)
//!   connect ─────────────────────────────► accept (one connection only)
//!   HELLO <token> ───────────────────────► compare with HELLO <expected>
//!                  ◄─────────────────────── OK            (match)
//!                  ◄─────────────────────── ERROR TOKEN   (mismatch, then close)
//! ```
//!
//! After `OK`, both sides exchange `PING`/`PONG`/`MSG` lines over the same
//! stream.  The listener is dropped as soon as the first connection arrives,
//! so a second concurrent attempt is refused by the OS instead of reusing the
//! accepted transport.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pairlink_core::{LineMessage, Role, SetupBlob};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use super::{unexpected_step, NegotiatedTransport, NegotiationError, NegotiationInput, Negotiator};
use crate::infrastructure::network::link::{write_line, FrameLink, Framing, LinkDriver};
use crate::infrastructure::network::local_addr::local_ipv4;

/// Default bound on dialing plus the `HELLO`/`OK` exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest handshake line accepted before the peer is considered hostile.
const MAX_HANDSHAKE_LINE: u64 = 256;

/// Settings shared by both sides of the token handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSettings {
    /// Address the initiator listens on.  Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Shared secret both sides were given out of band.
    pub token: String,
    /// Bound on dialing and on each side's wait for the handshake line.
    pub connect_timeout: Duration,
}

/// Returns a random six-digit pairing token in `100000..=999999`.
pub fn generate_token() -> String {
    let n = Uuid::new_v4().as_u128() % 900_000 + 100_000;
    n.to_string()
}

/// [`Negotiator`] that authenticates a TCP stream with a shared token.
pub struct TokenHandshakeNegotiator {
    settings: HandshakeSettings,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenHandshakeNegotiator {
    pub fn new(settings: HandshakeSettings) -> Self {
        Self {
            settings,
            accept_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HandshakeSettings {
        &self.settings
    }

    async fn listen(&self) -> Result<NegotiatedTransport, NegotiationError> {
        self.cancel();
        let listener = bind_listener(self.settings.bind_addr)?;
        let local = listener.local_addr()?;
        let advertised = SocketAddr::new(advertised_ip(local.ip()), local.port());
        info!("handshake: listening on {local}, advertising {advertised}");

        let (link, driver) = FrameLink::new(Framing::Line);
        let task = tokio::spawn(accept_one(
            listener,
            self.settings.token.clone(),
            self.settings.connect_timeout,
            driver,
        ));
        if let Some(previous) = self.accept_task.lock().replace(task) {
            previous.abort();
        }

        Ok(NegotiatedTransport {
            local_setup: Some(SetupBlob::offer(advertised.to_string())),
            link: Some(link),
        })
    }

    async fn dial(&self, offer: &SetupBlob) -> Result<NegotiatedTransport, NegotiationError> {
        let addr: SocketAddr = offer.payload().trim().parse().map_err(|_| {
            NegotiationError::Peer(format!("offer {:?} is not a socket address", offer.payload()))
        })?;
        let (reader, writer) =
            connect_with_token(addr, &self.settings.token, self.settings.connect_timeout).await?;
        info!("handshake: authenticated with {addr}");

        let (link, driver) = FrameLink::new(Framing::Line);
        driver.spawn_line_pump(reader, writer);
        Ok(NegotiatedTransport {
            local_setup: None,
            link: Some(link),
        })
    }
}

#[async_trait]
impl Negotiator for TokenHandshakeNegotiator {
    fn name(&self) -> &'static str {
        "token-handshake"
    }

    async fn negotiate(
        &self,
        role: Role,
        input: NegotiationInput,
    ) -> Result<NegotiatedTransport, NegotiationError> {
        match (role, input) {
            (Role::Initiator, NegotiationInput::Start) => self.listen().await,
            (Role::Responder, NegotiationInput::RemoteOffer(offer)) => self.dial(&offer).await,
            // The acceptor's link opens on its own once the connector authenticates.
            (Role::Initiator, NegotiationInput::RemoteAnswer(_)) => Ok(NegotiatedTransport {
                local_setup: None,
                link: None,
            }),
            (role, input) => Err(unexpected_step(role, &input)),
        }
    }

    fn cancel(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

// ── Handshake steps ───────────────────────────────────────────────────────────

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NegotiationError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1)?)
}

fn advertised_ip(bound: IpAddr) -> IpAddr {
    if bound.is_unspecified() {
        local_ipv4().map(IpAddr::V4).unwrap_or(bound)
    } else {
        bound
    }
}

/// Accepts exactly one connection, verifies its `HELLO` line, and either
/// attaches it to the link or rejects it.  Outcomes are reported through the
/// link state.
async fn accept_one(
    listener: TcpListener,
    token: String,
    handshake_timeout: Duration,
    driver: LinkDriver,
) {
    let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("handshake: accept failed: {e}");
            driver.handle().fail(e.into());
            return;
        }
    };
    drop(listener);
    info!("handshake: connection from {peer}");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let expected = LineMessage::hello(token).to_line();

    let first = match timeout(handshake_timeout, read_handshake_line(&mut reader)).await {
        Err(_) => {
            warn!("handshake: {peer} sent nothing within {handshake_timeout:?}");
            driver
                .handle()
                .fail(NegotiationError::HandshakeTimeout(handshake_timeout));
            return;
        }
        Ok(Err(e)) => {
            warn!("handshake: reading from {peer} failed: {e}");
            driver.handle().fail(e);
            return;
        }
        Ok(Ok(line)) => line,
    };

    // Byte comparison: a line that is not even UTF-8 is just another wrong token.
    if first != expected.as_bytes() {
        warn!("handshake: {peer} presented an invalid token");
        let _ = write_line(&mut write_half, &LineMessage::ErrorToken.to_line()).await;
        let _ = write_half.shutdown().await;
        driver.handle().fail(NegotiationError::AuthenticationRejected);
        return;
    }

    if let Err(e) = write_line(&mut write_half, &LineMessage::Ok.to_line()).await {
        driver.handle().fail(e.into());
        return;
    }
    info!("handshake: {peer} authenticated");
    // Runs inside this task so aborting the accept task also stops the pump.
    driver.run_line_pump(reader, write_half).await;
}

/// Dials `addr`, sends `HELLO <token>`, and waits for the acceptor's verdict.
///
/// # Errors
///
/// - [`NegotiationError::HandshakeTimeout`] if the whole exchange exceeds `limit`.
/// - [`NegotiationError::AuthenticationRejected`] on `ERROR TOKEN`.
/// - [`NegotiationError::TransportClosedUnexpectedly`] if the acceptor hangs up.
/// - [`NegotiationError::Io`] if the connection is refused.
pub async fn connect_with_token(
    addr: SocketAddr,
    token: &str,
    limit: Duration,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), NegotiationError> {
    timeout(limit, exchange_hello(addr, token))
        .await
        .map_err(|_| NegotiationError::HandshakeTimeout(limit))?
}

async fn exchange_hello(
    addr: SocketAddr,
    token: &str,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), NegotiationError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_line(&mut write_half, &LineMessage::hello(token).to_line()).await?;
    let reply = read_handshake_line(&mut reader).await?;
    let reply = String::from_utf8_lossy(&reply);
    match LineMessage::parse(&reply) {
        Ok(LineMessage::Ok) => Ok((reader, write_half)),
        Ok(LineMessage::ErrorToken) => Err(NegotiationError::AuthenticationRejected),
        _ => Err(NegotiationError::Peer(format!(
            "unexpected handshake reply {reply:?}"
        ))),
    }
}

/// Reads one handshake line as raw bytes without its terminator, bounded in
/// length.  Decoding is left to the caller.
async fn read_handshake_line(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<Vec<u8>, NegotiationError> {
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HANDSHAKE_LINE)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Err(NegotiationError::TransportClosedUnexpectedly(
            "stream closed during handshake".to_string(),
        ));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(line)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::link::{Frame, LinkState};

    fn settings(token: &str) -> HandshakeSettings {
        HandshakeSettings {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            token: token.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    async fn wait_terminal(link: &FrameLink) -> LinkState {
        let mut rx = link.handle().subscribe();
        let state = rx
            .wait_for(|s| s.is_terminal() || *s == LinkState::Open)
            .await
            .unwrap()
            .clone();
        state
    }

    #[test]
    fn test_generate_token_is_six_digits() {
        for _ in 0..100 {
            let token = generate_token();
            assert_eq!(token.len(), 6, "{token}");
            let n: u32 = token.parse().unwrap();
            assert!((100_000..=999_999).contains(&n));
        }
    }

    #[tokio::test]
    async fn test_matching_token_opens_both_links() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let joiner = TokenHandshakeNegotiator::new(settings("123456"));

        // Act
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let offer = listening.local_setup.clone().unwrap();
        let dialed = joiner
            .negotiate(Role::Responder, NegotiationInput::RemoteOffer(offer))
            .await
            .unwrap();

        // Assert
        let host_link = listening.link.unwrap();
        let dialed_link = dialed.link.unwrap();
        assert_eq!(wait_terminal(&host_link).await, LinkState::Open);
        // The dialer's pump opens its link once the task gets to run.
        assert_eq!(wait_terminal(&dialed_link).await, LinkState::Open);
        assert!(dialed.local_setup.is_none());
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected_on_both_sides() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let joiner = TokenHandshakeNegotiator::new(settings("wrongtoken"));
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let offer = listening.local_setup.clone().unwrap();

        // Act
        let result = joiner
            .negotiate(Role::Responder, NegotiationInput::RemoteOffer(offer))
            .await;

        // Assert
        assert!(matches!(result, Err(NegotiationError::AuthenticationRejected)), "{result:?}");
        let host_link = listening.link.unwrap();
        assert_eq!(
            wait_terminal(&host_link).await,
            LinkState::Failed(NegotiationError::AuthenticationRejected)
        );
    }

    #[tokio::test]
    async fn test_acceptor_replies_error_token_then_closes() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let addr: SocketAddr = listening.local_setup.unwrap().payload().parse().unwrap();

        // Act – a raw client speaking the line protocol by hand
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"HELLO wrongtoken\n").await.unwrap();
        let mut lines = BufReader::new(read_half).lines();

        // Assert
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ERROR TOKEN"));
        assert_eq!(lines.next_line().await.unwrap(), None, "stream must be closed");
    }

    #[tokio::test]
    async fn test_hello_that_is_not_utf8_is_rejected_as_wrong_token() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let addr: SocketAddr = listening.local_setup.unwrap().payload().parse().unwrap();

        // Act
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"HELLO \xff\xfe\n").await.unwrap();
        let mut lines = BufReader::new(read_half).lines();

        // Assert
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ERROR TOKEN"));
        assert_eq!(
            wait_terminal(listening.link.as_ref().unwrap()).await,
            LinkState::Failed(NegotiationError::AuthenticationRejected)
        );
    }

    #[tokio::test]
    async fn test_garbage_after_authentication_keeps_the_link_open() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let addr: SocketAddr = listening.local_setup.unwrap().payload().parse().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"HELLO 123456\n").await.unwrap();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("OK"));
        let host_link = listening.link.unwrap();
        assert_eq!(wait_terminal(&host_link).await, LinkState::Open);
        let (_tx, mut inbound, handle) = host_link.into_parts();

        // Act
        write_half.write_all(b"\xff\xfe garbage\nPING 1\n").await.unwrap();

        // Assert
        assert!(matches!(inbound.recv().await, Some(Frame::Malformed(_))));
        assert_eq!(inbound.recv().await, Some(Frame::from("PING 1")));
        assert_eq!(handle.state(), LinkState::Open);
    }

    #[tokio::test]
    async fn test_listener_refuses_second_connection_after_first_accept() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let joiner = TokenHandshakeNegotiator::new(settings("123456"));
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let offer = listening.local_setup.clone().unwrap();
        let _first = joiner
            .negotiate(Role::Responder, NegotiationInput::RemoteOffer(offer.clone()))
            .await
            .unwrap();

        // Act
        let second = joiner
            .negotiate(Role::Responder, NegotiationInput::RemoteOffer(offer))
            .await;

        // Assert
        assert!(second.is_err(), "second attempt must not reuse the accepted transport");
    }

    #[tokio::test]
    async fn test_silent_connector_fails_with_handshake_timeout() {
        // Arrange
        let limit = Duration::from_millis(200);
        let host = TokenHandshakeNegotiator::new(HandshakeSettings {
            connect_timeout: limit,
            ..settings("123456")
        });
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let addr: SocketAddr = listening.local_setup.unwrap().payload().parse().unwrap();

        // Act – connect but never send HELLO
        let _stream = TcpStream::connect(addr).await.unwrap();
        let state = wait_terminal(listening.link.as_ref().unwrap()).await;

        // Assert
        assert_eq!(state, LinkState::Failed(NegotiationError::HandshakeTimeout(limit)));
    }

    #[tokio::test]
    async fn test_offer_that_is_not_an_address_is_rejected() {
        let joiner = TokenHandshakeNegotiator::new(settings("123456"));

        let result = joiner
            .negotiate(
                Role::Responder,
                NegotiationInput::RemoteOffer(SetupBlob::offer("X")),
            )
            .await;

        assert!(matches!(result, Err(NegotiationError::Peer(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_cancel_releases_listening_port() {
        // Arrange
        let host = TokenHandshakeNegotiator::new(settings("123456"));
        let listening = host
            .negotiate(Role::Initiator, NegotiationInput::Start)
            .await
            .unwrap();
        let addr: SocketAddr = listening.local_setup.unwrap().payload().parse().unwrap();

        // Act
        host.cancel();
        tokio::task::yield_now().await;

        // Assert – the aborted accept task dropped its listener
        let result = connect_with_token(addr, "123456", Duration::from_secs(1)).await;
        assert!(result.is_err(), "{result:?}");
    }
}
