//! Transport-agnostic frame links.
//!
//! A [`FrameLink`] is the application's end of one bidirectional channel: an
//! outbound queue, an inbound queue, and a shared [`LinkState`].  The other end
//! is either a second `FrameLink` (in-process peer connection) or a
//! [`LinkDriver`] that pumps frames to and from a byte stream.
//!
//! Frames are whole text messages without a trailing newline.  The
//! [`Framing`] tag tells the message channel how to decode them.  Input a
//! transport cannot turn into text (invalid UTF-8, an over-long line) arrives
//! as [`Frame::Malformed`] so the channel can drop it and keep going.
//!
//! Closing is cooperative: [`LinkHandle::close`] flips the shared state to
//! `Closed`, and every pump selects on that state so a pending read is dropped
//! (and the socket released) as soon as the link closes.

use std::io;
use std::sync::Arc;

use pairlink_core::ChannelState;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::infrastructure::negotiation::NegotiationError;

/// How frames on a link are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `{"type":"...","ts":...}` command frames.
    Json,
    /// `PING <ms>` / `MSG <text>` lines.
    Line,
}

/// Longest inbound line the stream pump buffers, terminator excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One unit travelling over a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete frame without its line terminator.
    Text(String),
    /// Input the transport could not turn into a frame; carries the reason.
    Malformed(String),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Malformed(_) => None,
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

/// Lifecycle of a link.  `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    /// Closed locally or by the peer.
    Closed,
    /// The transport failed before or while open.
    Failed(NegotiationError),
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed(_))
    }

    pub fn channel_state(&self) -> ChannelState {
        match self {
            LinkState::Connecting => ChannelState::Connecting,
            LinkState::Open => ChannelState::Open,
            LinkState::Closed | LinkState::Failed(_) => ChannelState::Closed,
        }
    }
}

/// Cloneable handle to a link's shared state.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    state: Arc<watch::Sender<LinkState>>,
}

impl LinkHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(LinkState::Connecting);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// `Connecting -> Open`.  Returns `false` if the link was not connecting.
    pub fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Connecting {
                *state = LinkState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Moves a non-terminal link to `Closed`.  Idempotent.
    pub fn close(&self) {
        self.transition_terminal(LinkState::Closed);
    }

    /// Moves a non-terminal link to `Failed`.  A link that already closed
    /// keeps its first terminal state.
    pub fn fail(&self, error: NegotiationError) {
        self.transition_terminal(LinkState::Failed(error));
    }

    fn transition_terminal(&self, next: LinkState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

/// The application's end of a bidirectional channel.
#[derive(Debug)]
pub struct FrameLink {
    framing: Framing,
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    handle: LinkHandle,
}

/// The transport's end of a [`FrameLink`].
#[derive(Debug)]
pub struct LinkDriver {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    handle: LinkHandle,
}

impl FrameLink {
    /// Creates a link in the `Connecting` state together with the driver
    /// that will attach it to a transport.
    pub fn new(framing: Framing) -> (FrameLink, LinkDriver) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new();
        (
            FrameLink {
                framing,
                outbound: out_tx,
                inbound: in_rx,
                handle: handle.clone(),
            },
            LinkDriver {
                inbound: in_tx,
                outbound: out_rx,
                handle,
            },
        )
    }

    /// Creates two cross-connected ends sharing one state, as an in-process
    /// peer connection does.
    pub fn pair(framing: Framing) -> (FrameLink, FrameLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new();
        (
            FrameLink {
                framing,
                outbound: a_tx,
                inbound: b_rx,
                handle: handle.clone(),
            },
            FrameLink {
                framing,
                outbound: b_tx,
                inbound: a_rx,
                handle,
            },
        )
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn handle(&self) -> &LinkHandle {
        &self.handle
    }

    pub fn state(&self) -> LinkState {
        self.handle.state()
    }

    /// Splits the link into its outbound sender, inbound receiver, and handle.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Frame>,
        mpsc::UnboundedReceiver<Frame>,
        LinkHandle,
    ) {
        (self.outbound, self.inbound, self.handle)
    }
}

impl LinkDriver {
    pub fn handle(&self) -> &LinkHandle {
        &self.handle
    }

    /// Opens the link and pumps `\n`-terminated lines between it and a byte
    /// stream until either side closes.
    ///
    /// - End of stream from the peer closes the link.
    /// - A read or write error fails it with `TransportClosedUnexpectedly`.
    /// - A line that is not UTF-8 or longer than [`MAX_FRAME_LEN`] is passed
    ///   on as [`Frame::Malformed`]; the link stays open.
    /// - Closing the link locally stops both directions and shuts the writer down.
    pub fn spawn_line_pump<R, W>(self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.run_line_pump(reader, writer))
    }

    /// Same as [`spawn_line_pump`](Self::spawn_line_pump) on the current task.
    pub(crate) async fn run_line_pump<R, W>(self, reader: R, mut writer: W)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let LinkDriver {
            inbound,
            mut outbound,
            handle,
        } = self;
        let mut lines = BoundedLines::new(reader, MAX_FRAME_LEN);
        let mut state = handle.subscribe();
        if !handle.mark_open() {
            // Closed before the transport was attached.
            let _ = writer.shutdown().await;
            return;
        }

        loop {
            tokio::select! {
                // The watch guard must not live across the write below.
                _ = async { let _ = state.wait_for(LinkState::is_terminal).await; } => break,
                frame = lines.next_frame() => match frame {
                    Ok(Some(frame)) => {
                        if let Frame::Malformed(reason) = &frame {
                            debug!("link: undecodable line: {reason}");
                        }
                        if inbound.send(frame).is_err() {
                            handle.close();
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("link: peer closed the stream");
                        handle.close();
                        break;
                    }
                    Err(e) => {
                        warn!("link: read failed: {e}");
                        handle.fail(NegotiationError::TransportClosedUnexpectedly(e.to_string()));
                        break;
                    }
                },
                frame = outbound.recv() => match frame {
                    Some(Frame::Text(line)) => {
                        if let Err(e) = write_line(&mut writer, &line).await {
                            warn!("link: write failed: {e}");
                            handle.fail(NegotiationError::TransportClosedUnexpectedly(e.to_string()));
                            break;
                        }
                    }
                    Some(Frame::Malformed(_)) => {}
                    None => {
                        handle.close();
                        break;
                    }
                },
            }
        }

        let _ = writer.shutdown().await;
    }
}

/// `\n`-delimited reader that never buffers more than `limit + 1` bytes of
/// one line and yields bytes rather than failing on invalid UTF-8.
///
/// `next_frame` is cancel safe: a partial line stays in the buffer and the
/// next call continues it.
struct BoundedLines<R> {
    reader: R,
    buf: Vec<u8>,
    limit: usize,
    /// Skipping the rest of an over-long line.
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> BoundedLines<R> {
    fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            limit,
            discarding: false,
        }
    }

    /// The next frame, or `None` at end of stream.
    async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if self.buf.last() == Some(&b'\n') {
                let line = std::mem::take(&mut self.buf);
                if std::mem::replace(&mut self.discarding, false) {
                    return Ok(Some(Frame::Malformed(format!(
                        "line longer than {} bytes",
                        self.limit
                    ))));
                }
                return Ok(Some(frame_from_bytes(line)));
            }
            if self.buf.len() > self.limit {
                self.discarding = true;
                self.buf.clear();
            }

            let budget = (self.limit + 1 - self.buf.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if read == 0 {
                let rest = std::mem::take(&mut self.buf);
                if rest.is_empty() || std::mem::replace(&mut self.discarding, false) {
                    return Ok(None);
                }
                // Last line without a terminator.
                return Ok(Some(frame_from_bytes(rest)));
            }
        }
    }
}

fn frame_from_bytes(mut line: Vec<u8>) -> Frame {
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(text) => Frame::Text(text),
        Err(_) => Frame::Malformed("frame is not valid UTF-8".to_string()),
    }
}

/// Writes one frame followed by `\n` and flushes.
pub(crate) async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, BufReader};

    #[test]
    fn test_new_link_starts_connecting() {
        let (link, _driver) = FrameLink::new(Framing::Line);
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(link.state().channel_state(), ChannelState::Connecting);
    }

    #[test]
    fn test_close_is_idempotent_and_keeps_first_terminal_state() {
        // Arrange
        let (link, _driver) = FrameLink::new(Framing::Json);
        let handle = link.handle().clone();

        // Act
        handle.close();
        handle.fail(NegotiationError::AuthenticationRejected);
        handle.close();

        // Assert
        assert_eq!(handle.state(), LinkState::Closed);
        assert!(!handle.mark_open(), "a closed link never reopens");
    }

    #[tokio::test]
    async fn test_pair_ends_exchange_frames_in_both_directions() {
        // Arrange
        let (a, b) = FrameLink::pair(Framing::Json);
        let (a_tx, mut a_rx, _) = a.into_parts();
        let (b_tx, mut b_rx, _) = b.into_parts();

        // Act
        a_tx.send("from a".into()).unwrap();
        b_tx.send("from b".into()).unwrap();

        // Assert
        assert_eq!(b_rx.recv().await, Some(Frame::from("from a")));
        assert_eq!(a_rx.recv().await, Some(Frame::from("from b")));
    }

    #[tokio::test]
    async fn test_line_pump_opens_link_and_moves_lines_both_ways() {
        // Arrange
        let (local, remote) = duplex(1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);
        let (link, driver) = FrameLink::new(Framing::Line);
        let handle = link.handle().clone();
        let (tx, mut rx, _) = link.into_parts();

        // Act
        let pump = driver.spawn_line_pump(BufReader::new(local_read), local_write);
        remote_write.write_all(b"PING 1\n").await.unwrap();
        tx.send("PONG 2".into()).unwrap();

        // Assert
        assert_eq!(rx.recv().await, Some(Frame::from("PING 1")));
        let mut buf = [0u8; 7];
        remote_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG 2\n");
        assert_eq!(handle.state(), LinkState::Open);

        handle.close();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_pump_closes_link_on_peer_eof() {
        // Arrange
        let (local, remote) = duplex(64);
        let (local_read, local_write) = tokio::io::split(local);
        let (link, driver) = FrameLink::new(Framing::Line);
        let handle = link.handle().clone();

        // Act
        let pump = driver.spawn_line_pump(BufReader::new(local_read), local_write);
        drop(remote);
        pump.await.unwrap();

        // Assert
        assert_eq!(handle.state(), LinkState::Closed);
        drop(link);
    }

    #[tokio::test]
    async fn test_local_close_stops_a_pump_blocked_on_read() {
        // Arrange – the remote end never writes
        let (local, _remote) = duplex(64);
        let (local_read, local_write) = tokio::io::split(local);
        let (link, driver) = FrameLink::new(Framing::Line);
        let handle = link.handle().clone();
        let pump = driver.spawn_line_pump(BufReader::new(local_read), local_write);

        // Act
        tokio::task::yield_now().await;
        handle.close();

        // Assert – the pump exits even though the read never completes
        tokio::time::timeout(std::time::Duration::from_secs(1), pump)
            .await
            .expect("pump must stop after close")
            .unwrap();
        drop(link);
    }

    #[tokio::test]
    async fn test_line_pump_reports_invalid_utf8_and_keeps_reading() {
        // Arrange
        let (local, remote) = duplex(1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (_remote_read, mut remote_write) = tokio::io::split(remote);
        let (link, driver) = FrameLink::new(Framing::Line);
        let handle = link.handle().clone();
        let (_tx, mut rx, _) = link.into_parts();
        let pump = driver.spawn_line_pump(BufReader::new(local_read), local_write);

        // Act
        remote_write.write_all(b"\xff\xfe garbage\nPING 1\n").await.unwrap();

        // Assert
        assert!(matches!(rx.recv().await, Some(Frame::Malformed(_))));
        assert_eq!(rx.recv().await, Some(Frame::from("PING 1")));
        assert_eq!(handle.state(), LinkState::Open);

        handle.close();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_over_long_line_is_skipped_as_malformed() {
        // Arrange
        let (reader, mut writer) = duplex(256);
        let mut lines = BoundedLines::new(BufReader::new(reader), 16);

        // Act
        tokio::spawn(async move {
            writer.write_all(&[b'x'; 100]).await.unwrap();
            writer.write_all(b"\nPONG 7\r\ntail").await.unwrap();
        });

        // Assert
        assert!(matches!(lines.next_frame().await.unwrap(), Some(Frame::Malformed(_))));
        assert_eq!(lines.next_frame().await.unwrap(), Some(Frame::from("PONG 7")));
        assert_eq!(lines.next_frame().await.unwrap(), Some(Frame::from("tail")));
        assert_eq!(lines.next_frame().await.unwrap(), None);
        assert!(lines.buf.capacity() <= 64, "buffer grew to {}", lines.buf.capacity());
    }
}
