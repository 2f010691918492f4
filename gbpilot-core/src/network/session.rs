//! One emulator connection.
//!
//! The socket is split once: the read half stays with the [`Session`] and
//! is polled with a timeout, the write half moves into a writer task fed
//! by [`SessionSender`]. That task is the only thing that ever writes to
//! the socket, so concurrent senders can never interleave lines.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::EmulatorCodec;
use crate::error::PilotError;
use crate::protocol::{Inbound, Outbound};

/// Outbound messages buffered ahead of the writer task.
const OUTBOUND_CAPACITY: usize = 64;

type Writer = SplitSink<Framed<TcpStream, EmulatorCodec>, Outbound>;
type Reader = SplitStream<Framed<TcpStream, EmulatorCodec>>;

// ── SessionInfo ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

// ── SessionSender ────────────────────────────────────────────────

/// The single send path into a session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionSender {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl SessionSender {
    /// Queue a message for the writer task.
    ///
    /// Fails once the session is closed or a previous write failed.
    pub async fn send(&self, message: Outbound) -> Result<(), PilotError> {
        if self.closed.is_cancelled() {
            return Err(PilotError::ChannelClosed);
        }
        self.tx.send(message).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the session is closed for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

// ── ReadEvent ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ReadEvent {
    Message(Inbound),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The peer hung up or the session was closed.
    Closed,
    Failed(PilotError),
}

// ── Session ──────────────────────────────────────────────────────

pub struct Session {
    info: SessionInfo,
    reader: Reader,
    sender: SessionSender,
    writer: Option<JoinHandle<()>>,
    closed: CancellationToken,
}

impl Session {
    /// Wrap an accepted socket. `parent` cancels the session from outside
    /// (shutdown or supersession).
    pub fn new(stream: TcpStream, peer: SocketAddr, id: u64, parent: &CancellationToken) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "could not set TCP_NODELAY: {e}");
        }
        let (sink, reader) = Framed::new(stream, EmulatorCodec::new()).split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let closed = parent.child_token();

        let writer = tokio::spawn(write_loop(sink, rx, closed.clone(), id));

        Self {
            info: SessionInfo {
                id,
                peer,
                connected_at: Instant::now(),
            },
            reader,
            sender: SessionSender {
                tx,
                closed: closed.clone(),
            },
            writer: Some(writer),
            closed,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.info.peer
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait up to `poll` for the next message.
    pub async fn next_event(&mut self, poll: Duration) -> ReadEvent {
        if self.closed.is_cancelled() {
            return ReadEvent::Closed;
        }
        tokio::select! {
            _ = self.closed.cancelled() => ReadEvent::Closed,
            next = tokio::time::timeout(poll, self.reader.next()) => match next {
                Err(_) => ReadEvent::Idle,
                Ok(None) => ReadEvent::Closed,
                Ok(Some(Ok(message))) => ReadEvent::Message(message),
                Ok(Some(Err(e))) => ReadEvent::Failed(e),
            },
        }
    }

    /// Close the session and wait up to `timeout` for the writer task.
    pub async fn close(mut self, timeout: Duration) {
        self.closed.cancel();
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(timeout, writer).await.is_err() {
                warn!(session = self.info.id, "session writer did not stop in time; aborting");
                abort.abort();
            }
        }
        debug!(session = self.info.id, peer = %self.info.peer, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn write_loop(mut sink: Writer, mut rx: mpsc::Receiver<Outbound>, closed: CancellationToken, id: u64) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                let kind = message.kind();
                if let Err(e) = sink.send(message).await {
                    warn!(session = id, kind, "write to emulator failed: {e}");
                    closed.cancel();
                    break;
                }
                debug!(session = id, kind, "sent");
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!(session = id, "error closing socket: {e}");
    }
}

// ── Tests ────────────────────────────────────────────────────────
