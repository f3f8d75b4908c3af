//! One agent connection: identity, lifecycle state and outbound queue.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::SinkExt;
use relay_core::{Identity, SessionId, SessionInfo, SessionState, now_millis};
use relay_transport::{FrameError, LineCodec, ServerMessage};
use tokio::{io::AsyncWrite, sync::mpsc};
use tokio_util::{
    codec::FramedWrite,
    sync::{CancellationToken, WaitForCancellationFuture},
};

use crate::error::SessionError;

/// How long a closing session may spend flushing queued frames before the
/// socket is dropped regardless.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Item queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Flush, shut down the write half and stop.
    Close,
}

/// A connected agent.
///
/// Writes are queued and drained by a per-session writer task, so `send`
/// never waits on the network and a slow agent only delays itself.
pub struct Session {
    id: SessionId,
    remote_addr: SocketAddr,
    connected_at: i64,
    last_seen: AtomicI64,
    identity: OnceLock<Identity>,
    state: Mutex<SessionState>,
    outbox: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

/// Receiving end of a session's outbound queue.
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
}

impl Session {
    /// Create a pending session.
    ///
    /// `closed` is cancelled when the session closes; pass a child of the
    /// server's shutdown token so stopping the server closes the read side.
    #[must_use]
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
        closed: CancellationToken,
    ) -> (Arc<Self>, Outbox) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let now = now_millis();
        let session = Self {
            id,
            remote_addr,
            connected_at: now,
            last_seen: AtomicI64::new(now),
            identity: OnceLock::new(),
            state: Mutex::new(SessionState::Pending),
            outbox,
            closed: closed.clone(),
        };
        (Arc::new(session), Outbox { rx, closed })
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[must_use]
    pub const fn connected_at(&self) -> i64 {
        self.connected_at
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Record that a frame just arrived.
    pub fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    /// Store the agent's identity. Only the first call has any effect.
    ///
    /// Returns false if an identity was already recorded.
    pub fn set_identity(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// Move from `Pending` to `Active`. Returns false from any other state.
    pub(crate) fn activate(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Pending {
            return false;
        }
        *state = SessionState::Active;
        true
    }

    /// Queue a message for the agent.
    ///
    /// # Errors
    /// Returns error if the session is closed or its writer has stopped.
    pub fn send(&self, message: ServerMessage) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.outbox
            .send(Outbound::Frame(message))
            .map_err(|_| SessionError::Closed(self.id.clone()))
    }

    /// Close the session without a notice.
    ///
    /// Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.shutdown(None)
    }

    /// Send a final notice, then close.
    ///
    /// Returns false if it was already closed (nothing is sent).
    pub fn close_with(&self, notice: ServerMessage) -> bool {
        self.shutdown(Some(notice))
    }

    fn shutdown(&self, notice: Option<ServerMessage>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }

        if let Some(notice) = notice {
            let _ = self.outbox.send(Outbound::Frame(notice));
        }
        let _ = self.outbox.send(Outbound::Close);
        self.closed.cancel();
        tracing::debug!(session_id = %self.id, "Session closed");
        true
    }

    /// Resolves once the session is closed, locally or by server shutdown.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Snapshot for the operator side.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            remote_addr: self.remote_addr.to_string(),
            connected_at: self.connected_at,
            last_seen: self.last_seen.load(Ordering::Relaxed),
            state: self.state(),
            identity: self.identity().cloned(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Drain the queue into a socket until closed or the write fails.
    ///
    /// Once the session closes, queued frames get a short flush window. An
    /// agent that stopped reading cannot hold the socket open past it.
    pub async fn forward<W>(self, writer: W, session_id: SessionId)
    where
        W: AsyncWrite + Unpin,
    {
        let Self { mut rx, closed } = self;
        let mut sink = FramedWrite::new(writer, LineCodec::new());

        let drain = async {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Frame(message) => {
                        if let Err(e) = sink.send(message).await {
                            return Err(e);
                        }
                    }
                    Outbound::Close => break,
                }
            }
            SinkExt::<ServerMessage>::close(&mut sink).await
        };
        tokio::pin!(drain);

        let finished: Option<Result<(), FrameError>> = tokio::select! {
            result = &mut drain => Some(result),
            () = closed.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, drain).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(%session_id, "Agent not reading, dropping socket");
                    return;
                }
            },
        };

        if let Err(e) = result {
            tracing::debug!(%session_id, "Write to agent failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn pending() -> (Arc<Session>, Outbox) {
        Session::new(
            SessionId::from("127.0.0.1:4000#1"),
            "127.0.0.1:4000".parse().unwrap(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_lifecycle() {
        let (session, _outbox) = pending();
        assert_eq!(session.state(), SessionState::Pending);

        assert!(session.activate());
        assert!(!session.activate());
        assert!(session.is_active());

        assert!(session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.activate());
    }

    #[test]
    fn test_identity_is_set_once() {
        let (session, _outbox) = pending();
        let first = Identity {
            hostname: "box1".into(),
            ..Identity::default()
        };
        let second = Identity {
            hostname: "box2".into(),
            ..Identity::default()
        };

        assert!(session.set_identity(first));
        assert!(!session.set_identity(second));
        assert_eq!(session.identity().unwrap().hostname, "box1");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, mut outbox) = pending();

        assert!(session.close_with(ServerMessage::Disconnect {
            reason: "bye".into()
        }));
        assert!(!session.close());
        assert!(!session.close_with(ServerMessage::Shutdown {
            reason: "again".into()
        }));

        assert_eq!(
            outbox.try_recv(),
            Some(Outbound::Frame(ServerMessage::Disconnect {
                reason: "bye".into()
            }))
        );
        assert_eq!(outbox.try_recv(), Some(Outbound::Close));
        assert_eq!(outbox.try_recv(), None);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (session, _outbox) = pending();
        session.close();

        let err = session.send(ServerMessage::ping()).unwrap_err();
        assert!(matches!(err, SessionError::Closed(_)));
    }

    #[test]
    fn test_send_fails_when_writer_is_gone() {
        let (session, outbox) = pending();
        drop(outbox);

        assert!(session.send(ServerMessage::ping()).is_err());
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (session, _outbox) = pending();
        session.close();
        session.closed().await;
    }

    #[tokio::test]
    async fn test_forward_gives_up_on_stalled_reader() {
        let (session, outbox) = pending();
        // The peer never reads, so the pipe fills after 64 bytes.
        let (_client, server) = tokio::io::duplex(64);

        session
            .send(ServerMessage::Command {
                data: "x".repeat(4096),
                timestamp: 1,
            })
            .unwrap();
        session.close_with(ServerMessage::Shutdown {
            reason: "bye".into(),
        });

        tokio::time::timeout(
            Duration::from_secs(2),
            outbox.forward(server, session.id().clone()),
        )
        .await
        .expect("writer should release the socket once closed");
    }

    #[tokio::test]
    async fn test_forward_releases_socket_when_closed_mid_write() {
        let (session, outbox) = pending();
        let (mut client, server) = tokio::io::duplex(64);

        let writer = tokio::spawn(outbox.forward(server, session.id().clone()));
        session
            .send(ServerMessage::Command {
                data: "x".repeat(4096),
                timestamp: 1,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        session.close();
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer should stop after close")
            .unwrap();

        // The server half is gone: whatever was buffered ends in EOF.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.len() < 4096);
    }

    #[tokio::test]
    async fn test_forward_writes_lines_then_shuts_down() {
        let (session, outbox) = pending();
        let (client, server) = tokio::io::duplex(1024);

        session
            .send(ServerMessage::Command {
                data: "whoami".into(),
                timestamp: 9,
            })
            .unwrap();
        session.close_with(ServerMessage::Disconnect {
            reason: "done".into(),
        });

        outbox.forward(server, session.id().clone()).await;

        let mut written = String::new();
        let mut client = client;
        client.read_to_string(&mut written).await.unwrap();

        assert_eq!(
            written,
            "{\"type\":\"command\",\"data\":\"whoami\",\"timestamp\":9}\n\
             {\"type\":\"disconnect\",\"reason\":\"done\"}\n"
        );
    }
}
