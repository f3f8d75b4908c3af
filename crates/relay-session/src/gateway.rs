//! Command gateway: listener lifecycle and operator intents.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use relay_core::{
    EventStore, OperatorCommand, RelayConfig, RelayEvent, SessionId, SessionInfo, now_millis,
};
use relay_transport::ServerMessage;
use tokio::{net::TcpListener, sync::Mutex, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{self, ConnectionContext},
    error::GatewayError,
    registry::Registry,
};

/// Reason sent to an agent dropped by the operator.
const DISCONNECT_REASON: &str = "Disconnected by server";

enum ListenerState {
    Stopped,
    Listening(Listener),
}

struct Listener {
    port: u16,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

struct Shared {
    config: RelayConfig,
    registry: Arc<Registry>,
    events: Arc<EventStore>,
    listener: Mutex<ListenerState>,
    accept_seq: AtomicU64,
}

/// The relay server core.
///
/// Owns the registry, the event store and the listening socket. Cheap to
/// clone; clones share state.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Create a stopped server.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let events = Arc::new(EventStore::with_history_limit(config.event_history));
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(Registry::new()),
                events,
                listener: Mutex::new(ListenerState::Stopped),
                accept_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Event store shared with operator views.
    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.shared.events)
    }

    /// Start accepting agents on `port` (0 picks a free port).
    ///
    /// Emits `Started` with the bound port, or `StartError` with the reason.
    ///
    /// # Errors
    /// Returns error if already listening or the bind fails.
    pub async fn start_listening(&self, port: u16) -> Result<u16, GatewayError> {
        let mut state = self.shared.listener.lock().await;
        if matches!(*state, ListenerState::Listening(_)) {
            return Err(self.start_failed(port, GatewayError::AlreadyRunning));
        }

        let addr = SocketAddr::new(self.shared.config.bind_host, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => return Err(self.start_failed(port, GatewayError::from_bind(port, e))),
        };
        let bound = match listener.local_addr() {
            Ok(a) => a.port(),
            Err(e) => return Err(self.start_failed(port, GatewayError::from_bind(port, e))),
        };

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(self.clone().accept_loop(listener, shutdown.clone()));
        let heartbeat_task = self
            .shared
            .config
            .heartbeat_interval()
            .map(|_| tokio::spawn(self.clone().heartbeat_loop(shutdown.clone())));

        *state = ListenerState::Listening(Listener {
            port: bound,
            shutdown,
            accept_task,
            heartbeat_task,
        });
        drop(state);

        tracing::info!(port = bound, "Relay server listening");
        self.shared.events.push(RelayEvent::Started { port: bound });
        Ok(bound)
    }

    fn start_failed(&self, port: u16, err: GatewayError) -> GatewayError {
        tracing::warn!(port, "Failed to start relay server: {err}");
        self.shared.events.push(RelayEvent::StartError {
            reason: err.to_string(),
        });
        err
    }

    async fn accept_loop(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        let seq = self.shared.accept_seq.fetch_add(1, Ordering::Relaxed) + 1;
                        let ctx = ConnectionContext {
                            registry: Arc::clone(&self.shared.registry),
                            events: Arc::clone(&self.shared.events),
                            shutdown: shutdown.clone(),
                            error_grace: self.shared.config.error_grace(),
                        };
                        tokio::spawn(connection::serve(stream, remote_addr, seq, ctx));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept agent connection: {e}");
                    }
                },
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    async fn heartbeat_loop(self, shutdown: CancellationToken) {
        let Some(period) = self.shared.config.heartbeat_interval() else {
            return;
        };
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.shared.registry.for_each(|session| {
                        if let Err(e) = session.send(ServerMessage::ping()) {
                            tracing::debug!(session_id = %session.id(), "Ping not sent: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Stop accepting, notify and drop every session, clear the registry.
    ///
    /// Returns false if the server was not listening.
    pub async fn stop_listening(&self) -> bool {
        let mut state = self.shared.listener.lock().await;
        let ListenerState::Listening(listener) =
            std::mem::replace(&mut *state, ListenerState::Stopped)
        else {
            return false;
        };

        let reason = self.shared.config.shutdown_reason.clone();
        self.shared.registry.for_each(|session| {
            session.close_with(ServerMessage::Shutdown {
                reason: reason.clone(),
            });
        });

        // Pending sessions hold child tokens and close with this.
        listener.shutdown.cancel();
        if let Some(task) = listener.heartbeat_task {
            task.abort();
        }
        if let Err(e) = listener.accept_task.await {
            tracing::warn!("Accept loop ended abnormally: {e}");
        }

        // Sessions admitted after the broadcast above still get the notice.
        for session in self.shared.registry.drain() {
            session.close_with(ServerMessage::Shutdown {
                reason: reason.clone(),
            });
            self.shared.events.push(RelayEvent::Disconnected {
                session_id: session.id().clone(),
            });
        }
        drop(state);

        tracing::info!(port = listener.port, "Relay server stopped");
        self.shared.events.push(RelayEvent::Stopped);
        true
    }

    /// Send a shell command to an active session.
    ///
    /// On success emits `CommandAcknowledged` carrying the same timestamp
    /// as the frame sent to the agent, and returns that timestamp.
    ///
    /// # Errors
    /// Returns error if the session is not active or its socket is gone.
    /// Nothing is emitted on error.
    pub fn send_command(&self, session_id: &SessionId, command: &str) -> Result<i64, GatewayError> {
        let Some(session) = self.shared.registry.get(session_id) else {
            tracing::warn!(%session_id, "Command for unknown session dropped");
            return Err(GatewayError::UnknownSession(session_id.clone()));
        };

        let timestamp = now_millis();
        session
            .send(ServerMessage::Command {
                data: command.to_owned(),
                timestamp,
            })
            .inspect_err(|e| tracing::warn!(%session_id, "Command not sent: {e}"))?;

        tracing::debug!(%session_id, %command, "Command sent");
        self.shared.events.push(RelayEvent::CommandAcknowledged {
            session_id: session_id.clone(),
            command: command.to_owned(),
            timestamp,
        });
        Ok(timestamp)
    }

    /// Send a disconnect notice, then close after the configured grace period.
    ///
    /// # Errors
    /// Returns error if the session is not active.
    pub fn disconnect_session(&self, session_id: &SessionId) -> Result<(), GatewayError> {
        let Some(session) = self.shared.registry.get(session_id) else {
            tracing::warn!(%session_id, "Disconnect for unknown session ignored");
            return Err(GatewayError::UnknownSession(session_id.clone()));
        };

        if let Err(e) = session.send(ServerMessage::Disconnect {
            reason: DISCONNECT_REASON.to_owned(),
        }) {
            tracing::debug!(%session_id, "Disconnect notice not sent: {e}");
        }

        let grace = self.shared.config.disconnect_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            session.close();
        });

        tracing::info!(%session_id, "Disconnecting agent");
        Ok(())
    }

    /// Apply one operator command. Failures are logged and, for start,
    /// reported as `StartError`.
    pub async fn apply(&self, command: OperatorCommand) {
        match command {
            OperatorCommand::Start { port } => {
                let _ = self.start_listening(port.get()).await;
            }
            OperatorCommand::Stop => {
                self.stop_listening().await;
            }
            OperatorCommand::SendCommand {
                session_id,
                command,
            } => {
                let _ = self.send_command(&session_id, &command);
            }
            OperatorCommand::DisconnectSession { session_id } => {
                let _ = self.disconnect_session(&session_id);
            }
        }
    }

    /// Consume operator commands until the sender side is dropped.
    pub async fn run(&self, mut commands: mpsc::Receiver<OperatorCommand>) {
        while let Some(command) = commands.recv().await {
            self.apply(command).await;
        }
        tracing::debug!("Operator command queue closed");
    }

    /// Active sessions, oldest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.registry.infos()
    }

    /// One active session.
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.shared.registry.get(session_id).map(|s| s.info())
    }

    pub async fn is_listening(&self) -> bool {
        matches!(*self.shared.listener.lock().await, ListenerState::Listening(_))
    }

    /// Bound port while listening.
    pub async fn port(&self) -> Option<u16> {
        match &*self.shared.listener.lock().await {
            ListenerState::Listening(listener) => Some(listener.port),
            ListenerState::Stopped => None,
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use relay_core::Identity;

    use super::*;
    use crate::session::{Outbound, Session};

    #[tokio::test]
    async fn test_stop_notifies_registered_sessions_once() {
        let server = RelayServer::new(RelayConfig {
            bind_host: Ipv4Addr::LOCALHOST.into(),
            ..RelayConfig::default()
        });
        server.start_listening(0).await.unwrap();

        let (session, mut outbox) = Session::new(
            SessionId::from("10.0.0.1:5000#1"),
            "10.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        );
        session.set_identity(Identity::default());
        server.shared.registry.put(Arc::clone(&session)).unwrap();
        let mut events = server.events().subscribe();

        assert!(server.stop_listening().await);

        assert_eq!(
            outbox.try_recv(),
            Some(Outbound::Frame(ServerMessage::Shutdown {
                reason: "Server shutting down".into()
            }))
        );
        assert_eq!(outbox.try_recv(), Some(Outbound::Close));
        assert_eq!(outbox.try_recv(), None);

        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::Disconnected {
                session_id: session.id().clone()
            }
        );
        assert_eq!(events.try_recv().unwrap(), RelayEvent::Stopped);
        assert!(server.sessions().is_empty());
    }
}
