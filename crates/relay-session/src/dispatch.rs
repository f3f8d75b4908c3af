//! Per-session protocol state machine.

use std::sync::Arc;

use relay_core::{EventStore, Identity, RelayEvent, SessionState, now_millis};
use relay_transport::AgentMessage;

use crate::{registry::Registry, session::Session};

/// Routes decoded agent frames to registry changes and operator events.
///
/// One dispatcher per connection; frames for a session are handled in
/// arrival order.
pub struct Dispatcher {
    session: Arc<Session>,
    registry: Arc<Registry>,
    events: Arc<EventStore>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(
        session: Arc<Session>,
        registry: Arc<Registry>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            session,
            registry,
            events,
        }
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handle one framed line. Malformed frames are logged and dropped.
    pub fn handle_frame(&self, line: &str) {
        self.session.touch();
        match AgentMessage::decode(line) {
            Ok(message) => self.handle(message),
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), "Dropping malformed frame: {e}");
            }
        }
    }

    /// Handle one decoded message.
    pub fn handle(&self, message: AgentMessage) {
        let id = self.session.id();
        match (self.session.state(), message) {
            (SessionState::Closed, message) => {
                tracing::debug!(session_id = %id, kind = message.kind(), "Ignoring frame on closed session");
            }
            (_, AgentMessage::Unknown { kind }) => {
                tracing::debug!(session_id = %id, %kind, "Ignoring unknown message type");
            }
            (SessionState::Pending, AgentMessage::ClientInfo(identity)) => self.identify(identity),
            (SessionState::Pending, message) => {
                tracing::debug!(session_id = %id, kind = message.kind(), "Dropping frame from unidentified session");
            }
            (SessionState::Active, AgentMessage::ClientInfo(_)) => {
                tracing::debug!(session_id = %id, "Ignoring repeated identification");
            }
            (SessionState::Active, message @ AgentMessage::ShellOutput { .. }) => {
                match message.decode_output() {
                    Ok(Some(bytes)) => self.events.push(RelayEvent::Output {
                        session_id: id.clone(),
                        text: String::from_utf8_lossy(&bytes).into_owned(),
                        timestamp: now_millis(),
                    }),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(session_id = %id, "Dropping undecodable output: {e}");
                    }
                }
            }
            (SessionState::Active, AgentMessage::Pong { .. }) => {
                tracing::debug!(session_id = %id, "Heartbeat acknowledged");
            }
            (SessionState::Active, AgentMessage::Error { message }) => {
                tracing::warn!(session_id = %id, "Agent reported error: {message}");
                self.events.push(RelayEvent::ClientError {
                    session_id: id.clone(),
                    message,
                });
            }
        }
    }

    fn identify(&self, identity: Identity) {
        let id = self.session.id();
        if !self.session.set_identity(identity.clone()) {
            return;
        }

        if let Err(e) = self.registry.put(Arc::clone(&self.session)) {
            tracing::warn!(session_id = %id, "Session not admitted: {e}");
            return;
        }

        tracing::info!(
            session_id = %id,
            hostname = %identity.hostname,
            username = %identity.username,
            os = %identity.os,
            "Agent identified"
        );

        self.events.push(RelayEvent::Connected {
            session_id: id.clone(),
            remote_addr: self.session.remote_addr().to_string(),
            connected_at: self.session.connected_at(),
            identity,
        });
    }

    /// Surface an unexpected transport failure to the operator.
    ///
    /// Only active sessions are reported; the operator never saw pending ones.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(session_id = %self.session.id(), "Agent transport error: {message}");
        if self.session.is_active() {
            self.events.push(RelayEvent::ClientError {
                session_id: self.session.id().clone(),
                message,
            });
        }
    }

    /// Close the session and drop it from the registry.
    ///
    /// Emits `Disconnected` only if this call removed the registry entry,
    /// so it fires at most once however the session ended.
    pub fn finish(self) {
        self.session.close();
        if self.registry.remove(self.session.id()).is_some() {
            tracing::info!(session_id = %self.session.id(), "Agent disconnected");
            self.events.push(RelayEvent::Disconnected {
                session_id: self.session.id().clone(),
            });
        }
    }
}
