//! Events emitted to the operator view.

use serde::{Deserialize, Serialize};

use crate::{Identity, SessionId};

/// Typed event stream consumed by the operator view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Listener bound and accepting.
    Started { port: u16 },
    /// Listener closed, registry cleared.
    Stopped,
    /// Listener could not be started.
    StartError { reason: String },
    /// An agent identified itself and joined the registry.
    Connected {
        session_id: SessionId,
        remote_addr: String,
        connected_at: i64,
        identity: Identity,
    },
    /// An active session left the registry.
    Disconnected { session_id: SessionId },
    /// Decoded command output from an agent.
    Output {
        session_id: SessionId,
        text: String,
        timestamp: i64,
    },
    /// A command was handed to the session's socket.
    CommandAcknowledged {
        session_id: SessionId,
        command: String,
        timestamp: i64,
    },
    /// An agent reported an error, or its transport failed unexpectedly.
    ClientError { session_id: SessionId, message: String },
}

impl RelayEvent {
    /// The session this event concerns, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Connected { session_id, .. }
            | Self::Disconnected { session_id }
            | Self::Output { session_id, .. }
            | Self::CommandAcknowledged { session_id, .. }
            | Self::ClientError { session_id, .. } => Some(session_id),
            Self::Started { .. } | Self::Stopped | Self::StartError { .. } => None,
        }
    }
}
