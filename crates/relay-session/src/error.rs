//! Session, registry and gateway errors.

use std::io;

use relay_core::SessionId;
use thiserror::Error;

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session closed: {0}")]
    Closed(SessionId),
}

/// Registry admission error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session has not identified: {0}")]
    Unidentified(SessionId),
    #[error("Session id already registered: {0}")]
    Occupied(SessionId),
    #[error("Session is not pending: {0}")]
    NotPending(SessionId),
}

/// Operator-facing gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("already running")]
    AlreadyRunning,
    #[error("Port {0} is already in use")]
    AddrInUse(u16),
    #[error("Permission denied binding port {0}")]
    PermissionDenied(u16),
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl GatewayError {
    /// Map a bind failure onto the reason shown to the operator.
    #[must_use]
    pub fn from_bind(port: u16, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddrInUse(port),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(port),
            _ => Self::Bind { port, source: err },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_errors_are_classified() {
        assert!(matches!(
            GatewayError::from_bind(80, io::Error::from(io::ErrorKind::PermissionDenied)),
            GatewayError::PermissionDenied(80)
        ));
        assert!(matches!(
            GatewayError::from_bind(8765, io::Error::from(io::ErrorKind::AddrInUse)),
            GatewayError::AddrInUse(8765)
        ));
        assert!(matches!(
            GatewayError::from_bind(8765, io::Error::other("weird")),
            GatewayError::Bind { port: 8765, .. }
        ));
    }
}
