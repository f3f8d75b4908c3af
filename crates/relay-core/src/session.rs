//! Session identifiers, lifecycle states and snapshots.

use std::{
    fmt,
    net::SocketAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::Identity;

/// Session identifier.
///
/// Derived from the remote endpoint and a server-wide accept sequence
/// number, so a reconnect from the same address and port still gets a
/// fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the id for a freshly accepted connection.
    #[must_use]
    pub fn from_endpoint(remote_addr: SocketAddr, accept_seq: u64) -> Self {
        Self(format!("{remote_addr}#{accept_seq}"))
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepted, not yet identified.
    Pending,
    /// Identified and present in the registry.
    Active,
    /// Terminal. Socket released.
    Closed,
}

/// Point-in-time view of a session, safe to hand to the operator side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub remote_addr: String,
    /// Accept timestamp (Unix epoch milliseconds).
    pub connected_at: i64,
    /// Timestamp of the last frame received from the agent.
    pub last_seen: i64,
    pub state: SessionState,
    pub identity: Option<Identity>,
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_unique_per_accept() {
        let addr: SocketAddr = "10.0.0.7:51234".parse().unwrap();
        let first = SessionId::from_endpoint(addr, 1);
        let second = SessionId::from_endpoint(addr, 2);

        assert_ne!(first, second);
        assert_eq!(first, SessionId::from_endpoint(addr, 1));
        assert!(first.as_str().starts_with("10.0.0.7:51234"));
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = SessionId::from("[::1]:9000#4");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"[::1]:9000#4\"");
    }
}
