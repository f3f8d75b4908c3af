//! Relay tuning knobs.

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Default number of events kept for reconnecting operator views.
pub const DEFAULT_EVENT_HISTORY: usize = 1024;

/// Relay server configuration.
///
/// Every field has a default, so a partial TOML table is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the agent listener binds to.
    pub bind_host: IpAddr,
    /// Delay between a disconnect notice and closing the socket.
    pub disconnect_grace_ms: u64,
    /// Delay before cleaning up after a benign transport error.
    pub error_grace_ms: u64,
    /// Ping interval for active sessions. `None` disables heartbeats.
    pub heartbeat_interval_ms: Option<u64>,
    /// Events retained in the event store history.
    pub event_history: usize,
    /// Reason sent to agents in the shutdown notice.
    pub shutdown_reason: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            disconnect_grace_ms: 500,
            error_grace_ms: 100,
            heartbeat_interval_ms: None,
            event_history: DEFAULT_EVENT_HISTORY,
            shutdown_reason: "Server shutting down".to_owned(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    #[must_use]
    pub const fn error_grace(&self) -> Duration {
        Duration::from_millis(self.error_grace_ms)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
