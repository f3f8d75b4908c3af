//! Operator-facing command surface.

use std::{fmt, num::NonZeroU16, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SessionId;

/// A validated listening port (1-65535).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u16")]
pub struct Port(NonZeroU16);

impl Port {
    /// Raw port number.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

/// Port validation error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("Port out of range (must be 1-65535): {0}")]
    OutOfRange(i64),
    #[error("Invalid port number: {0}")]
    Invalid(String),
}

impl TryFrom<i64> for Port {
    type Error = PortError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .ok()
            .and_then(NonZeroU16::new)
            .map(Self)
            .ok_or(PortError::OutOfRange(value))
    }
}

impl FromStr for Port {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| PortError::Invalid(s.to_owned()))?;
        Self::try_from(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.get()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Intent issued by the operator view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Begin accepting agent connections.
    Start { port: Port },
    /// Stop accepting and drop every session.
    Stop,
    /// Push a shell command to one session.
    SendCommand { session_id: SessionId, command: String },
    /// Politely disconnect one session.
    DisconnectSession { session_id: SessionId },
}
