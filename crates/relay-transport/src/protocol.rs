//! Wire protocol between the relay and remote agents.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use relay_core::{Identity, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Message from agent to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Host identity, expected as the first frame.
    #[serde(alias = "identify")]
    ClientInfo(Identity),
    /// Command output (base64 encoded).
    #[serde(alias = "output")]
    ShellOutput { data: String },
    /// Heartbeat reply.
    #[serde(alias = "heartbeat_ack")]
    Pong {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    /// Error reported by the agent.
    #[serde(alias = "error_report")]
    Error {
        #[serde(default)]
        message: String,
    },
    /// A type this server does not know. Never produced by serde.
    #[serde(skip)]
    Unknown { kind: String },
}

impl AgentMessage {
    /// Every `type` tag that maps to a known variant.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "client_info",
        "identify",
        "shell_output",
        "output",
        "pong",
        "heartbeat_ack",
        "error",
        "error_report",
    ];

    /// Decode one framed line.
    ///
    /// Unknown `type` tags decode to [`AgentMessage::Unknown`] rather than
    /// failing, so newer agents stay compatible.
    ///
    /// # Errors
    /// Returns error if the line is not a JSON object with a string `type`,
    /// or a known type carries malformed fields.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        if !Self::KNOWN_TYPES.contains(&kind) {
            return Ok(Self::Unknown {
                kind: kind.to_owned(),
            });
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Create an output message from raw bytes.
    #[must_use]
    pub fn output(data: &[u8]) -> Self {
        Self::ShellOutput {
            data: BASE64.encode(data),
        }
    }

    /// Decode output data from base64.
    ///
    /// # Errors
    /// Returns error if this is an output message with invalid base64.
    pub fn decode_output(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self {
            Self::ShellOutput { data } => Ok(Some(BASE64.decode(data)?)),
            _ => Ok(None),
        }
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ClientInfo(_) => "client_info",
            Self::ShellOutput { .. } => "shell_output",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::Unknown { kind } => kind,
        }
    }
}

/// Message from server to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Shell command for the agent to run.
    Command { data: String, timestamp: i64 },
    /// Heartbeat probe.
    Ping { timestamp: i64 },
    /// The operator is dropping this session.
    Disconnect { reason: String },
    /// The server is going away.
    Shutdown { reason: String },
}

impl ServerMessage {
    /// Create a ping stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_core::identity::UNKNOWN;

    use super::*;

    #[test]
    fn test_output_roundtrip() {
        let original = b"ana\n\x1b[0m\xff";
        let msg = AgentMessage::output(original);
        let decoded = msg.decode_output().unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_client_info() {
        let msg = AgentMessage::decode(
            r#"{"type":"client_info","hostname":"box1","username":"ana","os":"Linux"}"#,
        )
        .unwrap();

        let AgentMessage::ClientInfo(identity) = msg else {
            panic!("Wrong message type: {msg:?}");
        };
        assert_eq!(identity.hostname, "box1");
        assert_eq!(identity.architecture, UNKNOWN);
    }

    #[test]
    fn test_decode_aliases() {
        assert!(matches!(
            AgentMessage::decode(r#"{"type":"identify"}"#).unwrap(),
            AgentMessage::ClientInfo(_)
        ));
        assert!(matches!(
            AgentMessage::decode(r#"{"type":"output","data":"aGk="}"#).unwrap(),
            AgentMessage::ShellOutput { .. }
        ));
        assert!(matches!(
            AgentMessage::decode(r#"{"type":"heartbeat_ack"}"#).unwrap(),
            AgentMessage::Pong { timestamp: None }
        ));
        assert_eq!(
            AgentMessage::decode(r#"{"type":"error_report","message":"boom"}"#).unwrap(),
            AgentMessage::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_decode_pong_with_float_timestamp() {
        let msg = AgentMessage::decode(r#"{"type":"pong","timestamp":1712345678.25}"#).unwrap();
        assert_eq!(msg.kind(), "pong");
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg = AgentMessage::decode(r#"{"type":"file_listing","entries":[]}"#).unwrap();
        assert_eq!(
            msg,
            AgentMessage::Unknown {
                kind: "file_listing".into()
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            AgentMessage::decode("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            AgentMessage::decode(r#"{"data":"x"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            AgentMessage::decode("[1,2]"),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            AgentMessage::decode(r#"{"type":"shell_output"}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_invalid_base64_output() {
        let msg = AgentMessage::ShellOutput {
            data: "***".into(),
        };
        assert!(matches!(msg.decode_output(), Err(ProtocolError::Base64(_))));
    }

    #[test]
    fn test_server_message_serialization() {
        let json = serde_json::to_value(ServerMessage::Command {
            data: "whoami".into(),
            timestamp: 7,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "command", "data": "whoami", "timestamp": 7})
        );

        let json = serde_json::to_value(ServerMessage::Shutdown {
            reason: "bye".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "shutdown");
    }
}
