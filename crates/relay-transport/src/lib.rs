//! Transport layer for the remote command relay.
//!
//! Provides:
//! - Agent wire protocol (JSON + base64)
//! - Newline framing codec
//! - Transport error classification
//! - Operator WebSocket bridge (feature: websocket)

pub mod codec;
pub mod error;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use codec::LineCodec;
pub use error::{FrameError, ProtocolError, TransportFault};
pub use protocol::{AgentMessage, ServerMessage};
