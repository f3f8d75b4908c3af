//! Core vocabulary for the remote command relay.
//!
//! This crate provides the types every other layer speaks:
//! - `SessionId`, `SessionState`, `SessionInfo` - Session bookkeeping
//! - `Identity` - What an agent reports about its host
//! - `RelayEvent` / `OperatorCommand` - The operator-facing surface
//! - `EventStore` - Broadcast + history for operator views
//! - `RelayConfig` - Server tuning

pub mod command;
pub mod config;
pub mod event;
pub mod event_store;
pub mod identity;
pub mod session;

pub use command::{OperatorCommand, Port, PortError};
pub use config::RelayConfig;
pub use event::RelayEvent;
pub use event_store::EventStore;
pub use identity::Identity;
pub use session::{SessionId, SessionInfo, SessionState, now_millis};
