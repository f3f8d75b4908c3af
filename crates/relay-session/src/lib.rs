//! Session registry, protocol dispatch and command gateway.
//!
//! Provides:
//! - `RelayServer` - Listener lifecycle and operator commands
//! - `Registry` - Concurrent map of identified sessions
//! - `Session` - One agent socket with a queued writer
//! - `Dispatcher` - Per-session protocol state machine

mod connection;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod session;

pub use dispatch::Dispatcher;
pub use error::{GatewayError, RegistryError, SessionError};
pub use gateway::RelayServer;
pub use registry::Registry;
pub use session::{Outbound, Outbox, Session};
