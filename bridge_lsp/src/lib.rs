//! Funchaiku LSP bridge - drives a haiku language server for an editor host.
//!
//! The server runs as a child process speaking JSON-RPC over stdio. A single
//! session actor owns its lifecycle; hosts talk to it through a cloneable
//! `SessionHandle` and poll `BridgeNotification`s from a channel so a
//! synchronous event loop never blocks on the server.

pub mod config;
mod correlator;
pub mod error;
pub mod hover;
pub mod messages;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{BridgeConfig, ServerConfig, Timeouts};
pub use error::{BridgeError, ConfigError};
pub use hover::{extract_display, HoverFragment, HoverResult};
pub use messages::{BridgeNotification, LogLevel};
pub use session::{ProtocolSession, SessionHandle, SessionState};
pub use sync::{ChangeSink, DocumentSyncFeed, FileChange, FileChangeKind};
pub use transport::{Launcher, ProcessLauncher};
pub use types::{DocumentFilter, DocumentSelector, Position, PositionRequest, Range, TriggerSlot};
