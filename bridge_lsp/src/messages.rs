//! Messages between session handles, the session actor and the host.
//!
//! Commands flow into the actor over a tokio channel. Notifications flow out
//! to the host over a crossbeam channel so a synchronous event loop can poll
//! them.

use crate::error::BridgeError;
use crate::sync::FileChange;
use crate::types::TriggerSlot;
use serde_json::Value;
use tokio::sync::oneshot;

/// Reply for a raw request: the `result` field of the response.
pub(crate) type RawReply = oneshot::Sender<Result<Option<Value>, BridgeError>>;

/// Commands sent from handles to the session actor.
pub(crate) enum SessionCommand {
    /// Launch the server and perform the handshake.
    Start {
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    /// Shut the server down.
    Stop { reply: oneshot::Sender<()> },
    /// Issue a request, optionally single-flight on a trigger slot.
    Request {
        method: &'static str,
        params: Value,
        slot: Option<TriggerSlot>,
        reply: RawReply,
    },
    /// Forward file-system changes.
    FileChanges(Vec<FileChange>),
}

/// Events from the session that the host may want to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeNotification {
    /// Handshake completed.
    ServerReady {
        /// Server capabilities description.
        capabilities_summary: String,
    },
    /// The server went away while the session was running.
    SessionTerminated { reason: String },
    /// `window/showMessage` from the server.
    ServerMessage { level: LogLevel, message: String },
}

/// Log level for server messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Log,
}

impl From<lsp_types::MessageType> for LogLevel {
    fn from(typ: lsp_types::MessageType) -> Self {
        match typ {
            lsp_types::MessageType::ERROR => LogLevel::Error,
            lsp_types::MessageType::WARNING => LogLevel::Warning,
            lsp_types::MessageType::INFO => LogLevel::Info,
            _ => LogLevel::Log,
        }
    }
}
