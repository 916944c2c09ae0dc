//! Error types for the bridge.

use crate::session::SessionState;
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by the session bridge.
///
/// Only session-level kinds are meant to reach the user. Per-request kinds
/// degrade to "nothing to show" at the command layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The server process could not be launched.
    #[error("failed to launch language server `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The server did not answer `initialize` in time.
    #[error("language server did not acknowledge initialization within {0:?}")]
    HandshakeTimeout(Duration),

    /// The channel to the server process is gone.
    #[error("transport to the language server is closed")]
    TransportClosed,

    /// The session ended while the request was outstanding.
    #[error("language server session terminated")]
    SessionTerminated,

    /// A single request received no response in time.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// A newer trigger on the same slot replaced this request.
    #[error("request superseded by a newer trigger")]
    Superseded,

    /// A request was issued while the session was not running.
    #[error("language server session is not running (state: {0})")]
    NotRunning(SessionState),

    /// The document is outside the document selector.
    #[error("`{0}` is not a selected document")]
    NotSelected(String),

    /// The server answered with a JSON-RPC error.
    #[error("language server returned error {code}: {message}")]
    Server { code: i64, message: String },

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The file-system watcher could not be started.
    #[error("failed to watch `{}`: {reason}", path.display())]
    WatchFailed { path: PathBuf, reason: String },
}

impl BridgeError {
    /// Returns true for failures that concern the whole session rather than
    /// a single request.
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            BridgeError::SpawnFailed { .. }
                | BridgeError::HandshakeTimeout(_)
                | BridgeError::TransportClosed
                | BridgeError::SessionTerminated
        )
    }
}

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_level_classification() {
        assert!(BridgeError::SessionTerminated.is_session_level());
        assert!(BridgeError::HandshakeTimeout(Duration::from_secs(1)).is_session_level());
        assert!(!BridgeError::Superseded.is_session_level());
        assert!(!BridgeError::RequestTimeout(Duration::from_secs(1)).is_session_level());
        assert!(!BridgeError::NotRunning(SessionState::Stopped).is_session_level());
        assert!(!BridgeError::NotSelected("file:///ws/lib.rs".to_string()).is_session_level());
    }

    #[test]
    fn test_spawn_failed_message_names_command() {
        let err = BridgeError::SpawnFailed {
            command: "lsp-server".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to launch language server `lsp-server`: not found"
        );
    }
}
