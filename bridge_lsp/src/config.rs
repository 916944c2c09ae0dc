//! Bridge configuration.
//!
//! Everything has a default, so an empty TOML file is a valid configuration.

use crate::error::ConfigError;
use crate::types::DocumentSelector;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command used when nothing else is configured.
pub const DEFAULT_SERVER_COMMAND: &str = "lsp-server";

/// Language server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Command to start the server.
    pub command: String,
    /// Arguments to the command.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Creates a configuration for a generic LSP server.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_COMMAND, vec![])
    }
}

/// Timeouts, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub handshake_ms: u64,
    pub request_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_ms: 10_000,
            request_ms: 5_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

/// Full bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub document_selector: DocumentSelector,
    /// Root announced to the server and watched for file changes.
    pub workspace_root: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl BridgeConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}
