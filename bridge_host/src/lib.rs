//! Funchaiku host layer - commands and presentation for an editor.
//!
//! This crate wires the LSP session to the host editor: it reads the
//! cursor, dispatches the two haiku commands and turns session events into
//! transient notifications.

pub mod bridge;
pub mod commands;
pub mod host;
pub mod notifications;

pub use bridge::Bridge;
pub use commands::{format_content, BridgeCommand, CommandDispatcher, CommandOutcome};
pub use host::EditorHost;
pub use notifications::{Notification, NotificationKind, NotificationManager};
