//! Bridge lifecycle - what the host calls on activation and deactivation.

use crate::commands::{BridgeCommand, CommandDispatcher, CommandOutcome};
use crate::host::EditorHost;
use crate::notifications::Notification;
use funchaiku_lsp::{
    BridgeConfig, BridgeNotification, DocumentSyncFeed, Launcher, ProcessLauncher,
    ProtocolSession, SessionHandle,
};
use std::sync::Arc;

/// A running bridge: session, document sync and commands.
pub struct Bridge {
    session: ProtocolSession,
    dispatcher: CommandDispatcher,
    host: Arc<dyn EditorHost>,
    feed: Option<DocumentSyncFeed>,
}

impl Bridge {
    /// Starts the language server and begins watching the workspace.
    ///
    /// A startup failure is presented once and leaves the bridge inert:
    /// commands become no-ops and there is no retry.
    pub async fn start_bridge(config: BridgeConfig, host: Arc<dyn EditorHost>) -> Self {
        Self::start_with(config, host, ProcessLauncher).await
    }

    pub async fn start_with(
        config: BridgeConfig,
        host: Arc<dyn EditorHost>,
        launcher: impl Launcher,
    ) -> Self {
        let session = ProtocolSession::spawn_with(config.clone(), launcher);
        let handle = session.handle();
        let dispatcher = CommandDispatcher::new(handle.clone(), host.clone());

        let mut feed = None;
        match handle.start().await {
            Ok(()) => {
                if let Some(root) = config.workspace_root.as_deref() {
                    feed = DocumentSyncFeed::watch(root, config.document_selector.clone(), handle)
                        .map_err(|e| log::warn!("Document sync disabled: {}", e))
                        .ok();
                }
            }
            Err(e) => {
                log::error!("Failed to start language server: {}", e);
                host.present(Notification::error(format!("Funchaiku: {}", e)));
            }
        }

        Self {
            session,
            dispatcher,
            host,
            feed,
        }
    }

    /// Stops watching and shuts the server down.
    pub async fn stop_bridge(&mut self) {
        self.feed = None;
        self.session.handle().stop().await;
    }

    /// Presents pending session notifications. Returns how many were handled.
    ///
    /// Call this from the host's event loop; it never blocks.
    pub fn poll(&self) -> usize {
        let mut handled = 0;
        while let Some(notification) = self.session.try_recv_notification() {
            handled += 1;
            match notification {
                BridgeNotification::ServerReady {
                    capabilities_summary,
                } => {
                    log::info!("Funchaiku ready ({})", capabilities_summary);
                }
                BridgeNotification::SessionTerminated { reason } => {
                    self.host.present(Notification::warning(format!(
                        "Funchaiku language server stopped: {}",
                        reason
                    )));
                }
                BridgeNotification::ServerMessage { level, message } => {
                    self.host.present(Notification::new(message, level.into()));
                }
            }
        }
        handled
    }

    pub async fn execute(&self, command: BridgeCommand) -> CommandOutcome {
        self.dispatcher.execute(command).await
    }

    /// Dispatcher for running commands off the host's event loop.
    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    /// Executes a command by its registered id. Returns `None` for unknown ids.
    pub async fn execute_id(&self, id: &str) -> Option<CommandOutcome> {
        let command = BridgeCommand::from_id(id)?;
        Some(self.execute(command).await)
    }

    pub fn session(&self) -> SessionHandle {
        self.session.handle()
    }

    pub fn is_active(&self) -> bool {
        self.session.handle().is_active()
    }

    pub fn is_watching(&self) -> bool {
        self.feed.is_some()
    }
}
