//! Command dispatcher - binds the user commands to hover requests.
//!
//! "generate" fires a hover request and discards the result. "show" waits
//! for the result and presents the extracted content. Both read the cursor
//! from the host at invocation time and share the session's correlator,
//! each on its own trigger slot.

use crate::host::EditorHost;
use crate::notifications::Notification;
use funchaiku_lsp::{extract_display, BridgeError, PositionRequest, SessionHandle, TriggerSlot};
use std::sync::Arc;

/// Commands exposed to the host editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeCommand {
    Generate,
    Show,
}

impl BridgeCommand {
    pub const GENERATE_ID: &'static str = "funchaiku.generateHaiku";
    pub const SHOW_ID: &'static str = "funchaiku.showHaiku";

    /// Command identifier as registered with the host.
    pub fn id(&self) -> &'static str {
        match self {
            BridgeCommand::Generate => Self::GENERATE_ID,
            BridgeCommand::Show => Self::SHOW_ID,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            Self::GENERATE_ID => Some(BridgeCommand::Generate),
            Self::SHOW_ID => Some(BridgeCommand::Show),
            _ => None,
        }
    }

    pub fn slot(&self) -> TriggerSlot {
        match self {
            BridgeCommand::Generate => TriggerSlot::Generate,
            BridgeCommand::Show => TriggerSlot::Show,
        }
    }
}

/// What a command invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// No active document or cursor.
    NoCursor,
    /// The request was sent and its result will be discarded.
    Dispatched,
    /// Content was presented.
    Presented(String),
    /// The request finished without anything to present.
    NothingToShow,
    /// A newer trigger replaced this one.
    Superseded,
}

/// Formats hover content for presentation.
pub fn format_content(payload: &str) -> String {
    format!("Content 🌸 {}", payload)
}

/// Routes commands to the session.
#[derive(Clone)]
pub struct CommandDispatcher {
    session: SessionHandle,
    host: Arc<dyn EditorHost>,
}

impl CommandDispatcher {
    pub fn new(session: SessionHandle, host: Arc<dyn EditorHost>) -> Self {
        Self { session, host }
    }

    pub async fn execute(&self, command: BridgeCommand) -> CommandOutcome {
        let Some(request) = self.host.active_cursor() else {
            log::debug!("{}: no active cursor", command.id());
            return CommandOutcome::NoCursor;
        };

        match command {
            BridgeCommand::Generate => self.generate(request),
            BridgeCommand::Show => self.show(request).await,
        }
    }

    fn generate(&self, request: PositionRequest) -> CommandOutcome {
        let session = self.session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.request_hover(TriggerSlot::Generate, &request).await {
                log::debug!("generate: {}", e);
            }
        });
        CommandOutcome::Dispatched
    }

    async fn show(&self, request: PositionRequest) -> CommandOutcome {
        let result = match self.session.request_hover(TriggerSlot::Show, &request).await {
            Ok(result) => result,
            Err(BridgeError::Superseded) => return CommandOutcome::Superseded,
            Err(e) => {
                // Session failures are surfaced by the bridge, not per command
                log::debug!("show: {}", e);
                return CommandOutcome::NothingToShow;
            }
        };

        match extract_display(result.as_ref()) {
            Some(payload) => {
                self.host.present(Notification::info(format_content(&payload)));
                CommandOutcome::Presented(payload)
            }
            None => CommandOutcome::NothingToShow,
        }
    }
}
