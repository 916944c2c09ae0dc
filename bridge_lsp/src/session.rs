//! Protocol session - owns the server lifecycle and the session state.
//!
//! All state lives in a single actor task. Handles talk to it over a
//! channel, so state transitions are applied one at a time and nothing else
//! needs a lock. The actor publishes its state through a watch channel and
//! user-facing events through a crossbeam channel the host can poll.

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::hover::HoverResult;
use crate::messages::{BridgeNotification, LogLevel, RawReply, SessionCommand};
use crate::sync::{ChangeSink, FileChange};
use crate::transport::{
    self, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    Launcher, ProcessLauncher, RequestId, SessionTransport, METHOD_NOT_FOUND,
};
use crate::types::{path_to_uri, DocumentSelector, PositionRequest, TriggerSlot};
use crossbeam_channel::{Receiver, Sender};
use lsp_types::*;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Handle for talking to the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    sync_received: Arc<AtomicU64>,
    selector: Arc<DocumentSelector>,
}

impl SessionHandle {
    /// Launches the server and waits for the handshake.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Start { reply })?;
        rx.await.unwrap_or(Err(BridgeError::SessionTerminated))
    }

    /// Shuts the server down. Does nothing if already stopped.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns true iff the session is running.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Requests hover content at a position.
    ///
    /// Returns `Ok(None)` when the server has nothing there. A newer request
    /// on the same slot makes this one fail with `Superseded`. Documents
    /// outside the selector never reach the server.
    pub async fn request_hover(
        &self,
        slot: TriggerSlot,
        request: &PositionRequest,
    ) -> Result<Option<HoverResult>, BridgeError> {
        if !self.selector.matches_uri(&request.uri) {
            return Err(BridgeError::NotSelected(request.uri.as_str().to_string()));
        }
        let state = self.state();
        if state != SessionState::Running {
            return Err(BridgeError::NotRunning(state));
        }

        let params = HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier {
                    uri: request.uri.clone(),
                },
                position: request.position.into(),
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        let params = transport::to_value(params)?;

        let result = self
            .request("textDocument/hover", params, Some(slot))
            .await?;
        Ok(HoverResult::from_response(result))
    }

    /// Sends a request and returns the raw `result`.
    pub async fn request(
        &self,
        method: &'static str,
        params: Value,
        slot: Option<TriggerSlot>,
    ) -> Result<Option<Value>, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Request {
            method,
            params,
            slot,
            reply,
        })?;
        rx.await.unwrap_or(Err(BridgeError::SessionTerminated))
    }

    /// Queues file changes for the server. Never blocks.
    pub fn notify_file_changes(&self, changes: Vec<FileChange>) {
        let _ = self.send(SessionCommand::FileChanges(changes));
    }

    /// Number of document sync batches that reached the session.
    pub fn sync_notifications_received(&self) -> u64 {
        self.sync_received.load(Ordering::SeqCst)
    }

    fn send(&self, command: SessionCommand) -> Result<(), BridgeError> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::SessionTerminated)
    }
}

impl ChangeSink for SessionHandle {
    fn is_active(&self) -> bool {
        SessionHandle::is_active(self)
    }

    fn forward(&self, changes: Vec<FileChange>) {
        self.notify_file_changes(changes);
    }
}

/// A protocol session: the actor task plus the host-facing ends.
pub struct ProtocolSession {
    handle: SessionHandle,
    notification_rx: Receiver<BridgeNotification>,
}

impl ProtocolSession {
    /// Spawns a session that launches the configured server process.
    ///
    /// Must be called from within a tokio runtime. The server is not started
    /// until `SessionHandle::start`.
    pub fn spawn(config: BridgeConfig) -> Self {
        Self::spawn_with(config, ProcessLauncher)
    }

    /// Spawns a session with a custom launcher.
    pub fn spawn_with(config: BridgeConfig, launcher: impl Launcher) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Stopped);
        let (notification_tx, notification_rx) = crossbeam_channel::unbounded();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let sync_received = Arc::new(AtomicU64::new(0));
        let selector = Arc::new(config.document_selector.clone());

        let actor = SessionActor {
            config,
            launcher,
            commands: command_rx,
            state: state_tx,
            transport: None,
            incoming: None,
            correlator: Correlator::new(),
            handshake: None,
            timer_tx,
            timer_rx,
            notification_tx,
            sync_received: sync_received.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            handle: SessionHandle {
                commands: command_tx,
                state: state_rx,
                sync_received,
                selector,
            },
            notification_rx,
        }
    }

    /// Returns a handle for sending requests.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Tries to receive a notification (non-blocking).
    pub fn try_recv_notification(&self) -> Option<BridgeNotification> {
        self.notification_rx.try_recv().ok()
    }
}

/// Deadlines tracked by the actor.
enum Expiry {
    Handshake(RequestId),
    Request(RequestId),
}

/// The in-flight `initialize` request and everyone waiting on it.
struct PendingHandshake {
    id: RequestId,
    replies: Vec<oneshot::Sender<Result<(), BridgeError>>>,
}

impl PendingHandshake {
    fn finish(self, outcome: Result<(), BridgeError>) {
        for reply in self.replies {
            let _ = reply.send(outcome.clone());
        }
    }
}

struct SessionActor<L> {
    config: BridgeConfig,
    launcher: L,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    transport: Option<SessionTransport>,
    incoming: Option<mpsc::UnboundedReceiver<Value>>,
    correlator: Correlator,
    handshake: Option<PendingHandshake>,
    timer_tx: mpsc::UnboundedSender<Expiry>,
    timer_rx: mpsc::UnboundedReceiver<Expiry>,
    notification_tx: Sender<BridgeNotification>,
    sync_received: Arc<AtomicU64>,
}

impl<L: Launcher> SessionActor<L> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                message = next_message(&mut self.incoming) => match message {
                    Some(message) => self.handle_message(message).await,
                    None => self.terminate("language server closed the connection").await,
                },
                Some(expiry) = self.timer_rx.recv() => self.handle_expiry(expiry).await,
            }
        }

        // Every handle is gone
        self.stop().await;
        log::info!("Language server session shut down");
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Session state: {} -> {}", previous, state);
        }
    }

    fn notify(&self, notification: BridgeNotification) {
        let _ = self.notification_tx.send(notification);
    }

    fn schedule(&self, expiry: Expiry, after: Duration) {
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = timer_tx.send(expiry);
        });
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { reply } => self.start(reply).await,
            SessionCommand::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            SessionCommand::Request {
                method,
                params,
                slot,
                reply,
            } => self.issue(method, params, slot, reply).await,
            SessionCommand::FileChanges(changes) => self.forward_changes(changes).await,
        }
    }

    async fn start(&mut self, reply: oneshot::Sender<Result<(), BridgeError>>) {
        match self.current() {
            SessionState::Running => {
                let _ = reply.send(Ok(()));
                return;
            }
            SessionState::Starting => {
                if let Some(handshake) = self.handshake.as_mut() {
                    handshake.replies.push(reply);
                }
                return;
            }
            SessionState::Stopped | SessionState::Stopping => {}
        }

        self.set_state(SessionState::Starting);

        let (transport, reader) = match self.launcher.launch(&self.config.server) {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(SessionState::Stopped);
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.transport = Some(transport);
        self.incoming = Some(reader.receive());

        let id = self.correlator.next_id();
        let sent = match self.initialize_params() {
            Ok(params) => self.send_request(id.clone(), "initialize", Some(params)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.shutdown_transport().await;
            self.set_state(SessionState::Stopped);
            let _ = reply.send(Err(BridgeError::SpawnFailed {
                command: self.config.server.command.clone(),
                reason: e.to_string(),
            }));
            return;
        }

        self.handshake = Some(PendingHandshake {
            id: id.clone(),
            replies: vec![reply],
        });
        self.schedule(Expiry::Handshake(id), self.config.timeouts.handshake());
    }

    fn initialize_params(&self) -> Result<Value, BridgeError> {
        let workspace_folders = self.config.workspace_root.as_deref().and_then(|root| {
            let uri = path_to_uri(root)?;
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".to_string());
            Some(vec![WorkspaceFolder { uri, name }])
        });

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            client_info: Some(ClientInfo {
                name: "funchaiku".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    hover: Some(HoverClientCapabilities {
                        dynamic_registration: Some(false),
                        content_format: Some(vec![MarkupKind::PlainText, MarkupKind::Markdown]),
                    }),
                    ..Default::default()
                }),
                workspace: Some(WorkspaceClientCapabilities {
                    did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            workspace_folders,
            ..Default::default()
        };
        transport::to_value(params)
    }

    async fn finish_handshake(&mut self, response: JsonRpcResponse) {
        let Some(handshake) = self.handshake.take() else {
            return;
        };

        if let Some(error) = response.error {
            log::error!("Language server rejected initialize: {}", error.message);
            self.shutdown_transport().await;
            self.set_state(SessionState::Stopped);
            handshake.finish(Err(BridgeError::Server {
                code: error.code,
                message: error.message,
            }));
            return;
        }

        let result: InitializeResult = match response.result {
            Some(v) => serde_json::from_value(v).unwrap_or_default(),
            None => InitializeResult::default(),
        };
        if result.capabilities.hover_provider.is_none() {
            log::warn!("Language server does not advertise hover support");
        }

        if let Err(e) = self.send_notification("initialized", Some(json!({}))).await {
            self.shutdown_transport().await;
            self.set_state(SessionState::Stopped);
            handshake.finish(Err(e));
            return;
        }

        let capabilities_summary = format_capabilities(&result.capabilities);
        log::info!("Language server initialized: {}", capabilities_summary);
        self.set_state(SessionState::Running);
        self.notify(BridgeNotification::ServerReady {
            capabilities_summary,
        });
        handshake.finish(Ok(()));
    }

    async fn stop(&mut self) {
        match self.current() {
            SessionState::Stopped => {}
            SessionState::Starting => {
                log::info!("Stopping language server during startup");
                let handshake = self.handshake.take();
                self.shutdown_transport().await;
                self.set_state(SessionState::Stopped);
                if let Some(handshake) = handshake {
                    handshake.finish(Err(BridgeError::SessionTerminated));
                }
            }
            SessionState::Running | SessionState::Stopping => {
                log::info!("Shutting down language server");
                self.set_state(SessionState::Stopping);
                self.correlator.cancel_all(BridgeError::SessionTerminated);

                let id = self.correlator.next_id();
                // Best effort; a wedged server is killed after the grace period
                if self.send_request(id.clone(), "shutdown", None).await.is_ok() {
                    self.await_shutdown_reply(&id).await;
                }
                let _ = self.send_notification("exit", None).await;

                self.shutdown_transport().await;
                self.set_state(SessionState::Stopped);
            }
        }
    }

    /// Waits up to the shutdown grace period for the `shutdown` response.
    ///
    /// Anything else the server sends meanwhile is dropped.
    async fn await_shutdown_reply(&mut self, id: &RequestId) {
        let grace = self.config.timeouts.shutdown_grace();
        let Some(incoming) = self.incoming.as_mut() else {
            return;
        };

        let reply = async {
            while let Some(message) = incoming.recv().await {
                if let Some(JsonRpcMessage::Response(response)) = transport::parse_message(&message)
                {
                    if response.id == *id {
                        return true;
                    }
                }
            }
            false
        };

        match tokio::time::timeout(grace, reply).await {
            Ok(true) => log::debug!("Language server acknowledged shutdown"),
            Ok(false) => log::debug!("Language server closed before acknowledging shutdown"),
            Err(_) => log::warn!(
                "Language server did not acknowledge shutdown within {:?}",
                grace
            ),
        }
    }

    /// Forced transition to Stopped after the server went away.
    async fn terminate(&mut self, reason: &str) {
        self.incoming = None;
        let previous = self.current();
        if previous == SessionState::Stopped {
            return;
        }

        log::warn!("Language server session terminated: {}", reason);
        self.set_state(SessionState::Stopped);

        let handshake = self.handshake.take();
        let cancelled = self.correlator.cancel_all(BridgeError::SessionTerminated);
        if cancelled > 0 {
            log::debug!("Cancelled {} outstanding request(s)", cancelled);
        }
        if let Some(handshake) = handshake {
            handshake.finish(Err(BridgeError::SpawnFailed {
                command: self.config.server.command.clone(),
                reason: reason.to_string(),
            }));
        }

        self.shutdown_transport().await;

        if previous == SessionState::Running {
            self.notify(BridgeNotification::SessionTerminated {
                reason: reason.to_string(),
            });
        }
    }

    async fn shutdown_transport(&mut self) {
        self.incoming = None;
        if let Some(mut transport) = self.transport.take() {
            transport.stop(self.config.timeouts.shutdown_grace()).await;
        }
    }

    async fn issue(
        &mut self,
        method: &'static str,
        params: Value,
        slot: Option<TriggerSlot>,
        reply: RawReply,
    ) {
        let state = self.current();
        if state != SessionState::Running {
            let _ = reply.send(Err(BridgeError::NotRunning(state)));
            return;
        }

        let id = self.correlator.next_id();
        if let Some(superseded) = self.correlator.register(id.clone(), method, slot, reply) {
            log::debug!("{:?} superseded by {:?}", superseded, id);
            if let Ok(params) = transport::to_value(CancelParams {
                id: superseded.into(),
            }) {
                let _ = self.send_notification("$/cancelRequest", Some(params)).await;
            }
        }

        if let Err(e) = self.send_request(id.clone(), method, Some(params)).await {
            self.correlator.fail(&id, e);
            self.terminate("failed to write to language server").await;
            return;
        }
        self.schedule(Expiry::Request(id), self.config.timeouts.request());
    }

    async fn forward_changes(&mut self, changes: Vec<FileChange>) {
        self.sync_received.fetch_add(1, Ordering::SeqCst);

        if self.current() != SessionState::Running {
            log::trace!("Session not running, discarding {} change(s)", changes.len());
            return;
        }

        let events: Vec<FileEvent> = changes
            .into_iter()
            .filter_map(|change| Some(FileEvent::new(path_to_uri(&change.path)?, change.kind.into())))
            .collect();
        if events.is_empty() {
            return;
        }

        let params = match transport::to_value(DidChangeWatchedFilesParams { changes: events }) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("Dropping file changes: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .send_notification("workspace/didChangeWatchedFiles", Some(params))
            .await
        {
            log::warn!("Failed to forward file changes: {}", e);
        }
    }

    async fn handle_expiry(&mut self, expiry: Expiry) {
        match expiry {
            Expiry::Handshake(id) => {
                if !self.handshake.as_ref().is_some_and(|h| h.id == id) {
                    return;
                }
                let timeout = self.config.timeouts.handshake();
                log::error!("Language server did not answer initialize within {:?}", timeout);
                let handshake = self.handshake.take();
                self.shutdown_transport().await;
                self.set_state(SessionState::Stopped);
                if let Some(handshake) = handshake {
                    handshake.finish(Err(BridgeError::HandshakeTimeout(timeout)));
                }
            }
            Expiry::Request(id) => {
                if self.correlator.expire(&id, self.config.timeouts.request()) {
                    log::debug!("Request {:?} timed out", id);
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Value) {
        match transport::parse_message(&message) {
            Some(JsonRpcMessage::Response(response)) => {
                if self.handshake.as_ref().is_some_and(|h| h.id == response.id) {
                    self.finish_handshake(response).await;
                } else {
                    self.correlator.resolve(response);
                }
            }
            Some(JsonRpcMessage::Notification(notification)) => {
                self.handle_notification(notification);
            }
            Some(JsonRpcMessage::Request(request)) => self.answer_server_request(request).await,
            None => log::debug!("Ignoring unrecognised message: {}", message),
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "window/logMessage" => {
                if let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<LogMessageParams>(p).ok())
                {
                    let message = params.message;
                    match LogLevel::from(params.typ) {
                        LogLevel::Error => log::error!(target: "funchaiku::server", "{}", message),
                        LogLevel::Warning => log::warn!(target: "funchaiku::server", "{}", message),
                        LogLevel::Info => log::info!(target: "funchaiku::server", "{}", message),
                        LogLevel::Log => log::debug!(target: "funchaiku::server", "{}", message),
                    }
                }
            }
            "window/showMessage" => {
                if let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<ShowMessageParams>(p).ok())
                {
                    self.notify(BridgeNotification::ServerMessage {
                        level: params.typ.into(),
                        message: params.message,
                    });
                }
            }
            _ => {
                log::trace!("Unhandled notification: {}", notification.method);
            }
        }
    }

    async fn answer_server_request(&mut self, request: JsonRpcRequest) {
        log::debug!("Server request: {} (id: {:?})", request.method, request.id);
        let result = match request.method.as_str() {
            "client/registerCapability" | "window/workDoneProgress/create" => Ok(Value::Null),
            _ => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Unhandled method {}", request.method),
                data: None,
            }),
        };

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send_response(request.id, result).await {
                log::warn!("Failed to answer server request: {}", e);
            }
        }
    }

    async fn send_request(
        &mut self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), BridgeError> {
        let transport = self.transport.as_mut().ok_or(BridgeError::TransportClosed)?;
        transport.send_request(id, method, params).await
    }

    async fn send_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), BridgeError> {
        let transport = self.transport.as_mut().ok_or(BridgeError::TransportClosed)?;
        transport.send_notification(method, params).await
    }
}

async fn next_message(incoming: &mut Option<mpsc::UnboundedReceiver<Value>>) -> Option<Value> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Formats server capabilities as a summary string.
fn format_capabilities(caps: &ServerCapabilities) -> String {
    let mut features = Vec::new();

    if caps.hover_provider.is_some() {
        features.push("hover");
    }
    if caps.text_document_sync.is_some() {
        features.push("sync");
    }
    if caps.workspace.is_some() {
        features.push("workspace");
    }

    if features.is_empty() {
        "no features".to_string()
    } else {
        features.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::sync::{route_event, FileChangeKind};
    use crate::testing::ScriptedLauncher;
    use crate::types::DocumentSelector;
    use notify::event::{CreateKind, EventKind};
    use std::path::PathBuf;
    use std::time::Instant;
    use tokio::sync::Notify;

    fn config(request_ms: u64, handshake_ms: u64) -> BridgeConfig {
        BridgeConfig {
            timeouts: Timeouts {
                handshake_ms,
                request_ms,
                shutdown_grace_ms: 200,
            },
            ..Default::default()
        }
    }

    fn position() -> PositionRequest {
        PositionRequest::new("file:///ws/main.go".parse().unwrap(), 4, 2)
    }

    async fn next_notification(session: &ProtocolSession) -> BridgeNotification {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(notification) = session.try_recv_notification() {
                return notification;
            }
            assert!(Instant::now() < deadline, "no notification arrived");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_handshake_ack_makes_session_active() {
        let session = ProtocolSession::spawn_with(
            config(1000, 1000),
            ScriptedLauncher::answering(Value::Null),
        );
        let handle = session.handle();
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(!handle.is_active());

        handle.start().await.unwrap();

        assert!(handle.is_active());
        assert_eq!(
            next_notification(&session).await,
            BridgeNotification::ServerReady {
                capabilities_summary: "hover".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_initialize_announces_client() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher::new(move |mut server| {
            let seen_tx = seen_tx.clone();
            async move {
                let initialize = server.complete_handshake().await;
                let _ = seen_tx.send(initialize);
                server.serve(|_| Value::Null).await;
            }
        });
        let mut cfg = config(1000, 1000);
        cfg.workspace_root = Some(PathBuf::from("/ws/haiku"));
        let session = ProtocolSession::spawn_with(cfg, launcher);

        session.handle().start().await.unwrap();

        let initialize = seen_rx.recv().await.unwrap();
        let params = &initialize["params"];
        assert_eq!(params["processId"], std::process::id());
        assert_eq!(params["clientInfo"]["name"], "funchaiku");
        assert_eq!(params["workspaceFolders"][0]["name"], "haiku");
        assert!(params["capabilities"]["textDocument"]["hover"].is_object());
    }

    #[tokio::test]
    async fn test_handshake_timeout_stops_without_retry() {
        let launcher = ScriptedLauncher::new(|mut server| async move {
            server.expect("initialize").await;
            // Never answer
            while server.recv().await.is_some() {}
        });
        let session = ProtocolSession::spawn_with(config(1000, 100), launcher.clone());
        let handle = session.handle();

        let err = handle.start().await.unwrap_err();

        assert_eq!(err, BridgeError::HandshakeTimeout(Duration::from_millis(100)));
        assert!(err.is_session_level());
        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(launcher.launches(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(launcher.launches(), 1);
        assert!(session.try_recv_notification().is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failed() {
        let mut cfg = config(1000, 1000);
        cfg.server.command = "funchaiku-definitely-not-installed".to_string();
        let session = ProtocolSession::spawn(cfg);
        let handle = session.handle();

        let err = handle.start().await.unwrap_err();

        assert!(matches!(err, BridgeError::SpawnFailed { .. }));
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_server_exit_during_handshake_is_spawn_failed() {
        let launcher = ScriptedLauncher::new(|mut server| async move {
            server.expect("initialize").await;
        });
        let session = ProtocolSession::spawn_with(config(1000, 5000), launcher);
        let handle = session.handle();

        let err = handle.start().await.unwrap_err();

        assert!(matches!(err, BridgeError::SpawnFailed { .. }));
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(session.try_recv_notification().is_none());
    }

    #[tokio::test]
    async fn test_rejected_initialize() {
        let launcher = ScriptedLauncher::new(|mut server| async move {
            let initialize = server.expect("initialize").await;
            server
                .respond_error(&initialize["id"], -32603, "no haiku today")
                .await;
            while server.recv().await.is_some() {}
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();

        let err = handle.start().await.unwrap_err();

        assert_eq!(
            err,
            BridgeError::Server {
                code: -32603,
                message: "no haiku today".to_string()
            }
        );
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_request_outside_running_fails_without_transport() {
        let launcher = ScriptedLauncher::answering(Value::Null);
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher.clone());

        let err = session
            .handle()
            .request_hover(TriggerSlot::Show, &position())
            .await
            .unwrap_err();

        assert_eq!(err, BridgeError::NotRunning(SessionState::Stopped));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_hover_outside_selector_never_reaches_server() {
        let hovers = Arc::new(AtomicU64::new(0));
        let launcher = {
            let hovers = hovers.clone();
            ScriptedLauncher::new(move |mut server| {
                let hovers = hovers.clone();
                async move {
                    server.complete_handshake().await;
                    server
                        .serve(move |_| {
                            hovers.fetch_add(1, Ordering::SeqCst);
                            json!({"contents": "reached server"})
                        })
                        .await;
                }
            })
        };
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        for uri in ["file:///ws/lib.rs", "untitled:///scratch.go"] {
            let request = PositionRequest::new(uri.parse().unwrap(), 0, 0);
            let err = handle
                .request_hover(TriggerSlot::Show, &request)
                .await
                .unwrap_err();
            assert_eq!(err, BridgeError::NotSelected(uri.to_string()));
        }

        // A selected document still goes through
        assert!(handle
            .request_hover(TriggerSlot::Show, &position())
            .await
            .unwrap()
            .is_some());
        assert_eq!(hovers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hover_round_trip() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher::new(move |mut server| {
            let seen_tx = seen_tx.clone();
            async move {
                server.complete_handshake().await;
                server
                    .serve(move |request| {
                        let _ = seen_tx.send(request.clone());
                        json!({"contents": {"kind": "plaintext", "value": "an old silent pond"}})
                    })
                    .await;
            }
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        let result = handle
            .request_hover(TriggerSlot::Show, &position())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            result.fragments[0].value.as_deref(),
            Some("an old silent pond")
        );
        let request = seen_rx.recv().await.unwrap();
        assert_eq!(request["params"]["textDocument"]["uri"], "file:///ws/main.go");
        assert_eq!(request["params"]["position"]["line"], 4);
        assert_eq!(request["params"]["position"]["character"], 2);
    }

    #[tokio::test]
    async fn test_null_hover_is_absent() {
        let session = ProtocolSession::spawn_with(
            config(1000, 1000),
            ScriptedLauncher::answering(Value::Null),
        );
        let handle = session.handle();
        handle.start().await.unwrap();

        let result = handle
            .request_hover(TriggerSlot::Show, &position())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_second_trigger_supersedes_first() {
        let first_seen = Arc::new(Notify::new());
        let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
        let launcher = {
            let first_seen = first_seen.clone();
            ScriptedLauncher::new(move |mut server| {
                let first_seen = first_seen.clone();
                let cancel_tx = cancel_tx.clone();
                async move {
                    server.complete_handshake().await;
                    let first = server.expect("textDocument/hover").await;
                    first_seen.notify_one();
                    let cancel = server.expect("$/cancelRequest").await;
                    let _ = cancel_tx.send((first["id"].clone(), cancel["params"]["id"].clone()));
                    let second = server.expect("textDocument/hover").await;
                    server.respond(&second["id"], json!({"contents": "second"})).await;
                    // Late answer for the superseded request
                    server.respond(&first["id"], json!({"contents": "first"})).await;
                    server.serve(|_| Value::Null).await;
                }
            })
        };
        let session = ProtocolSession::spawn_with(config(2000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request_hover(TriggerSlot::Show, &position()).await })
        };
        first_seen.notified().await;
        let second = handle.request_hover(TriggerSlot::Show, &position()).await;

        assert_eq!(first.await.unwrap(), Err(BridgeError::Superseded));
        let second = second.unwrap().unwrap();
        assert_eq!(second.fragments[0].value.as_deref(), Some("second"));

        let (first_id, cancelled_id) = cancel_rx.recv().await.unwrap();
        assert_eq!(first_id, cancelled_id);
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_session_running() {
        let launcher = ScriptedLauncher::new(|mut server| async move {
            server.complete_handshake().await;
            // Swallow everything
            while server.recv().await.is_some() {}
        });
        let session = ProtocolSession::spawn_with(config(100, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        let err = handle
            .request_hover(TriggerSlot::Show, &position())
            .await
            .unwrap_err();

        assert_eq!(err, BridgeError::RequestTimeout(Duration::from_millis(100)));
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_server_exit_terminates_outstanding_request() {
        let launcher = ScriptedLauncher::new(|mut server| async move {
            server.complete_handshake().await;
            server.expect("textDocument/hover").await;
            // Returning drops the pipe, like a crashed process
        });
        let session = ProtocolSession::spawn_with(config(5000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();
        assert!(matches!(
            next_notification(&session).await,
            BridgeNotification::ServerReady { .. }
        ));

        let err = handle
            .request_hover(TriggerSlot::Show, &position())
            .await
            .unwrap_err();

        assert_eq!(err, BridgeError::SessionTerminated);
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(!handle.is_active());
        assert!(matches!(
            next_notification(&session).await,
            BridgeNotification::SessionTerminated { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_sends_shutdown_and_exit() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher::new(move |mut server| {
            let seen_tx = seen_tx.clone();
            async move {
                server.complete_handshake().await;
                let shutdown = server.expect("shutdown").await;
                // Nothing may follow until shutdown is answered
                let early = tokio::time::timeout(Duration::from_millis(50), server.recv()).await;
                server.respond(&shutdown["id"], Value::Null).await;
                server.expect("exit").await;
                let _ = seen_tx.send(early.is_err());
            }
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        handle.stop().await;

        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(seen_rx.recv().await, Some(true));

        // Stopping twice is a no-op
        handle.stop().await;
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_shutdown_reply_still_exits() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher::new(move |mut server| {
            let seen_tx = seen_tx.clone();
            async move {
                server.complete_handshake().await;
                server.expect("shutdown").await;
                server.expect("exit").await;
                let _ = seen_tx.send(());
            }
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        let started = Instant::now();
        handle.stop().await;

        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(seen_rx.recv().await.is_some());
        // Bounded by the shutdown grace period
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stop_cancels_outstanding_requests() {
        let hover_seen = Arc::new(Notify::new());
        let launcher = {
            let hover_seen = hover_seen.clone();
            ScriptedLauncher::new(move |mut server| {
                let hover_seen = hover_seen.clone();
                async move {
                    server.complete_handshake().await;
                    server.expect("textDocument/hover").await;
                    hover_seen.notify_one();
                    server.serve(|_| Value::Null).await;
                }
            })
        };
        let session = ProtocolSession::spawn_with(config(5000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request_hover(TriggerSlot::Show, &position()).await })
        };
        hover_seen.notified().await;
        handle.stop().await;

        assert_eq!(pending.await.unwrap(), Err(BridgeError::SessionTerminated));
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let launcher = ScriptedLauncher::answering(json!({"contents": "again"}));
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher.clone());
        let handle = session.handle();

        handle.start().await.unwrap();
        handle.stop().await;
        assert!(!handle.is_active());
        handle.start().await.unwrap();
        assert!(handle.is_active());
        assert_eq!(launcher.launches(), 2);

        let result = handle
            .request_hover(TriggerSlot::Generate, &position())
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_file_changes_are_forwarded_when_running() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher::new(move |mut server| {
            let seen_tx = seen_tx.clone();
            async move {
                server.complete_handshake().await;
                let changed = server.expect("workspace/didChangeWatchedFiles").await;
                let _ = seen_tx.send(changed);
                server.serve(|_| Value::Null).await;
            }
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();
        handle.start().await.unwrap();

        let selector = DocumentSelector::default();
        let created = |path: &str| {
            notify::Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from(path))
        };

        assert_eq!(route_event(&created("/ws/lib.rs"), &selector, &handle), 0);
        assert_eq!(route_event(&created("/ws/haiku.py"), &selector, &handle), 1);

        let changed = seen_rx.recv().await.unwrap();
        let change = &changed["params"]["changes"][0];
        assert_eq!(change["uri"], "file:///ws/haiku.py");
        assert_eq!(change["type"], 1);
        assert_eq!(handle.sync_notifications_received(), 1);
    }

    #[tokio::test]
    async fn test_file_changes_discarded_when_stopped() {
        let launcher = ScriptedLauncher::answering(Value::Null);
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher.clone());
        let handle = session.handle();

        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/ws/haiku.py"));
        assert_eq!(
            route_event(&created, &DocumentSelector::default(), &handle),
            0
        );
        assert_eq!(handle.sync_notifications_received(), 0);

        // Changes that reach a stopped session are dropped, not buffered
        handle.notify_file_changes(vec![FileChange::new(
            "/ws/haiku.py",
            FileChangeKind::Changed,
        )]);
        handle.stop().await;
        assert_eq!(handle.sync_notifications_received(), 1);
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher::new(move |mut server| {
            let seen_tx = seen_tx.clone();
            async move {
                server.complete_handshake().await;
                server
                    .request(41, "window/workDoneProgress/create", json!({"token": "t"}))
                    .await;
                server.request(42, "workspace/configuration", json!({"items": []})).await;
                for _ in 0..2 {
                    if let Some(reply) = server.recv().await {
                        let _ = seen_tx.send(reply);
                    }
                }
                server.serve(|_| Value::Null).await;
            }
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        session.handle().start().await.unwrap();

        let progress = seen_rx.recv().await.unwrap();
        assert_eq!(progress["id"], 41);
        assert!(progress["result"].is_null());
        assert!(progress.get("error").is_none());

        let configuration = seen_rx.recv().await.unwrap();
        assert_eq!(configuration["id"], 42);
        assert_eq!(configuration["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_show_message_is_forwarded() {
        let launcher = ScriptedLauncher::new(|mut server| async move {
            server.complete_handshake().await;
            server
                .notify("window/showMessage", json!({"type": 2, "message": "low on syllables"}))
                .await;
            server.serve(|_| Value::Null).await;
        });
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        session.handle().start().await.unwrap();

        assert!(matches!(
            next_notification(&session).await,
            BridgeNotification::ServerReady { .. }
        ));
        assert_eq!(
            next_notification(&session).await,
            BridgeNotification::ServerMessage {
                level: LogLevel::Warning,
                message: "low on syllables".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_is_active_tracks_transitions() {
        let launcher = ScriptedLauncher::answering(Value::Null);
        let session = ProtocolSession::spawn_with(config(1000, 1000), launcher);
        let handle = session.handle();

        let mut observed = vec![handle.is_active()];
        handle.start().await.unwrap();
        observed.push(handle.is_active());
        handle.start().await.unwrap();
        observed.push(handle.is_active());
        handle.stop().await;
        observed.push(handle.is_active());

        assert_eq!(observed, vec![false, true, true, false]);
    }

    #[test]
    fn test_format_capabilities() {
        let caps = ServerCapabilities {
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            ..Default::default()
        };
        assert_eq!(format_capabilities(&caps), "hover");
        assert_eq!(
            format_capabilities(&ServerCapabilities::default()),
            "no features"
        );
    }
}
