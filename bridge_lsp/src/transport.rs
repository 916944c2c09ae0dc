//! JSON-RPC transport layer for LSP communication.
//!
//! Owns the language server process and carries framed messages over its
//! stdin/stdout. The framing code works on any async byte stream so the same
//! transport also runs over in-process pipes.

use crate::config::ServerConfig;
use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;

/// JSON-RPC message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Largest frame body accepted from the server.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Request ID (can be number or string).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<RequestId> for lsp_types::NumberOrString {
    fn from(id: RequestId) -> Self {
        match id {
            // LSP ids are i32 on the wire; ours are allocated from 1 upwards.
            RequestId::Number(n) => {
                lsp_types::NumberOrString::Number(i32::try_from(n).unwrap_or(i32::MAX))
            }
            RequestId::String(s) => lsp_types::NumberOrString::String(s),
        }
    }
}

/// Parses a JSON-RPC message to determine its type.
pub fn parse_message(value: &Value) -> Option<JsonRpcMessage> {
    // Check if it's a response (has id and result/error but no method)
    if value.get("id").is_some() && value.get("method").is_none() {
        return serde_json::from_value(value.clone())
            .ok()
            .map(JsonRpcMessage::Response);
    }

    // Check if it's a request (has id and method)
    if value.get("id").is_some() && value.get("method").is_some() {
        return serde_json::from_value(value.clone())
            .ok()
            .map(JsonRpcMessage::Request);
    }

    // Check if it's a notification (has method but no id)
    if value.get("method").is_some() && value.get("id").is_none() {
        return serde_json::from_value(value.clone())
            .ok()
            .map(JsonRpcMessage::Notification);
    }

    None
}

/// Write half: frames messages with a `Content-Length` header.
pub struct TransportWriter {
    output: Box<dyn AsyncWrite + Send + Unpin>,
}

impl TransportWriter {
    pub fn new(output: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            output: Box::new(output),
        }
    }

    /// Writes one framed JSON-RPC message.
    pub async fn write_message(&mut self, message: &Value) -> io::Result<()> {
        let content = serde_json::to_string(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", content.len());

        self.output.write_all(header.as_bytes()).await?;
        self.output.write_all(content.as_bytes()).await?;
        self.output.flush().await?;

        log::trace!("Sent: {}", content);
        Ok(())
    }
}

/// Read half: yields framed messages.
pub struct TransportReader {
    input: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl TransportReader {
    pub fn new(input: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let input: Box<dyn AsyncRead + Send + Unpin> = Box::new(input);
        Self {
            input: BufReader::new(input),
        }
    }

    /// Reads the body of the next frame.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        // Read headers
        let mut content_length: Option<usize> = None;
        let mut header_line = String::new();

        loop {
            header_line.clear();
            let bytes_read = self.input.read_line(&mut header_line).await?;
            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Server closed connection",
                ));
            }

            let line = header_line.trim();
            if line.is_empty() {
                break;
            }

            if let Some(len_str) = line.strip_prefix("Content-Length: ") {
                content_length = Some(len_str.parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "Invalid Content-Length")
                })?);
            }
        }

        let content_length = content_length.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Missing Content-Length header")
        })?;

        if content_length > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Content-Length {} exceeds {} bytes", content_length, MAX_FRAME_LEN),
            ));
        }

        let mut content = vec![0u8; content_length];
        self.input.read_exact(&mut content).await?;
        Ok(content)
    }

    /// Reads the next JSON-RPC message.
    pub async fn read_message(&mut self) -> io::Result<Value> {
        let content = self.read_frame().await?;
        parse_frame(&content)
    }

    /// Turns the reader into a stream of incoming messages.
    ///
    /// The channel closes when the peer closes its end or the framing breaks.
    /// Frames whose body is not valid JSON are skipped.
    pub fn receive(mut self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let frame = match self.read_frame().await {
                    Ok(frame) => frame,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        log::debug!("Language server closed its output");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Error reading from language server: {}", e);
                        break;
                    }
                };

                match parse_frame(&frame) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping malformed message: {}", e),
                }
            }
        });
        rx
    }
}

fn parse_frame(content: &[u8]) -> io::Result<Value> {
    let content_str = std::str::from_utf8(content).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "Invalid UTF-8 in message")
    })?;

    log::trace!("Received: {}", content_str);

    serde_json::from_str(content_str).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("Invalid JSON: {}", e))
    })
}

/// The spawned language server process.
pub struct ServerProcessHandle {
    child: Child,
    command: String,
}

impl ServerProcessHandle {
    /// OS process id, if the process has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Returns whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Waits for the process to exit, killing it after `grace`.
    async fn terminate(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("Language server '{}' exited: {}", self.command, status);
            }
            Ok(Err(e)) => {
                log::warn!("Failed to wait for language server '{}': {}", self.command, e);
            }
            Err(_) => {
                log::warn!(
                    "Language server '{}' did not exit within {:?}, killing it",
                    self.command,
                    grace
                );
                if let Err(e) = self.child.kill().await {
                    log::warn!("Failed to kill language server '{}': {}", self.command, e);
                }
            }
        }
    }
}

/// Duplex channel to the language server.
pub struct SessionTransport {
    writer: Option<TransportWriter>,
    process: Option<ServerProcessHandle>,
}

impl SessionTransport {
    /// Spawns the configured server process.
    pub fn start(config: &ServerConfig) -> Result<(Self, TransportReader), BridgeError> {
        let spawn_failed = |reason: String| BridgeError::SpawnFailed {
            command: config.command.clone(),
            reason,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            log::error!("Failed to start language server '{}': {}", config.command, e);
            spawn_failed(e.to_string())
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        log::info!(
            "Started language server: {} (pid {:?})",
            config.command,
            child.id()
        );

        let (mut transport, reader) = Self::from_streams(stdout, stdin);
        transport.process = Some(ServerProcessHandle {
            child,
            command: config.command.clone(),
        });
        Ok((transport, reader))
    }

    /// Builds a transport over an existing pair of streams.
    pub fn from_streams(
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> (Self, TransportReader) {
        (
            Self {
                writer: Some(TransportWriter::new(output)),
                process: None,
            },
            TransportReader::new(input),
        )
    }

    pub fn process(&self) -> Option<&ServerProcessHandle> {
        self.process.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Writes a framed message.
    pub async fn send(&mut self, message: &Value) -> Result<(), BridgeError> {
        if let Some(process) = self.process.as_mut() {
            if !process.is_alive() {
                self.writer = None;
                return Err(BridgeError::TransportClosed);
            }
        }

        let writer = self.writer.as_mut().ok_or(BridgeError::TransportClosed)?;
        if let Err(e) = writer.write_message(message).await {
            log::warn!("Failed to write to language server: {}", e);
            self.writer = None;
            return Err(BridgeError::TransportClosed);
        }
        Ok(())
    }

    /// Sends a JSON-RPC request.
    pub async fn send_request(
        &mut self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), BridgeError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        self.send(&to_value(request)?).await
    }

    /// Sends a JSON-RPC notification.
    pub async fn send_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), BridgeError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        self.send(&to_value(notification)?).await
    }

    /// Answers a server-initiated request.
    pub async fn send_response(
        &mut self,
        id: RequestId,
        result: Result<Value, JsonRpcError>,
    ) -> Result<(), BridgeError> {
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error,
        };
        self.send(&to_value(response)?).await
    }

    /// Closes the channel and ends the process.
    ///
    /// The server sees EOF on stdin first and gets `grace` to exit on its
    /// own before it is killed. Calling this again does nothing.
    pub async fn stop(&mut self, grace: Duration) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.output.shutdown().await;
        }
        if let Some(process) = self.process.take() {
            process.terminate(grace).await;
        }
    }
}

/// Encodes a message or its params as JSON.
pub(crate) fn to_value(message: impl Serialize) -> Result<Value, BridgeError> {
    serde_json::to_value(message).map_err(|e| {
        log::error!("Failed to encode message: {}", e);
        BridgeError::Encode(e.to_string())
    })
}

/// Logs the server's stderr line by line.
fn forward_stderr(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!(target: "funchaiku::server", "{}", line);
        }
    });
}

/// Opens a transport for a server configuration.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, config: &ServerConfig)
        -> Result<(SessionTransport, TransportReader), BridgeError>;
}

/// Launches the server as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        config: &ServerConfig,
    ) -> Result<(SessionTransport, TransportReader), BridgeError> {
        SessionTransport::start(config)
    }
}
