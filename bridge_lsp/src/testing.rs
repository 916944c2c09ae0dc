//! Scripted in-process language server for tests.
//!
//! `ScriptedLauncher` hands the session one end of an in-memory pipe and runs
//! a script against the other end. The script drives a `FakeServer`; when the
//! script returns, the pipe closes exactly as if the process had exited.

use crate::config::ServerConfig;
use crate::error::BridgeError;
use crate::transport::{Launcher, SessionTransport, TransportReader, TransportWriter};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Script = dyn Fn(FakeServer) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

/// Server side of an in-memory session.
pub struct FakeServer {
    reader: TransportReader,
    writer: TransportWriter,
}

impl FakeServer {
    /// Next message from the client, or `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Value> {
        self.reader.read_message().await.ok()
    }

    /// Reads until a message with `method` arrives and returns it.
    ///
    /// Panics if the client hangs up first.
    pub async fn expect(&mut self, method: &str) -> Value {
        loop {
            let message = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("client closed before sending {}", method));
            if message["method"] == method {
                return message;
            }
        }
    }

    /// Reads the `initialize` request, answers it and waits for
    /// `initialized`.
    pub async fn complete_handshake(&mut self) -> Value {
        let initialize = self.expect("initialize").await;
        self.respond(
            &initialize["id"],
            json!({
                "capabilities": { "hoverProvider": true },
                "serverInfo": { "name": "fake-haiku" }
            }),
        )
        .await;
        self.expect("initialized").await;
        initialize
    }

    pub async fn respond(&mut self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn respond_error(&mut self, id: &Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }))
        .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    pub async fn request(&mut self, id: i64, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
    }

    /// Answers hovers with `on_hover` and `shutdown` with `null` until the
    /// client sends `exit` or hangs up.
    pub async fn serve<F>(mut self, mut on_hover: F)
    where
        F: FnMut(&Value) -> Value + Send,
    {
        while let Some(message) = self.recv().await {
            match message["method"].as_str() {
                Some("textDocument/hover") => {
                    let result = on_hover(&message);
                    self.respond(&message["id"], result).await;
                }
                Some("shutdown") => self.respond(&message["id"], Value::Null).await,
                Some("exit") => return,
                _ => {}
            }
        }
    }

    async fn send(&mut self, message: Value) {
        // A client that already hung up is not an error for a script.
        let _ = self.writer.write_message(&message).await;
    }
}

/// Launcher that connects the session to a scripted `FakeServer`.
#[derive(Clone)]
pub struct ScriptedLauncher {
    script: Arc<Script>,
    launches: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new<F, Fut>(script: F) -> Self
    where
        F: Fn(FakeServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            script: Arc::new(
                move |server: FakeServer| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                    Box::pin(script(server))
                },
            ),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A server that completes the handshake and answers every hover with
    /// `result`.
    pub fn answering(result: Value) -> Self {
        Self::new(move |mut server| {
            let result = result.clone();
            async move {
                server.complete_handshake().await;
                server.serve(move |_| result.clone()).await;
            }
        })
    }

    /// How many times the session asked for a server.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(
        &self,
        _config: &ServerConfig,
    ) -> Result<(SessionTransport, TransportReader), BridgeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let fake = FakeServer {
            reader: TransportReader::new(server_read),
            writer: TransportWriter::new(server_write),
        };
        tokio::spawn((self.script)(fake));

        Ok(SessionTransport::from_streams(client_read, client_write))
    }
}
