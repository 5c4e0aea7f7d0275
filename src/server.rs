//! Server Façade: wires components, serves the tool-dispatch
//! transport, and drains cleanly on shutdown.
//!
//! `TcpListener` accept loop, one task per connection, `tokio::select!`
//! against a shutdown signal, each connection's requests dispatched onto
//! `ToolRegistry::call`. The wire framing itself (a JSON object per
//! WebSocket text frame carrying `api_key`, `tool`, optional `action`, and
//! `args`) is deliberately thin — just enough to exercise the dispatcher
//! over a real socket, not a protocol this crate owns end to end.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::Orchestrator;

pub struct Server {
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(orchestrator: Orchestrator, shutdown: CancellationToken) -> Self {
        Self { orchestrator, shutdown }
    }

    /// On start: load tools (already built by the caller into
    /// `orchestrator.tool_registry`), start the schedule runner, serve. On
    /// stop: stop the scheduler (await drain), close all active sessions,
    /// close the socket handler.
    pub async fn run(self) -> anyhow::Result<()> {
        self.orchestrator.schedule_runner.initialize().await?;
        self.orchestrator.schedule_runner.clone().spawn(self.shutdown.clone());
        self.orchestrator.controller.active_manager().clone().spawn_sweeper(self.shutdown.clone());

        let addr = format!("0.0.0.0:{}", self.orchestrator.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "oubliette server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let orchestrator = self.orchestrator.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, orchestrator, shutdown).await {
                            tracing::warn!(peer = %peer, err = %e, "connection handler exited with an error");
                        }
                    });
                }
            }
        }

        tracing::info!("shutting down: draining schedule runner and active sessions");
        self.orchestrator.controller.active_manager().close_all().await;
        self.orchestrator.relay.shutdown().await;
        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read.next() => {
                let Some(frame) = frame else { break };
                let message = frame?;
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let response = dispatch(&orchestrator, &text).await;
                if write.send(Message::Text(response.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn dispatch(orchestrator: &Orchestrator, text: &str) -> Value {
    let request: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return json!({ "isError": true, "content": [{"type": "text", "text": format!("invalid request: {e}")}] }),
    };

    let Some(api_key) = request.get("api_key").and_then(Value::as_str) else {
        return json!({ "isError": true, "content": [{"type": "text", "text": "missing api_key"}] });
    };
    let Some(name) = request.get("tool").and_then(Value::as_str) else {
        return json!({ "isError": true, "content": [{"type": "text", "text": "missing tool"}] });
    };
    let args = request.get("args").cloned().unwrap_or_else(|| json!({}));

    let token = match orchestrator.tokens.get(api_key).await {
        Ok(Some(token)) => token,
        Ok(None) => return json!({ "isError": true, "content": [{"type": "text", "text": "invalid api_key"}] }),
        Err(e) => return json!({ "isError": true, "content": [{"type": "text", "text": e.to_string()}] }),
    };
    let _ = orchestrator.tokens.touch(&token.id).await;
    let scope = match token.parsed_scope() {
        Ok(scope) => scope,
        Err(e) => return json!({ "isError": true, "content": [{"type": "text", "text": e.to_string()}] }),
    };

    let result = orchestrator.tool_registry.call(name, args, &scope).await;
    serde_json::to_value(result).unwrap_or(Value::Null)
}
