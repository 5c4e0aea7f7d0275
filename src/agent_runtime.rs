//! `AgentRuntime`/`Executor` capability traits.
//!
//! The agent runtime process — the actual LLM-driven executable — is an
//! external collaborator consumed via a streaming-executor interface. This
//! generalizes a `send`/`pause`/`resume`/`stop` runner trait (one runner per
//! CLI-backed provider) into a streaming shape: a request produces an
//! `Executor` exposing `events`/`errors` streams, a resumable
//! `runtime_session_id`, and `close`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One event surfaced by a running executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Message { role: String, text: String },
    Tool { name: String },
    Completion { final_text: String },
}

/// Inputs to `AgentRuntime::execute_streaming`.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub container_id: String,
    pub working_dir: String,
    pub project_id: String,
    pub depth: u32,
    /// Enables agent-side MCP mode, i.e. the in-container client should dial
    /// back as a relay downstream.
    pub streaming_jsonrpc: bool,
    /// Set when resuming a prior runtime session.
    pub resume_runtime_session_id: Option<String>,
    pub model: Option<String>,
    pub autonomy_level: Option<String>,
    pub reasoning_level: Option<String>,
    pub tools_allowed: Option<Vec<String>>,
    pub tools_disallowed: Option<Vec<String>>,
    pub append_system_prompt: Option<String>,
}

/// A running (or completed) agent turn. One `Executor` per `ActiveSession`
/// (invariant: "at most one live executor handle").
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runtime-assigned session id, used to resume later. Set
    /// exactly once, available as soon as the runtime reports it.
    fn runtime_session_id(&self) -> Option<String>;

    /// Pull the next event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<RuntimeEvent>;

    /// Pull the next error, if any, without consuming the event stream.
    async fn next_error(&mut self) -> Option<anyhow::Error>;

    /// Send an additional message to an already-running executor (used by
    /// `ActiveSession::send_message`).
    async fn send(&self, text: &str) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// External capability: start a streaming agent executor.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn execute_streaming(&self, request: ExecuteRequest) -> anyhow::Result<Box<dyn Executor>>;
}

/// A minimal in-memory `Executor`/`AgentRuntime` pair for tests and for
/// embedding this crate before a real agent runtime is wired in. Emits a
/// single completion event immediately.
pub struct StubExecutor {
    runtime_session_id: String,
    rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    closed: bool,
}

#[async_trait]
impl Executor for StubExecutor {
    fn runtime_session_id(&self) -> Option<String> {
        Some(self.runtime_session_id.clone())
    }

    async fn next_event(&mut self) -> Option<RuntimeEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn next_error(&mut self) -> Option<anyhow::Error> {
        None
    }

    async fn send(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct StubAgentRuntime;

#[async_trait]
impl AgentRuntime for StubAgentRuntime {
    async fn execute_streaming(&self, request: ExecuteRequest) -> anyhow::Result<Box<dyn Executor>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime_session_id = request
            .resume_runtime_session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let _ = tx.send(RuntimeEvent::Message {
            role: "assistant".to_string(),
            text: format!("stub response to: {}", request.prompt),
        });
        let _ = tx.send(RuntimeEvent::Completion {
            final_text: "stub completion".to_string(),
        });
        Ok(Box::new(StubExecutor {
            runtime_session_id,
            rx,
            closed: false,
        }))
    }
}
