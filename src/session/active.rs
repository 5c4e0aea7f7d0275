//! Active Session: per-session state machine, executor handle, pending
//! caller-tool requests ("ActiveSession").
//!
//! New module. The state-machine shape (`starting -> running -> {idle |
//! completed | failed}`, only running<->idle cycles) mirrors a claim-based
//! session status handling pattern (atomic claim, narrow set of allowed
//! source states) generalized from a two-state idle/running claim into the
//! full five-state machine this orchestrator needs, plus a caller-tool
//! pending-request table built fresh for the relay round-trip.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::agent_runtime::Executor;
use crate::error::OrchError;
use crate::event_buffer::EventBuffer;
use crate::ipc::event::EventBroadcaster;

const CALLER_TOOL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStatus {
    Starting,
    Running,
    Idle,
    Completed,
    Failed,
}

impl ActiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn accepts_messages(&self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }
}

/// Tools an external caller has exposed to a child agent through this
/// session ("Caller-tools mutability").
#[derive(Debug, Clone)]
pub struct CallerToolsConfig {
    pub caller_id: String,
    pub tool_defs: Vec<Value>,
}

pub type FinalResponseFetcher =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync>;

pub struct ActiveSession {
    pub session_id: String,
    pub project_id: String,
    pub workspace_id: String,
    executor: Mutex<Box<dyn Executor>>,
    status: RwLock<ActiveStatus>,
    last_activity_at: AtomicI64,
    pub events: EventBuffer,
    caller_tools: RwLock<Option<CallerToolsConfig>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    mcp_client: RwLock<Option<EventBroadcaster>>,
    final_response_fetcher: RwLock<Option<FinalResponseFetcher>>,
}

impl ActiveSession {
    pub fn new(
        session_id: String,
        project_id: String,
        workspace_id: String,
        executor: Box<dyn Executor>,
        event_buffer_capacity: usize,
    ) -> Self {
        Self {
            session_id,
            project_id,
            workspace_id,
            executor: Mutex::new(executor),
            status: RwLock::new(ActiveStatus::Starting),
            last_activity_at: AtomicI64::new(Utc::now().timestamp()),
            events: EventBuffer::new(event_buffer_capacity),
            caller_tools: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            mcp_client: RwLock::new(None),
            final_response_fetcher: RwLock::new(None),
        }
    }

    pub async fn status(&self) -> ActiveStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: ActiveStatus) {
        *self.status.write().await = status;
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity_at.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> chrono::Duration {
        let last = self.last_activity_at.load(Ordering::SeqCst);
        chrono::Duration::seconds((Utc::now().timestamp() - last).max(0))
    }

    /// `send_message`: requires `running|idle`, delivers to the
    /// executor, transitions to `running`. Messages submitted to a single
    /// ActiveSession are serialized by the executor-mutex lock order, which
    /// preserves submission order.
    pub async fn send_message(&self, text: &str) -> Result<(), OrchError> {
        {
            let status = self.status().await;
            if !status.accepts_messages() {
                return Err(OrchError::Conflict(format!(
                    "session {} is not accepting messages (status: {status:?})",
                    self.session_id
                )));
            }
        }
        let executor = self.executor.lock().await;
        executor
            .send(text)
            .await
            .map_err(|e| OrchError::from_external("session message", &e))?;
        drop(executor);
        self.set_status(ActiveStatus::Running).await;
        Ok(())
    }

    pub async fn next_event(&self) -> Option<crate::agent_runtime::RuntimeEvent> {
        let mut executor = self.executor.lock().await;
        executor.next_event().await
    }

    pub async fn bind_mcp_client(&self, broadcaster: EventBroadcaster) {
        *self.mcp_client.write().await = Some(broadcaster);
    }

    pub async fn mcp_client(&self) -> Option<EventBroadcaster> {
        self.mcp_client.read().await.clone()
    }

    /// May be called before the relay request-loop starts, or again later
    /// to replace the config on a running session.
    pub async fn set_caller_tools(&self, caller_id: String, tool_defs: Vec<Value>) {
        *self.caller_tools.write().await = Some(CallerToolsConfig { caller_id, tool_defs });
    }

    pub async fn caller_tools(&self) -> Option<CallerToolsConfig> {
        self.caller_tools.read().await.clone()
    }

    pub async fn set_final_response_fetcher(&self, fetcher: FinalResponseFetcher) {
        *self.final_response_fetcher.write().await = Some(fetcher);
    }

    /// Invokes the registered final-response fetcher. Returns
    /// `None` if no fetcher was registered (never called a completed
    /// session) or if reading the transcript failed.
    pub async fn final_response(&self) -> Option<String> {
        let fetcher = self.final_response_fetcher.read().await.clone()?;
        fetcher().await.ok()
    }

    /// Register a pending caller-tool request. Spawns the
    /// 60s timeout watchdog; if nobody calls `resolve` by then, the entry
    /// is cancelled and the returned receiver errors out.
    pub async fn register_caller_request(&self, request_id: String) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(CALLER_TOOL_TIMEOUT_SECS)).await;
            pending.lock().await.remove(&request_id);
        });
        rx
    }

    pub async fn resolve_caller_request(&self, request_id: &str, response: Value) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(request_id) {
            tx.send(response).is_ok()
        } else {
            false
        }
    }

    pub async fn cancel_caller_request(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    /// Drains all pending caller-tool requests with cancellation (`close`).
    pub async fn cancel_all_pending(&self) {
        self.pending.lock().await.clear();
    }

    /// Transitions to terminal and closes the executor exactly once.
    /// Idempotent: calling twice is a no-op the second time.
    pub async fn close(&self) {
        {
            let status = self.status().await;
            if status.is_terminal() {
                return;
            }
        }
        self.cancel_all_pending().await;
        let mut executor = self.executor.lock().await;
        let _ = executor.close().await;
        drop(executor);
        self.set_status(ActiveStatus::Completed).await;
    }

    pub async fn fail(&self) {
        self.cancel_all_pending().await;
        let mut executor = self.executor.lock().await;
        let _ = executor.close().await;
        drop(executor);
        self.set_status(ActiveStatus::Failed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_runtime::{AgentRuntime, ExecuteRequest, StubAgentRuntime};

    async fn active_session() -> ActiveSession {
        let runtime = StubAgentRuntime;
        let executor = runtime
            .execute_streaming(ExecuteRequest {
                prompt: "hi".into(),
                container_id: "c1".into(),
                working_dir: "/work".into(),
                project_id: "P1".into(),
                depth: 0,
                streaming_jsonrpc: false,
                resume_runtime_session_id: None,
                model: None,
                autonomy_level: None,
                reasoning_level: None,
                tools_allowed: None,
                tools_disallowed: None,
                append_system_prompt: None,
            })
            .await
            .unwrap();
        ActiveSession::new("S1".into(), "P1".into(), "default".into(), executor, 64)
    }

    #[tokio::test]
    async fn starts_in_starting_state() {
        let session = active_session().await;
        assert_eq!(session.status().await, ActiveStatus::Starting);
    }

    #[tokio::test]
    async fn send_message_requires_running_or_idle() {
        let session = active_session().await;
        let err = session.send_message("hi").await.unwrap_err();
        assert!(matches!(err, OrchError::Conflict(_)));
        session.set_status(ActiveStatus::Idle).await;
        session.send_message("hi").await.unwrap();
        assert_eq!(session.status().await, ActiveStatus::Running);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_absorbing() {
        let session = active_session().await;
        session.close().await;
        assert_eq!(session.status().await, ActiveStatus::Completed);
        session.close().await;
        assert_eq!(session.status().await, ActiveStatus::Completed);
        let err = session.send_message("hi").await.unwrap_err();
        assert!(matches!(err, OrchError::Conflict(_)));
    }

    #[tokio::test]
    async fn caller_request_resolves_exactly_once() {
        let session = active_session().await;
        let rx = session.register_caller_request("req-1".into()).await;
        assert!(session
            .resolve_caller_request("req-1", serde_json::json!({"ok": true}))
            .await);
        assert!(!session
            .resolve_caller_request("req-1", serde_json::json!({"ok": true}))
            .await);
        let value = rx.await.unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn cancel_all_pending_drops_receivers() {
        let session = active_session().await;
        let rx = session.register_caller_request("req-1".into()).await;
        session.cancel_all_pending().await;
        assert!(rx.await.is_err());
    }
}
