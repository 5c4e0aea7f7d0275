//! Cross-module scenario: a `caller_tool` round-trip nobody answers times
//! out on the relay's own configured deadline, not the session's 60s
//! internal watchdog.
//!
//! Reproduces spec scenario 4. `config.toml` sets a 1-second
//! `caller_tool_timeout_secs`, so the relay's `tokio::time::timeout` around
//! the round-trip fires first and the JSON-RPC response comes back as an
//! error mentioning "timed out" well inside the test's own bound.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use oubliette::agent_runtime::{AgentRuntime, ExecuteRequest, StubAgentRuntime};
use oubliette::config::{ConfigArgs, OrchestratorConfig};
use oubliette::container::{wait_for_path, ContainerConfig, ContainerRuntime, ExecOutput};
use oubliette::ipc::EventBroadcaster;
use oubliette::project::{InMemoryProjectRegistry, Project, RecursionConfig};
use oubliette::relay::RelaySocketHandler;
use oubliette::session::active::ActiveSession;
use oubliette::session::controller::RelayConnector;
use oubliette::session::{ActiveSessionManager, NullRelayConnector, SessionController, SessionStore, WorkspaceStore};
use oubliette::token::TokenStore;
use oubliette::tools::registry::ToolRegistry;

struct NoopContainerRuntime;

#[async_trait]
impl ContainerRuntime for NoopContainerRuntime {
    async fn create(&self, _config: ContainerConfig) -> anyhow::Result<()> {
        Ok(())
    }
    async fn start(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn stop(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn remove(&self, _name: &str, _force: bool) -> anyhow::Result<()> {
        Ok(())
    }
    async fn status(&self, _name: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
    async fn exec(&self, _name: &str, _cmd: &[String], _cwd: &str) -> anyhow::Result<ExecOutput> {
        Ok(ExecOutput { stdout: String::new(), stderr: String::new(), exit_code: 0 })
    }
    async fn logs(&self, _name: &str, _tail: usize) -> anyhow::Result<String> {
        Ok(String::new())
    }
    async fn image_exists(&self, _image: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
    async fn pull(&self, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn unanswered_caller_tool_times_out_on_the_configured_deadline() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.toml"), "caller_tool_timeout_secs = 1\n").unwrap();

    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    SessionStore::migrate(&pool).await.unwrap();
    WorkspaceStore::migrate(&pool).await.unwrap();
    TokenStore::migrate(&pool).await.unwrap();

    let projects = std::sync::Arc::new(InMemoryProjectRegistry::new());
    projects
        .insert(Project {
            id: "P1".into(),
            display_name: "Test".into(),
            container_image: "img".into(),
            default_workspace_id: "default".into(),
            workspace_isolation: false,
            protected_paths: vec![],
            recursion_config: RecursionConfig { max_depth: 3, max_agents: 4, max_cost: 5.0 },
            model_hint: None,
            credential_refs: vec!["cred".into()],
        })
        .await;

    let active_manager = std::sync::Arc::new(ActiveSessionManager::new(32, 1800));
    let controller = std::sync::Arc::new(SessionController::new(
        projects,
        std::sync::Arc::new(NoopContainerRuntime),
        std::sync::Arc::new(StubAgentRuntime),
        SessionStore::new(pool.clone()),
        WorkspaceStore::new(pool.clone()),
        active_manager.clone(),
        std::sync::Arc::new(NullRelayConnector),
    ));

    let config = std::sync::Arc::new(OrchestratorConfig::new(ConfigArgs {
        port: None,
        data_dir: Some(dir.path().to_path_buf()),
        log: None,
        max_active_sessions: None,
    }));
    assert_eq!(config.caller_tool_timeout_secs, 1);

    let tokens = TokenStore::new(pool);
    let registry = std::sync::Arc::new(ToolRegistry::new());
    let handler = std::sync::Arc::new(RelaySocketHandler::new(config.clone(), controller, tokens, registry));

    // Register an ActiveSession with caller tools configured and a
    // broadcaster bound, but nothing ever subscribes and resolves the
    // request — simulating a caller that went away mid round-trip.
    let executor = StubAgentRuntime
        .execute_streaming(ExecuteRequest {
            prompt: "hi".into(),
            container_id: "c1".into(),
            working_dir: "/work".into(),
            project_id: "P1".into(),
            depth: 0,
            streaming_jsonrpc: true,
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
    let active = std::sync::Arc::new(ActiveSession::new("S1".into(), "P1".into(), "default".into(), executor, 64));
    active.set_caller_tools("caller-1".into(), vec![json!({"name": "noop"})]).await;
    active.bind_mcp_client(EventBroadcaster::new()).await;
    active_manager.register_or_reuse(active).await;

    <std::sync::Arc<RelaySocketHandler> as RelayConnector>::connect_upstream(&handler, "S1", "P1", 0)
        .await
        .unwrap();

    let path = config.project_socket_path("P1");
    wait_for_path(&path, Duration::from_secs(5)).await.unwrap();
    let mut downstream = UnixStream::connect(&path).await.unwrap();
    downstream.write_all(b"OUBLIETTE-DOWNSTREAM\n").await.unwrap();

    let mut reader = BufReader::new(downstream);

    // The caller_tools_config notification arrives unsolicited first.
    let mut notif_line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut notif_line)).await.unwrap().unwrap();
    let notification: Value = serde_json::from_str(notif_line.trim()).unwrap();
    assert_eq!(notification["method"], json!("caller_tools_config"));

    let mut write_half = reader.get_mut();
    write_half
        .write_all(
            format!(
                "{}\n",
                json!({"jsonrpc": "2.0", "id": 7, "method": "caller_tool", "params": {"tool": "noop", "arguments": {}}})
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut line = String::new();
    // Bounded well above the 1s configured timeout but far below the
    // session's 60s internal watchdog, so this only passes if the relay's
    // own deadline — not the watchdog — is what fired.
    tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line)).await.unwrap().unwrap();
    let response: Value = serde_json::from_str(line.trim()).unwrap();

    assert!(response.get("result").is_none());
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("timed out"), "unexpected message: {message}");
}
