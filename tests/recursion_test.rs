//! Cross-module scenario: recursive child spawning past a project's
//! `max_depth` is rejected over the relay wire protocol.
//!
//! Reproduces spec scenario 2: an in-container agent already running at
//! `depth == max_depth` asks the relay for `session_message` (the
//! recursive child-spawn call) and gets back a JSON-RPC error mentioning
//! the recursion limit, rather than a spawned child.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use oubliette::agent_runtime::StubAgentRuntime;
use oubliette::config::{ConfigArgs, OrchestratorConfig};
use oubliette::container::{wait_for_path, ContainerConfig, ContainerRuntime, ExecOutput};
use oubliette::project::{InMemoryProjectRegistry, Project, RecursionConfig};
use oubliette::relay::RelaySocketHandler;
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
async fn recursive_spawn_past_max_depth_is_rejected_over_the_wire() {
    let dir = TempDir::new().unwrap();

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
            recursion_config: RecursionConfig { max_depth: 1, max_agents: 4, max_cost: 5.0 },
            model_hint: None,
            credential_refs: vec!["cred".into()],
        })
        .await;

    let controller = std::sync::Arc::new(SessionController::new(
        projects,
        std::sync::Arc::new(NoopContainerRuntime),
        std::sync::Arc::new(StubAgentRuntime),
        SessionStore::new(pool.clone()),
        WorkspaceStore::new(pool.clone()),
        std::sync::Arc::new(ActiveSessionManager::new(32, 1800)),
        std::sync::Arc::new(NullRelayConnector),
    ));

    let config = std::sync::Arc::new(OrchestratorConfig::new(ConfigArgs {
        port: None,
        data_dir: Some(dir.path().to_path_buf()),
        log: None,
        max_active_sessions: None,
    }));
    let tokens = TokenStore::new(pool);
    let registry = std::sync::Arc::new(ToolRegistry::new());
    let handler = std::sync::Arc::new(RelaySocketHandler::new(config.clone(), controller, tokens, registry));

    // Dial as upstream for a session already running at depth == max_depth;
    // a session_message call from it would spawn a depth+1 child.
    <std::sync::Arc<RelaySocketHandler> as RelayConnector>::connect_upstream(&handler, "S1", "P1", 1)
        .await
        .unwrap();

    let path = config.project_socket_path("P1");
    wait_for_path(&path, Duration::from_secs(5)).await.unwrap();
    let mut downstream = UnixStream::connect(&path).await.unwrap();
    downstream.write_all(b"OUBLIETTE-DOWNSTREAM\n").await.unwrap();

    downstream
        .write_all(
            format!(
                "{}\n",
                json!({"jsonrpc": "2.0", "id": 1, "method": "session_message", "params": {"message": "go deeper"}})
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut reader = BufReader::new(downstream);
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line)).await.unwrap().unwrap();
    let response: Value = serde_json::from_str(line.trim()).unwrap();

    assert!(response.get("result").is_none());
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("Max recursion depth"), "unexpected message: {message}");
}
