//! Cross-module scenario: spawning against an unresolvable workspace id.
//!
//! Reproduces spec scenario 3: `workspace_id` set, `create_workspace`
//! false, no workspace by that id exists yet -> `NotFound` whose message
//! text is exactly `"workspace nope not found"`.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use oubliette::access::Scope;
use oubliette::agent_runtime::StubAgentRuntime;
use oubliette::container::{ContainerConfig, ContainerRuntime, ExecOutput};
use oubliette::error::OrchError;
use oubliette::project::{InMemoryProjectRegistry, Project, RecursionConfig};
use oubliette::session::{
    ActiveSessionManager, NullRelayConnector, SessionController, SessionStore, SpawnRequest, WorkspaceStore,
};

struct AlwaysRunningRuntime;

#[async_trait]
impl ContainerRuntime for AlwaysRunningRuntime {
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
async fn spawn_against_unknown_workspace_reports_literal_not_found_text() {
    let session_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    SessionStore::migrate(&session_pool).await.unwrap();
    let workspace_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    WorkspaceStore::migrate(&workspace_pool).await.unwrap();

    let projects = std::sync::Arc::new(InMemoryProjectRegistry::new());
    let project_id = "P1".to_string();
    projects
        .insert(Project {
            id: project_id.clone(),
            display_name: "Sample".into(),
            container_image: "oubliette/sandbox:latest".into(),
            default_workspace_id: "default".into(),
            workspace_isolation: false,
            protected_paths: Vec::new(),
            recursion_config: RecursionConfig { max_depth: 3, max_agents: 16, max_cost: 25.0 },
            model_hint: None,
            credential_refs: vec!["cred-1".into()],
        })
        .await;

    let controller = SessionController::new(
        projects,
        std::sync::Arc::new(AlwaysRunningRuntime),
        std::sync::Arc::new(StubAgentRuntime),
        SessionStore::new(session_pool),
        WorkspaceStore::new(workspace_pool),
        std::sync::Arc::new(ActiveSessionManager::new(16, 3600)),
        std::sync::Arc::new(NullRelayConnector),
    );

    let err = controller
        .spawn(
            &Scope::Admin,
            SpawnRequest {
                project_id: Some(project_id),
                prompt: "x".into(),
                workspace_id: Some("nope".into()),
                create_workspace: false,
                new_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, OrchError::NotFound { ref kind, ref id } if *kind == "workspace" && id.as_str() == "nope"));
    assert_eq!(err.to_string(), "workspace nope not found");
}
