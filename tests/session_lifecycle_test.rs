//! Cross-module scenario: spawn -> message -> events.
//!
//! Reproduces spec scenario 1: create a project, spawn a prime session,
//! send it a follow-up message through the `message` fast path (attaching
//! to the existing active session rather than spawning a second one), then
//! poll its event buffer and confirm indexes start at 0.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use oubliette::access::Scope;
use oubliette::agent_runtime::StubAgentRuntime;
use oubliette::container::{ContainerConfig, ContainerRuntime, ExecOutput};
use oubliette::project::{InMemoryProjectRegistry, Project, RecursionConfig};
use oubliette::session::{
    ActiveSessionManager, ActiveStatus, EventsRequest, MessageRequest, NullRelayConnector, SessionController,
    SessionStore, SpawnRequest, WorkspaceStore,
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

async fn test_controller() -> (std::sync::Arc<SessionController>, String) {
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

    let controller = std::sync::Arc::new(SessionController::new(
        projects,
        std::sync::Arc::new(AlwaysRunningRuntime),
        std::sync::Arc::new(StubAgentRuntime),
        SessionStore::new(session_pool),
        WorkspaceStore::new(workspace_pool),
        std::sync::Arc::new(ActiveSessionManager::new(16, 3600)),
        std::sync::Arc::new(NullRelayConnector),
    ));
    (controller, project_id)
}

#[tokio::test]
async fn spawn_then_message_then_events() {
    let (controller, project_id) = test_controller().await;

    // spawn: {tool:"session", action:"spawn", project_id:"P1", prompt:"x", new_session:true}
    let spawned = controller
        .spawn(
            &Scope::Admin,
            SpawnRequest { project_id: Some(project_id.clone()), prompt: "x".into(), new_session: true, ..Default::default() },
        )
        .await
        .unwrap();
    assert!(spawned.spawned);

    // The stub executor completes its turn almost instantly via a
    // spawned reader task; force idle deterministically rather than race it.
    let active = controller.active_manager().get(&spawned.session_id).await.unwrap();
    active.set_status(ActiveStatus::Idle).await;

    // message: {action:"message", project_id:"P1", message:"hi"} -> {session_id:S, spawned:false}
    let messaged = controller
        .message(&Scope::Admin, MessageRequest { project_id: project_id.clone(), message: "hi".into(), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(messaged.session_id, spawned.session_id);
    assert!(!messaged.spawned);

    // events: {action:"events", session_id:S, since_index:-1} -> non-empty, indexes start at 0.
    let events = controller
        .events(EventsRequest { session_id: spawned.session_id.clone(), since_index: -1, max_events: None, include_children: false })
        .await
        .unwrap();
    assert!(!events.events.is_empty());
    assert_eq!(events.events.first().unwrap().event.index, 0);
}
