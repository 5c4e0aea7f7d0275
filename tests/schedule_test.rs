//! Cross-module scenario: a `skip`-overlap schedule whose prior run is
//! still in flight records a skipped execution instead of running again.
//!
//! Reproduces spec scenario 5. The stock `StubAgentRuntime` completes a
//! turn immediately, which would make the overlap race flaky, so this test
//! uses a gated executor that only completes once explicitly released,
//! holding the schedule's per-id lock for the whole window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Notify;

use oubliette::access::Scope;
use oubliette::agent_runtime::{AgentRuntime, ExecuteRequest, Executor, RuntimeEvent};
use oubliette::container::{ContainerConfig, ContainerRuntime, ExecOutput};
use oubliette::project::{InMemoryProjectRegistry, Project, RecursionConfig};
use oubliette::schedule::{NewSchedule, OverlapBehavior, ScheduleRunner, ScheduleStore, SessionBehavior, Target};
use oubliette::session::{ActiveSessionManager, NullRelayConnector, SessionController, SessionStore, WorkspaceStore};

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

#[derive(Default)]
struct Gate {
    released: AtomicBool,
    notify: Notify,
}

impl Gate {
    async fn wait(&self) {
        loop {
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct GatedExecutor {
    gate: Arc<Gate>,
    emitted: bool,
}

#[async_trait]
impl Executor for GatedExecutor {
    fn runtime_session_id(&self) -> Option<String> {
        Some("runtime-gated".into())
    }

    async fn next_event(&mut self) -> Option<RuntimeEvent> {
        if self.emitted {
            return None;
        }
        self.gate.wait().await;
        self.emitted = true;
        Some(RuntimeEvent::Completion { final_text: "done".into() })
    }

    async fn next_error(&mut self) -> Option<anyhow::Error> {
        None
    }

    async fn send(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct GatedAgentRuntime {
    gate: Arc<Gate>,
}

#[async_trait]
impl AgentRuntime for GatedAgentRuntime {
    async fn execute_streaming(&self, _request: ExecuteRequest) -> anyhow::Result<Box<dyn Executor>> {
        Ok(Box::new(GatedExecutor { gate: self.gate.clone(), emitted: false }))
    }
}

#[tokio::test]
async fn overlapping_skip_schedule_records_a_skip_then_a_success() {
    let gate = Arc::new(Gate::default());

    let session_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    SessionStore::migrate(&session_pool).await.unwrap();
    let workspace_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    WorkspaceStore::migrate(&workspace_pool).await.unwrap();
    let schedule_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    ScheduleStore::migrate(&schedule_pool).await.unwrap();

    let projects = Arc::new(InMemoryProjectRegistry::new());
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

    let controller = Arc::new(SessionController::new(
        projects,
        Arc::new(AlwaysRunningRuntime),
        Arc::new(GatedAgentRuntime { gate: gate.clone() }),
        SessionStore::new(session_pool),
        WorkspaceStore::new(workspace_pool),
        Arc::new(ActiveSessionManager::new(16, 3600)),
        Arc::new(NullRelayConnector),
    ));

    let schedule_store = ScheduleStore::new(schedule_pool);
    let schedule = schedule_store
        .create(NewSchedule {
            name: "nightly".into(),
            cron_expr: "0 0 * * * *".into(),
            prompt: "do the thing".into(),
            targets: vec![Target::new(project_id.clone(), Some("default".into()))],
            enabled: true,
            overlap_behavior: OverlapBehavior::Skip,
            session_behavior: SessionBehavior::New,
            creator_token_id: "tok-1".into(),
            creator_scope: Scope::Admin.to_string(),
        })
        .await
        .unwrap();

    let runner = Arc::new(ScheduleRunner::new(schedule_store.clone(), controller, Duration::from_secs(30)));

    runner.trigger(&schedule.id).await.unwrap();
    // Give the first trigger's background task a chance to acquire the
    // per-schedule lock and start executing before the second one races it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.trigger(&schedule.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    gate.release();
    // Let the first execution's background task observe completion and
    // record its outcome.
    for _ in 0..50 {
        let executions = schedule_store.list_executions(&schedule.id).await.unwrap();
        if executions.iter().any(|e| e.outcome == "success") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let executions = schedule_store.list_executions(&schedule.id).await.unwrap();
    assert!(executions.iter().any(|e| e.outcome == "skipped"), "expected a skipped execution, got {executions:?}");
    assert!(executions.iter().any(|e| e.outcome == "success"), "expected a successful execution, got {executions:?}");
}
