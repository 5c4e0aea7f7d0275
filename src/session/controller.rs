//! Session Controller: spawn / message / events / end orchestration.
//!
//! This is the orchestration core that owns the largest share of what the
//! Relay Socket Handler depends on. It is grounded on a component that owns
//! spawn/attach/end for a long-running provider session, generalized from a
//! single-provider, non-recursive model into a resume/create/child-spawn
//! three-way branch with depth-bounded recursion and exploration grouping.

use std::sync::Arc;

use async_trait::async_trait;

use crate::access::{allows, Access, Scope, Target};
use crate::agent_runtime::{AgentRuntime, ExecuteRequest, RuntimeEvent};
use crate::container::{ensure_running, ContainerRuntime};
use crate::error::OrchError;
use crate::event_buffer::IndexedEvent;
use crate::project::ProjectRegistry;

use super::active::{ActiveSession, ActiveStatus};
use super::manager::ActiveSessionManager;
use super::store::{NewSession, Session, SessionStatus, SessionStore, Turn};
use super::workspace::{WorkspaceRequest, WorkspaceStore};

const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 2048;

/// Child-context preamble prepended to a child session's prompt: states
/// depth, parent id, exploration id, and the shared results-directory
/// convention.
fn child_preamble(depth: u32, parent_id: &str, exploration_id: &str, workspace_id: &str) -> String {
    format!(
        "[child session: depth={depth}, parent={parent_id}, exploration={exploration_id}. \
         Write shared results under the results directory named after workspace '{workspace_id}'.]\n\n"
    )
}

/// Path of the shared results directory the child-context preamble tells
/// the agent to write under, rooted in the workspace's own tree.
fn results_dir_path(workspace_id: &str) -> String {
    format!("/workspace/{workspace_id}/results")
}

/// Opens the upstream relay connection for a newly started executor.
/// Implemented by `relay::RelaySocketHandler`; the controller only depends
/// on this trait so it never needs to know the wire protocol.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect_upstream(
        &self,
        session_id: &str,
        project_id: &str,
        depth: u32,
    ) -> anyhow::Result<()>;
}

/// No-op connector for tests and for embedding before a real relay is wired
/// in.
pub struct NullRelayConnector;

#[async_trait]
impl RelayConnector for NullRelayConnector {
    async fn connect_upstream(&self, _session_id: &str, _project_id: &str, _depth: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub project_id: Option<String>,
    pub prompt: String,
    pub workspace_id: Option<String>,
    pub create_workspace: bool,
    pub new_session: bool,
    pub model: Option<String>,
    pub autonomy_level: Option<String>,
    pub reasoning_level: Option<String>,
    pub tools_allowed: Option<Vec<String>>,
    pub tools_disallowed: Option<Vec<String>>,
    pub append_system_prompt: Option<String>,
    pub external_id: Option<String>,
    pub source: Option<String>,
    /// Set by the relay path when this is actually a child spawn inherited
    /// from context headers.
    pub inherited_parent_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub session_id: String,
    pub spawned: bool,
    pub workspace_created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MessageRequest {
    pub project_id: String,
    pub message: String,
    pub workspace_id: Option<String>,
    pub create_workspace: bool,
}

#[derive(Debug, Clone)]
pub struct MessageResult {
    pub session_id: String,
    pub spawned: bool,
    pub workspace_created: bool,
    pub last_event_index: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EventsRequest {
    pub session_id: String,
    pub since_index: i64,
    pub max_events: Option<usize>,
    pub include_children: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaggedEvent {
    #[serde(flatten)]
    pub event: IndexedEvent,
    /// Present when this event came from a child session via
    /// `include_children`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EventsResult {
    pub status: String,
    pub last_index: i64,
    pub events: Vec<TaggedEvent>,
    pub completed: bool,
    pub failed: bool,
    pub error: Option<String>,
    pub dropped_events: u64,
    pub final_response: Option<String>,
}

pub struct SessionController {
    projects: Arc<dyn ProjectRegistry>,
    containers: Arc<dyn ContainerRuntime>,
    agent_runtime: Arc<dyn AgentRuntime>,
    sessions: SessionStore,
    workspaces: WorkspaceStore,
    active: Arc<ActiveSessionManager>,
    relay: Arc<dyn RelayConnector>,
}

impl SessionController {
    pub fn new(
        projects: Arc<dyn ProjectRegistry>,
        containers: Arc<dyn ContainerRuntime>,
        agent_runtime: Arc<dyn AgentRuntime>,
        sessions: SessionStore,
        workspaces: WorkspaceStore,
        active: Arc<ActiveSessionManager>,
        relay: Arc<dyn RelayConnector>,
    ) -> Self {
        Self { projects, containers, agent_runtime, sessions, workspaces, active, relay }
    }

    async fn require_project(&self, project_id: &str) -> Result<crate::project::Project, OrchError> {
        self.projects
            .get(project_id)
            .await
            .map_err(|e| OrchError::from_external("project lookup", &e))?
            .ok_or_else(|| OrchError::NotFound { kind: "project", id: project_id.to_string() })
    }

    /// Public project lookup, used by the Schedule Runner to resolve a
    /// target's default workspace before deciding between `message`/`spawn`.
    pub async fn project(&self, project_id: &str) -> Result<crate::project::Project, OrchError> {
        self.require_project(project_id).await
    }

    /// `spawn`. `scope` is the caller's authenticated scope; access is
    /// checked here against the resolved project id so callers never need
    /// to pre-resolve it themselves.
    pub async fn spawn(&self, scope: &Scope, request: SpawnRequest) -> Result<SpawnResult, OrchError> {
        if let Some(parent_id) = &request.inherited_parent_session_id {
            return self.spawn_child(parent_id, request).await;
        }
        let project_id = request
            .project_id
            .clone()
            .ok_or_else(|| OrchError::MissingParameter("project_id".into()))?;
        if !allows(scope, Target::Project, Access::Write, Some(&project_id)) {
            return Err(OrchError::AccessDenied);
        }
        self.spawn_prime(&project_id, request).await
    }

    async fn spawn_prime(&self, project_id: &str, request: SpawnRequest) -> Result<SpawnResult, OrchError> {
        let project = self.require_project(project_id).await?;
        if !project.has_credentials() {
            return Err(OrchError::Conflict(format!(
                "project {project_id} has no provider credentials configured"
            )));
        }

        let resolved = self
            .workspaces
            .resolve(
                &project,
                &WorkspaceRequest {
                    workspace_id: request.workspace_id.clone(),
                    create_workspace: request.create_workspace,
                    external_id: request.external_id.clone(),
                    source: request.source.clone(),
                },
            )
            .await?;

        let container_name = format!("{}-{}", project.id, resolved.workspace_id);
        ensure_running(self.containers.as_ref(), &container_name)
            .await
            .map_err(|e| OrchError::from_external("container ensure_running", &e))?;

        if !request.new_session {
            if let Some(prior) = self
                .sessions
                .most_recent_resumable(project_id, &resolved.workspace_id)
                .await
                .map_err(|e| OrchError::from_external("session lookup", &e))?
            {
                return self.resume_or_reattach(&project, prior, resolved.workspace_created, &request).await;
            }
        }

        self.create_session(&project, &resolved.workspace_id, resolved.workspace_created, &request, None, None, 0)
            .await
    }

    async fn resume_or_reattach(
        &self,
        project: &crate::project::Project,
        prior: Session,
        workspace_created: bool,
        request: &SpawnRequest,
    ) -> Result<SpawnResult, OrchError> {
        if let Some(existing) = self.active.get(&prior.id).await {
            // Avoids duplicate event-reader tasks.
            return Ok(SpawnResult { session_id: existing.session_id.clone(), spawned: false, workspace_created });
        }
        let runtime_session_id = prior.runtime_session_id.clone();
        let exec_request = ExecuteRequest {
            prompt: request.prompt.clone(),
            container_id: format!("{}-{}", project.id, prior.workspace_id),
            working_dir: format!("/workspace/{}", prior.workspace_id),
            project_id: project.id.clone(),
            depth: prior.depth,
            streaming_jsonrpc: true,
            resume_runtime_session_id: runtime_session_id,
            model: request.model.clone(),
            autonomy_level: request.autonomy_level.clone(),
            reasoning_level: request.reasoning_level.clone(),
            tools_allowed: request.tools_allowed.clone(),
            tools_disallowed: request.tools_disallowed.clone(),
            append_system_prompt: request.append_system_prompt.clone(),
        };
        match self.agent_runtime.execute_streaming(exec_request).await {
            Ok(executor) => {
                self.register_active(&prior, executor).await;
                Ok(SpawnResult { session_id: prior.id, spawned: true, workspace_created })
            }
            Err(e) => {
                // Resume failure degrades to a fresh create.
                tracing::warn!(session_id = %prior.id, err = %e, "resume failed, degrading to fresh create");
                self.create_session(project, &prior.workspace_id, workspace_created, request, None, None, 0)
                    .await
            }
        }
    }

    /// Resumes a specific, already-known session id rather than whatever
    /// `most_recent_resumable` would pick for the `(project, workspace)`
    /// pair. Used by the Schedule Runner so a `Resume`-behavior target
    /// reattaches to *its own* `pinned_session_id` instead of whichever
    /// session happens to be most recent — two targets sharing a workspace,
    /// or a stray session created outside the schedule, must never hijack
    /// which session a schedule resumes.
    pub async fn resume_pinned(
        &self,
        scope: &Scope,
        project_id: &str,
        workspace_id: &str,
        pinned_session_id: &str,
        prompt: String,
    ) -> Result<SpawnResult, OrchError> {
        if !allows(scope, Target::Project, Access::Write, Some(project_id)) {
            return Err(OrchError::AccessDenied);
        }
        let project = self.require_project(project_id).await?;
        let prior = self
            .sessions
            .get(pinned_session_id)
            .await
            .map_err(|e| OrchError::from_external("session lookup", &e))?
            .filter(|s| s.project_id == project_id && s.workspace_id == workspace_id && s.runtime_session_id.is_some())
            .ok_or_else(|| OrchError::NotFound { kind: "session", id: pinned_session_id.to_string() })?;

        let request = SpawnRequest { project_id: Some(project_id.to_string()), prompt, ..Default::default() };
        self.resume_or_reattach(&project, prior, false, &request).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_session(
        &self,
        project: &crate::project::Project,
        workspace_id: &str,
        workspace_created: bool,
        request: &SpawnRequest,
        parent_id: Option<String>,
        exploration_id: Option<String>,
        depth: u32,
    ) -> Result<SpawnResult, OrchError> {
        let persisted = self
            .sessions
            .create(NewSession {
                project_id: project.id.clone(),
                workspace_id: workspace_id.to_string(),
                parent_id,
                exploration_id,
                depth,
                tools_allowed: request.tools_allowed.clone(),
                task_context: request.append_system_prompt.clone(),
            })
            .await
            .map_err(|e| OrchError::from_external("session create", &e))?;

        let exec_request = ExecuteRequest {
            prompt: request.prompt.clone(),
            container_id: format!("{}-{}", project.id, workspace_id),
            working_dir: format!("/workspace/{workspace_id}"),
            project_id: project.id.clone(),
            depth,
            streaming_jsonrpc: true,
            resume_runtime_session_id: None,
            model: request.model.clone(),
            autonomy_level: request.autonomy_level.clone(),
            reasoning_level: request.reasoning_level.clone(),
            tools_allowed: request.tools_allowed.clone(),
            tools_disallowed: request.tools_disallowed.clone(),
            append_system_prompt: request.append_system_prompt.clone(),
        };
        let executor = self
            .agent_runtime
            .execute_streaming(exec_request)
            .await
            .map_err(|e| OrchError::from_external("agent execute", &e))?;

        self.register_active(&persisted, executor).await;
        Ok(SpawnResult { session_id: persisted.id, spawned: true, workspace_created })
    }

    async fn register_active(&self, session: &Session, executor: Box<dyn crate::agent_runtime::Executor>) {
        tracing::info!(
            session_id = %session.id,
            project_id = %session.project_id,
            depth = session.depth,
            "session active"
        );
        let runtime_session_id = executor.runtime_session_id();
        let active = Arc::new(ActiveSession::new(
            session.id.clone(),
            session.project_id.clone(),
            session.workspace_id.clone(),
            executor,
            DEFAULT_EVENT_BUFFER_CAPACITY,
        ));
        active.set_status(ActiveStatus::Running).await;
        let active = self.active.register_or_reuse(active).await;

        if let Some(runtime_id) = runtime_session_id {
            let _ = self.sessions.set_runtime_session_id(&session.id, &runtime_id).await;
        }

        let _ = self
            .relay
            .connect_upstream(&session.id, &session.project_id, session.depth)
            .await;

        self.spawn_event_reader(active);
    }

    /// Background task draining the executor's event stream into the
    /// session's `EventBuffer` until completion.
    fn spawn_event_reader(&self, active: Arc<ActiveSession>) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                match active.next_event().await {
                    Some(RuntimeEvent::Message { role, text }) => {
                        active.events.append(IndexedEvent::message(role, text));
                    }
                    Some(RuntimeEvent::Tool { name }) => {
                        active.events.append(IndexedEvent::tool(name));
                    }
                    Some(RuntimeEvent::Completion { final_text }) => {
                        active.events.append(IndexedEvent::completion(final_text.clone()));
                        let _ = sessions
                            .append_turn(
                                &active.session_id,
                                Turn { prompt: String::new(), output_text: final_text, token_cost: 0.0 },
                            )
                            .await;
                        active.set_status(ActiveStatus::Idle).await;
                        let _ = sessions.set_status(&active.session_id, SessionStatus::Idle).await;
                    }
                    None => {
                        active.close().await;
                        let _ = sessions.set_status(&active.session_id, SessionStatus::Completed).await;
                        break;
                    }
                }
            }
        });
    }

    /// Child spawn. Persists a new `Session` only; no `ActiveSession` is
    /// registered — the child is driven by the relay path.
    async fn spawn_child(&self, parent_id: &str, request: SpawnRequest) -> Result<SpawnResult, OrchError> {
        let parent = self
            .sessions
            .get(parent_id)
            .await
            .map_err(|e| OrchError::from_external("parent session lookup", &e))?
            .ok_or_else(|| OrchError::NotFound { kind: "session", id: parent_id.to_string() })?;
        let project = self.require_project(&parent.project_id).await?;

        let depth = parent.depth + 1;
        if depth > project.recursion_config.max_depth {
            return Err(OrchError::RecursionExceeded(format!(
                "Max recursion depth {} exceeded at depth {depth}",
                project.recursion_config.max_depth
            )));
        }

        let container_name = format!("{}-{}", project.id, parent.workspace_id);
        ensure_running(self.containers.as_ref(), &container_name)
            .await
            .map_err(|e| OrchError::from_external("container ensure_running", &e))?;

        let exploration_id = parent.exploration_id.clone().unwrap_or_else(|| parent.id.clone());
        let preamble = child_preamble(depth, &parent.id, &exploration_id, &parent.workspace_id);
        let mut child_request = request;
        child_request.prompt = format!("{preamble}{}", child_request.prompt);

        let persisted = self
            .sessions
            .create(NewSession {
                project_id: project.id.clone(),
                workspace_id: parent.workspace_id.clone(),
                parent_id: Some(parent.id.clone()),
                exploration_id: Some(exploration_id),
                depth,
                tools_allowed: child_request.tools_allowed.clone(),
                task_context: child_request.append_system_prompt.clone(),
            })
            .await
            .map_err(|e| OrchError::from_external("child session create", &e))?;

        // The preamble told the child to write shared results under this
        // directory; make sure it actually exists. Best-effort — a failure
        // here shouldn't sink the whole spawn, since the agent can also
        // create it lazily on first write.
        let results_dir = results_dir_path(&parent.workspace_id);
        if let Err(e) = self
            .containers
            .exec(&container_name, &["mkdir".to_string(), "-p".to_string(), results_dir.clone()], "/")
            .await
        {
            tracing::warn!(container = %container_name, dir = %results_dir, err = %e, "failed to create shared results directory for child session");
        }

        Ok(SpawnResult { session_id: persisted.id, spawned: true, workspace_created: false })
    }

    /// `message`.
    pub async fn message(&self, scope: &Scope, request: MessageRequest) -> Result<MessageResult, OrchError> {
        if !allows(scope, Target::Project, Access::Write, Some(&request.project_id)) {
            return Err(OrchError::AccessDenied);
        }
        let project = self.require_project(&request.project_id).await?;
        let resolved = self
            .workspaces
            .resolve(
                &project,
                &WorkspaceRequest {
                    workspace_id: request.workspace_id.clone(),
                    create_workspace: request.create_workspace,
                    external_id: None,
                    source: None,
                },
            )
            .await?;

        if let Some(active) = self.active.by_project_workspace(&request.project_id, &resolved.workspace_id).await {
            let status = active.status().await;
            if status.accepts_messages() {
                active.send_message(&request.message).await?;
                let last_event_index = active.events.stats().last_index;
                return Ok(MessageResult {
                    session_id: active.session_id.clone(),
                    spawned: false,
                    workspace_created: resolved.workspace_created,
                    last_event_index,
                });
            }
            // Terminal: evict and fall through to the slow path.
            self.active.remove(&active.session_id).await;
        }

        let spawn_result = self
            .spawn_prime(
                &request.project_id,
                SpawnRequest {
                    project_id: Some(request.project_id.clone()),
                    prompt: request.message.clone(),
                    workspace_id: Some(resolved.workspace_id.clone()),
                    create_workspace: false,
                    new_session: false,
                    ..Default::default()
                },
            )
            .await?;
        Ok(MessageResult {
            session_id: spawn_result.session_id,
            spawned: true,
            workspace_created: resolved.workspace_created || spawn_result.workspace_created,
            last_event_index: -1,
        })
    }

    /// `events`.
    pub async fn events(&self, request: EventsRequest) -> Result<EventsResult, OrchError> {
        let active = self
            .active
            .get(&request.session_id)
            .await
            .ok_or_else(|| OrchError::NotFound { kind: "session", id: request.session_id.clone() })?;

        let stats = active.events.stats();
        let mut events: Vec<TaggedEvent> = active
            .events
            .since(request.since_index)
            .into_iter()
            .map(|event| TaggedEvent { event, source_session_id: None })
            .collect();

        if request.include_children {
            let persisted = self
                .sessions
                .get(&request.session_id)
                .await
                .map_err(|e| OrchError::from_external("session lookup", &e))?;
            if let Some(persisted) = persisted {
                for child_id in persisted.child_ids {
                    // Best-effort: skip children whose ActiveSession has
                    // been evicted.
                    if let Some(child) = self.active.get(&child_id).await {
                        events.extend(child.events.since(request.since_index).into_iter().map(|event| {
                            TaggedEvent { event, source_session_id: Some(child_id.clone()) }
                        }));
                    }
                }
            }
        }

        if let Some(max) = request.max_events {
            events.truncate(max);
        }

        let status = active.status().await;
        let completed = status == ActiveStatus::Completed;
        let failed = status == ActiveStatus::Failed;
        let final_response = if completed { active.final_response().await } else { None };

        Ok(EventsResult {
            status: format!("{status:?}").to_lowercase(),
            last_index: stats.last_index,
            events,
            completed,
            failed,
            error: None,
            dropped_events: stats.dropped_events,
            final_response,
        })
    }

    /// `end` (umbrella tool `session` action `end`).
    pub async fn end(&self, scope: &Scope, session_id: &str, project_id: &str) -> Result<(), OrchError> {
        if !allows(scope, Target::Project, Access::Write, Some(project_id)) {
            return Err(OrchError::AccessDenied);
        }
        if let Some(active) = self.active.get(session_id).await {
            active.close().await;
            self.active.remove(session_id).await;
        }
        self.sessions
            .set_status(session_id, SessionStatus::Ended)
            .await
            .map_err(|e| OrchError::from_external("session end", &e))?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, OrchError> {
        self.sessions
            .get(session_id)
            .await
            .map_err(|e| OrchError::from_external("session get", &e))?
            .ok_or_else(|| OrchError::NotFound { kind: "session", id: session_id.to_string() })
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Session>, OrchError> {
        self.sessions
            .list_by_project(project_id)
            .await
            .map_err(|e| OrchError::from_external("session list", &e))
    }

    /// `session cleanup`.
    pub async fn cleanup(&self, project_id: &str, max_age_secs: i64) -> Result<u64, OrchError> {
        self.sessions
            .cleanup(project_id, chrono::Duration::seconds(max_age_secs))
            .await
            .map_err(|e| OrchError::from_external("session cleanup", &e))
    }

    pub fn active_manager(&self) -> &Arc<ActiveSessionManager> {
        &self.active
    }

    /// Exposed for the `workspace` tool, which lists and deletes workspaces
    /// directly against the store rather than through a session-shaped
    /// operation.
    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Enumerates all projects, used by the relay's `project_list` RPC
    /// method.
    pub async fn list_projects(&self) -> Result<Vec<crate::project::Project>, OrchError> {
        self.projects.list().await.map_err(|e| OrchError::from_external("project list", &e))
    }

    /// Drives a single agent turn to completion without registering an
    /// `ActiveSession` or persisting a `Session` row — used by the relay's
    /// `session_message` child-of-child path, whose own lifecycle
    /// bookkeeping lives entirely in `relay::RelaySocketHandler`. Returns
    /// the final response text.
    pub async fn drive_relay_child(
        &self,
        project_id: &str,
        workspace_id: &str,
        depth: u32,
        prompt: &str,
    ) -> Result<String, OrchError> {
        let project = self.require_project(project_id).await?;
        let container_name = format!("{}-{workspace_id}", project.id);
        ensure_running(self.containers.as_ref(), &container_name)
            .await
            .map_err(|e| OrchError::from_external("container ensure_running", &e))?;

        let exec_request = ExecuteRequest {
            prompt: prompt.to_string(),
            container_id: container_name,
            working_dir: format!("/workspace/{workspace_id}"),
            project_id: project.id.clone(),
            depth,
            streaming_jsonrpc: true,
            resume_runtime_session_id: None,
            model: None,
            autonomy_level: None,
            reasoning_level: None,
            tools_allowed: None,
            tools_disallowed: None,
            append_system_prompt: None,
        };
        let mut executor = self
            .agent_runtime
            .execute_streaming(exec_request)
            .await
            .map_err(|e| OrchError::from_external("agent execute", &e))?;

        let result = loop {
            match executor.next_event().await {
                Some(RuntimeEvent::Completion { final_text }) => break Ok(final_text),
                Some(_) => continue,
                None => break Err(OrchError::Internal("child turn ended without completion".into())),
            }
        };
        let _ = executor.close().await;
        result
    }
}
