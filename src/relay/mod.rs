//! Relay Socket Handler: per-project pairing server, connect-session,
//! request loop, async child-of-child spawn, caller-tool round-trip.
//!
//! The handler runs one `UnixListener` per project. Both roles connect to
//! it as clients: the orchestrator dials in as "upstream" (carrying
//! `session_id`/`project_id`/`depth` in its header) before the agent
//! executable starts; the in-container MCP client later dials in as
//! "downstream" (an anonymous connection). The accept loop pairs the next
//! waiting upstream with the next waiting downstream in FIFO order and
//! bridges their bytes with `copy_bidirectional` — so the orchestrator's
//! own dialed connection ends up end-to-end connected to the agent
//! process despite the two sides never sharing a file descriptor directly.
//! A request loop then runs on the orchestrator's own dialed connection,
//! reading JSON-RPC requests the agent sends and replying.

pub mod wire;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::access::{self, Access};
use crate::config::OrchestratorConfig;
use crate::container::wait_for_path;
use crate::session::controller::{RelayConnector, SessionController};
use crate::token::TokenStore;
use crate::tools::registry::ToolRegistry;

use wire::{ConnectHeader, RpcNotification, RpcRequest, RpcResponse, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};

/// A JSON-RPC method handler's result: `Ok(params)` on success, or
/// `Err((code, message))` to render as an RPC error.
type RpcResult = Result<Value, (i64, String)>;

#[derive(Default)]
struct ProjectPairing {
    waiting_upstream: VecDeque<UnixStream>,
    waiting_downstream: VecDeque<UnixStream>,
}

/// Running/terminal state of one relay-spawned child. No
/// `Session` row is persisted for these — they are driven entirely through
/// `SessionController::drive_relay_child` and polled via `session_events`.
enum ChildState {
    Running,
    Completed(String),
    Failed(String),
}

/// Enough context to spawn a grandchild without re-entering the
/// `ActiveSession` store, and to answer a `session_events` poll: project,
/// workspace, and depth, plus the running/completed state of the child's
/// own executor.
#[derive(Clone)]
struct ChildRecord {
    project_id: String,
    workspace_id: String,
    depth: u32,
    state: Arc<Mutex<ChildState>>,
}

pub struct RelaySocketHandler {
    config: Arc<OrchestratorConfig>,
    controller: Arc<SessionController>,
    tokens: TokenStore,
    tool_registry: Arc<ToolRegistry>,
    pairing: Mutex<HashMap<String, ProjectPairing>>,
    listening: Mutex<HashSet<String>>,
    children: Mutex<HashMap<String, ChildRecord>>,
    child_counter: AtomicU64,
}

impl RelaySocketHandler {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        controller: Arc<SessionController>,
        tokens: TokenStore,
        tool_registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            controller,
            tokens,
            tool_registry,
            pairing: Mutex::new(HashMap::new()),
            listening: Mutex::new(HashSet::new()),
            children: Mutex::new(HashMap::new()),
            child_counter: AtomicU64::new(0),
        }
    }

    /// Starts the per-project accept loop the first time a project's
    /// socket is needed. Idempotent.
    async fn ensure_listener(self: &Arc<Self>, project_id: &str) -> anyhow::Result<()> {
        let mut listening = self.listening.lock().await;
        if listening.contains(project_id) {
            return Ok(());
        }
        let path = self.config.project_socket_path(project_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if path.exists() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        let listener = UnixListener::bind(&path)?;
        listening.insert(project_id.to_string());
        drop(listening);

        let handler = Arc::clone(self);
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&handler);
                        let project_id = project_id.clone();
                        tokio::spawn(async move { handler.handle_accepted(project_id, stream).await });
                    }
                    Err(e) => {
                        tracing::warn!(project_id = %project_id, err = %e, "relay socket accept failed, stopping listener");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn read_header_line(stream: &mut UnixStream) -> std::io::Result<String> {
        // Deliberately reads one byte at a time rather than wrapping the
        // stream in a `BufReader` and calling `into_inner` afterward:
        // the latter can silently discard bytes the agent wrote right
        // after its header line if a single underlying read pulled in
        // both the header and the start of its first request.
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if stream.read(&mut byte).await? == 0 {
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn handle_accepted(self: Arc<Self>, project_id: String, mut stream: UnixStream) {
        let line = match Self::read_header_line(&mut stream).await {
            Ok(l) if !l.is_empty() => l,
            _ => return,
        };
        let header = match ConnectHeader::parse(&line) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(project_id = %project_id, err = %e, "rejected relay connection with a bad header");
                return;
            }
        };

        let mut pairing = self.pairing.lock().await;
        let entry = pairing.entry(project_id).or_default();
        match header {
            ConnectHeader::Upstream { .. } => match entry.waiting_downstream.pop_front() {
                Some(partner) => {
                    drop(pairing);
                    Self::bridge(stream, partner);
                }
                None => entry.waiting_upstream.push_back(stream),
            },
            ConnectHeader::Downstream => match entry.waiting_upstream.pop_front() {
                Some(partner) => {
                    drop(pairing);
                    Self::bridge(partner, stream);
                }
                None => entry.waiting_downstream.push_back(stream),
            },
        }
    }

    fn bridge(mut upstream: UnixStream, mut downstream: UnixStream) {
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut upstream, &mut downstream).await;
        });
    }

    /// Dials a new upstream connection for `session_id` and spawns its
    /// request loop. Also used to dial nested child-of-child upstreams
    /// before their executor starts, so the in-container client always
    /// finds a waiting upstream when it connects as downstream.
    async fn dial_and_serve(
        self: Arc<Self>,
        session_id: String,
        project_id: String,
        depth: u32,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.ensure_listener(&project_id).await?;
        let path = self.config.project_socket_path(&project_id);
        wait_for_path(&path, Duration::from_secs(self.config.socket_wait_timeout_secs)).await?;
        let mut stream = UnixStream::connect(&path).await?;
        let header = ConnectHeader::Upstream { session_id: session_id.clone(), project_id: project_id.clone(), depth };
        stream.write_all(header.render().as_bytes()).await?;
        tracing::info!(session_id = %session_id, project_id = %project_id, role = "upstream", "relay connection paired");

        let handler = self;
        tokio::spawn(async move { handler.run_request_loop(stream, session_id, project_id, depth, cancel).await });
        Ok(())
    }

    async fn write_line(write_half: &mut (impl AsyncWrite + Unpin), value: &impl serde::Serialize) -> std::io::Result<()> {
        let mut line = serde_json::to_string(value).unwrap_or_default();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;
        write_half.flush().await
    }

    /// The request loop proper: reads newline-delimited JSON-RPC requests
    /// the agent sends over the now-bridged connection, dispatches by
    /// method, and writes back one response per request, in request order.
    async fn run_request_loop(
        self: Arc<Self>,
        stream: UnixStream,
        session_id: String,
        project_id: String,
        depth: u32,
        cancel: CancellationToken,
    ) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        if let Some(active) = self.controller.active_manager().get(&session_id).await {
            if let Some(cfg) = active.caller_tools().await {
                let notification = RpcNotification::new(
                    "caller_tools_config",
                    json!({ "caller_id": cfg.caller_id, "tools": cfg.tool_defs }),
                );
                let _ = Self::write_line(&mut write_half, &notification).await;
            }
        }

        loop {
            let mut line = String::new();
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let request: RpcRequest = match serde_json::from_str(trimmed) {
                                Ok(r) => r,
                                Err(e) => {
                                    tracing::warn!(session_id = %session_id, err = %e, "malformed relay request line");
                                    continue;
                                }
                            };
                            let response = self.dispatch(&session_id, &project_id, depth, request).await;
                            if Self::write_line(&mut write_half, &response).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        if let Some(active) = self.controller.active_manager().get(&session_id).await {
            if !active.status().await.is_terminal() {
                active.close().await;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, session_id: &str, project_id: &str, depth: u32, request: RpcRequest) -> RpcResponse {
        let id = request.id.unwrap_or(Value::Null);
        let result: RpcResult = match request.method.as_str() {
            "session_message" => self.handle_session_message(session_id, project_id, depth, request.params).await,
            "session_events" => self.handle_session_events(request.params).await,
            "project_list" => self.handle_project_list().await,
            "caller_tool" => self.handle_caller_tool(session_id, request.params).await,
            "oubliette_tools" => self.handle_oubliette_tools(request.params).await,
            "oubliette_call_tool" => self.handle_oubliette_call_tool(request.params).await,
            other => Err((METHOD_NOT_FOUND, format!("unknown method: {other}"))),
        };
        match result {
            Ok(value) => RpcResponse::ok(id, value),
            Err((code, message)) => RpcResponse::err(id, code, message),
        }
    }

    /// `session_message`: spawns an async child of the
    /// current session (or of `params.session_id` if given) and returns
    /// immediately; the caller polls completion via `session_events`.
    async fn handle_session_message(
        self: &Arc<Self>,
        current_session_id: &str,
        current_project_id: &str,
        current_depth: u32,
        params: Value,
    ) -> RpcResult {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "missing message".to_string()))?
            .to_string();
        let parent_id = params.get("session_id").and_then(Value::as_str).unwrap_or(current_session_id).to_string();

        let (project_id, workspace_id, parent_depth) = if let Some(record) = self.children.lock().await.get(&parent_id) {
            (record.project_id.clone(), record.workspace_id.clone(), record.depth)
        } else if parent_id == current_session_id {
            match self.controller.get(current_session_id).await {
                Ok(session) => (session.project_id, session.workspace_id, current_depth),
                Err(_) => (current_project_id.to_string(), String::new(), current_depth),
            }
        } else {
            match self.controller.get(&parent_id).await {
                Ok(session) => (session.project_id, session.workspace_id, session.depth),
                Err(_) => return Err((INTERNAL_ERROR, format!("parent session {parent_id} not found"))),
            }
        };

        let project = self
            .controller
            .project(&project_id)
            .await
            .map_err(|e| (INTERNAL_ERROR, e.to_string()))?;
        let child_depth = parent_depth + 1;
        if child_depth > project.recursion_config.max_depth {
            return Err((
                INTERNAL_ERROR,
                format!("Max recursion depth {} exceeded at depth {child_depth}", project.recursion_config.max_depth),
            ));
        }

        let counter = self.child_counter.fetch_add(1, Ordering::SeqCst);
        let child_id = format!("child_{parent_id}_{counter}");
        self.children.lock().await.insert(
            child_id.clone(),
            ChildRecord {
                project_id: project_id.clone(),
                workspace_id: workspace_id.clone(),
                depth: child_depth,
                state: Arc::new(Mutex::new(ChildState::Running)),
            },
        );

        // Dial-before-exec ("Socket-pairing race"): the upstream
        // must exist before the child's in-container client dials in.
        let cancel = CancellationToken::new();
        Arc::clone(self)
            .dial_and_serve(child_id.clone(), project_id.clone(), child_depth, cancel.clone())
            .await
            .map_err(|e| (INTERNAL_ERROR, format!("failed to dial child upstream: {e}")))?;

        let handler = Arc::clone(self);
        let child_id_for_task = child_id.clone();
        tokio::spawn(async move {
            let result = handler.controller.drive_relay_child(&project_id, &workspace_id, child_depth, &message).await;
            if let Some(record) = handler.children.lock().await.get(&child_id_for_task) {
                let mut state = record.state.lock().await;
                *state = match result {
                    Ok(text) => ChildState::Completed(text),
                    Err(e) => ChildState::Failed(e.to_string()),
                };
            }
            cancel.cancel();
        });

        Ok(json!({ "session_id": child_id, "spawned": true }))
    }

    /// `session_events`: polls a previously spawned child.
    async fn handle_session_events(self: &Arc<Self>, params: Value) -> RpcResult {
        let session_id = params
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "missing session_id".to_string()))?;
        let record = self
            .children
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or((INVALID_PARAMS, format!("unknown child session {session_id}")))?;
        let state = record.state.lock().await;
        let (status, result, error) = match &*state {
            ChildState::Running => ("running", None, None),
            ChildState::Completed(text) => ("completed", Some(text.clone()), None),
            ChildState::Failed(err) => ("failed", None, Some(err.clone())),
        };
        Ok(json!({
            "session_id": session_id,
            "status": status,
            "completed": matches!(&*state, ChildState::Completed(_)),
            "failed": matches!(&*state, ChildState::Failed(_)),
            "result": result,
            "error": error,
        }))
    }

    /// `project_list`: minimal passthrough for enumeration.
    async fn handle_project_list(self: &Arc<Self>) -> RpcResult {
        let projects = self.controller.list_projects().await.map_err(|e| (INTERNAL_ERROR, e.to_string()))?;
        let listed: Vec<Value> =
            projects.into_iter().map(|p| json!({ "id": p.id, "display_name": p.display_name })).collect();
        Ok(json!({ "projects": listed }))
    }

    /// `caller_tool`: round-trips a tool call to whatever
    /// external client is bound to this session's notification channel.
    async fn handle_caller_tool(self: &Arc<Self>, current_session_id: &str, params: Value) -> RpcResult {
        let tool = params.get("tool").and_then(Value::as_str).ok_or((INVALID_PARAMS, "missing tool".to_string()))?.to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let active = self
            .controller
            .active_manager()
            .get(current_session_id)
            .await
            .ok_or((INTERNAL_ERROR, format!("session {current_session_id} is not active")))?;
        let caller_tools = active
            .caller_tools()
            .await
            .ok_or((INTERNAL_ERROR, "no caller tools configured for this session".to_string()))?;
        let mcp_client = active
            .mcp_client()
            .await
            .ok_or((INTERNAL_ERROR, "no caller bound to receive tool requests".to_string()))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let rx = active.register_caller_request(request_id.clone()).await;
        mcp_client.broadcast(
            "caller_tool_request",
            json!({
                "session_id": current_session_id,
                "request_id": request_id,
                "tool": tool,
                "arguments": arguments,
                "caller_id": caller_tools.caller_id,
            }),
        );

        let timeout = Duration::from_secs(self.config.caller_tool_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(error) => Err((INTERNAL_ERROR, error.as_str().unwrap_or("caller tool error").to_string())),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err((INTERNAL_ERROR, format!("caller tool request {request_id} was cancelled"))),
            Err(_) => {
                active.cancel_caller_request(&request_id).await;
                Err((INTERNAL_ERROR, format!("caller tool request {request_id} timed out")))
            }
        }
    }

    async fn authenticate(&self, params: &Value) -> Result<access::Scope, (i64, String)> {
        let api_key =
            params.get("api_key").and_then(Value::as_str).ok_or((INVALID_PARAMS, "missing api_key".to_string()))?;
        let token = self
            .tokens
            .get(api_key)
            .await
            .map_err(|e| (INTERNAL_ERROR, e.to_string()))?
            .ok_or((INTERNAL_ERROR, "invalid api_key".to_string()))?;
        let _ = self.tokens.touch(&token.id).await;
        token.parsed_scope.map_err(|e| (INTERNAL_ERROR, e.to_string()))
    }

    /// `oubliette_tools`: the scoped tool catalogue for an
    /// agent carrying an issued API key.
    async fn handle_oubliette_tools(self: &Arc<Self>, params: Value) -> RpcResult {
        let scope = self.authenticate(&params).await?;
        let defs: Vec<Value> = self
            .tool_registry
            .defs()
            .into_iter()
            .filter(|def| access::allows(&scope, def.target, Access::Read, None))
            .map(|def| json!({ "name": def.name, "description": def.description, "actions": def.actions }))
            .collect();
        Ok(json!({ "tools": defs }))
    }

    /// `oubliette_call_tool`: invokes a named tool through
    /// the same gate the external HTTP path uses.
    async fn handle_oubliette_call_tool(self: &Arc<Self>, params: Value) -> RpcResult {
        let scope = self.authenticate(&params).await?;
        let name = params.get("name").and_then(Value::as_str).ok_or((INVALID_PARAMS, "missing name".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let result = self.tool_registry.call(name, arguments, &scope).await;
        Ok(serde_json::to_value(result).unwrap_or(Value::Null))
    }

    /// Closes every paired/dialed connection this handler owns. Dropping
    /// the listeners stops new pairings; in-flight request loops observe
    /// their session's `ActiveSession` closing and exit on next read.
    pub async fn shutdown(&self) {
        self.pairing.lock().await.clear();
    }
}

#[async_trait]
impl RelayConnector for Arc<RelaySocketHandler> {
    async fn connect_upstream(&self, session_id: &str, project_id: &str, depth: u32) -> anyhow::Result<()> {
        Arc::clone(self)
            .dial_and_serve(session_id.to_string(), project_id.to_string(), depth, CancellationToken::new())
            .await
    }
}
