//! Tool Registry & Dispatch: declares every tool in the orchestrator's
//! surface and wires each to its handler.
//!
//! `build_registry` is the one place that maps the tool table (name,
//! actions, target, access) onto concrete `ToolHandler`s — adding a tool
//! means adding one `register` call here, never touching the dispatch loop
//! in `registry.rs`.

pub mod args;
pub mod container;
pub mod project;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod token;
pub mod workspace;

use std::sync::Arc;

use crate::access::{Access, Target};
use crate::container::ContainerRuntime;
use crate::project::ProjectRegistry;
use crate::schedule::ScheduleRunner;
use crate::session::controller::SessionController;
use crate::token::TokenStore;

use registry::{ToolDef, ToolRegistry};

/// Builds the full tool registry ('s authoritative table).
#[allow(clippy::too_many_arguments)]
pub fn build_registry(
    projects: Arc<dyn ProjectRegistry>,
    containers: Arc<dyn ContainerRuntime>,
    controller: Arc<SessionController>,
    tokens: TokenStore,
    schedule_runner: Arc<ScheduleRunner>,
    max_active_sessions: usize,
    idle_timeout_secs: u64,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        ToolDef {
            name: "project",
            description: "Project lifecycle: create, list, get, delete, options",
            target: Target::Global,
            access: Access::Write,
            actions: Some(&["create", "list", "get", "delete", "options"]),
        },
        Arc::new(project::ProjectTool::new(projects.clone())),
    );
    registry.register(
        ToolDef {
            name: "project_changes",
            description: "Recorded changes against a project's workspace tree",
            target: Target::Project,
            access: Access::Read,
            actions: None,
        },
        Arc::new(project::ProjectChangesTool::new(projects.clone())),
    );
    registry.register(
        ToolDef {
            name: "project_tasks",
            description: "Outstanding tasks surfaced for a project",
            target: Target::Project,
            access: Access::Read,
            actions: None,
        },
        Arc::new(project::ProjectTasksTool::new(projects.clone())),
    );

    registry.register(
        ToolDef {
            name: "container",
            description: "Container lifecycle: start, stop, logs, exec",
            target: Target::Project,
            access: Access::Write,
            actions: Some(&["start", "stop", "logs", "exec"]),
        },
        Arc::new(container::ContainerTool::new(containers.clone())),
    );
    registry.register(
        ToolDef {
            name: "container_refresh",
            description: "Pull a fresh image without restarting running containers",
            target: Target::Global,
            access: Access::Write,
            actions: None,
        },
        Arc::new(container::ContainerRefreshTool::new(containers.clone())),
    );

    registry.register(
        ToolDef {
            name: "session",
            description: "Session lifecycle: spawn, message, get, list, end, events, cleanup",
            target: Target::Project,
            access: Access::Write,
            actions: Some(&["spawn", "message", "get", "list", "end", "events", "cleanup"]),
        },
        Arc::new(session::SessionTool::new(controller.clone())),
    );
    registry.register(
        ToolDef {
            name: "caller_tool_response",
            description: "Resolve a pending caller-tool request raised by a child agent",
            target: Target::Project,
            access: Access::Write,
            actions: None,
        },
        Arc::new(session::CallerToolResponseTool::new(controller.clone())),
    );

    registry.register(
        ToolDef {
            name: "workspace",
            description: "Workspace management: list, delete",
            target: Target::Project,
            access: Access::Write,
            actions: Some(&["list", "delete"]),
        },
        Arc::new(workspace::WorkspaceTool::new(controller.clone())),
    );
    registry.register(
        ToolDef {
            name: "config_limits",
            description: "Project recursion limits and orchestrator-wide session limits",
            target: Target::Project,
            access: Access::Read,
            actions: None,
        },
        Arc::new(workspace::ConfigLimitsTool::new(projects, max_active_sessions, idle_timeout_secs)),
    );

    registry.register(
        ToolDef {
            name: "token",
            description: "API token management: create, list, revoke",
            target: Target::Global,
            access: Access::Admin,
            actions: Some(&["create", "list", "revoke"]),
        },
        Arc::new(token::TokenTool::new(tokens)),
    );

    registry.register(
        ToolDef {
            name: "schedule",
            description: "Cron schedule management: create, list, get, update, delete, trigger, history",
            target: Target::Global,
            access: Access::Write,
            actions: Some(&["create", "list", "get", "update", "delete", "trigger", "history"]),
        },
        Arc::new(schedule::ScheduleTool::new(schedule_runner)),
    );

    registry
}
