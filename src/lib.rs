pub mod access;
pub mod agent_runtime;
pub mod circuit_breaker;
pub mod config;
pub mod container;
pub mod error;
pub mod event_buffer;
pub mod ipc;
pub mod observability;
pub mod project;
pub mod relay;
pub mod retry;
pub mod schedule;
pub mod server;
pub mod session;
pub mod token;
pub mod tools;

use std::sync::Arc;

use config::OrchestratorConfig;
use container::ContainerRuntime;
use project::ProjectRegistry;
use relay::RelaySocketHandler;
use schedule::ScheduleRunner;
use session::SessionController;
use token::TokenStore;
use tools::registry::ToolRegistry;

/// Every long-lived component the server façade, the `doctor` subcommand,
/// and tests need a handle to, assembled once at startup.
#[derive(Clone)]
pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub projects: Arc<dyn ProjectRegistry>,
    pub containers: Arc<dyn ContainerRuntime>,
    pub controller: Arc<SessionController>,
    pub relay: Arc<RelaySocketHandler>,
    pub schedule_runner: Arc<ScheduleRunner>,
    pub tokens: TokenStore,
    pub tool_registry: Arc<ToolRegistry>,
    pub started_at: std::time::Instant,
}

impl Orchestrator {
    pub fn health(&self, db_ok: bool) -> observability::HealthStatus {
        observability::HealthStatus::ok(self.started_at.elapsed().as_secs(), db_ok)
    }
}
