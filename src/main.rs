//! CLI entry point: `serve` (default) starts the
//! server façade; `doctor` checks the prerequisites a production operator
//! would want confirmed before trusting a `serve` run.
//!
//! Uses a `clap` derive shape, a `setup_logging` stdout/rolling-file split
//! via `tracing-appender`, and a `run_server` startup sequence (config →
//! stores → long-lived components → listener) for this orchestrator's own
//! component graph.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use oubliette::config::{ConfigArgs, OrchestratorConfig};
use oubliette::container::{ContainerConfig, ContainerRuntime, ExecOutput};
use oubliette::project::InMemoryProjectRegistry;
use oubliette::relay::RelaySocketHandler;
use oubliette::schedule::{ScheduleRunner, ScheduleStore};
use oubliette::session::{
    ActiveSessionManager, RelayConnector, SessionController, SessionStore, WorkspaceStore,
};
use oubliette::token::TokenStore;
use oubliette::tools;
use oubliette::{agent_runtime::StubAgentRuntime, server::Server, Orchestrator};

#[derive(Parser)]
#[command(name = "oubliette", about = "Oubliette agent orchestrator", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Tool-dispatch WebSocket server port
    #[arg(long, env = "OUBLIETTE_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database, relay sockets, and config.toml
    #[arg(long, env = "OUBLIETTE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "OUBLIETTE_LOG")]
    log: Option<String>,

    /// Maximum concurrently active sessions
    #[arg(long, env = "OUBLIETTE_MAX_ACTIVE_SESSIONS")]
    max_active_sessions: Option<usize>,

    /// Write logs to this file path (rotated daily) in addition to stdout
    #[arg(long, env = "OUBLIETTE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator (default when no subcommand is given).
    Serve,
    /// Check prerequisites: container runtime reachability, data directory
    /// writability, database migrations.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.log_file.as_deref());

    let config = Arc::new(OrchestratorConfig::new(ConfigArgs {
        port: args.port,
        data_dir: args.data_dir,
        log: args.log,
        max_active_sessions: args.max_active_sessions,
    }));

    match args.command {
        Some(Command::Doctor) => run_doctor(&config).await,
        None | Some(Command::Serve) => run_serve(config).await,
    }
}

/// Installs the global tracing subscriber. With `log_file` set, logs go to
/// both stdout and a daily-rolling file; the returned guard must stay alive
/// for the process lifetime or the file writer is dropped mid-run. Falls
/// back to stdout-only if the log directory cannot be created.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("oubliette.log"));
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();
    Some(guard)
}

/// Shells out to the `docker` CLI for every container operation: one
/// `tokio::process::Command` invocation per call, full output capture, and
/// exit-status mapped to `Result`.
struct DockerCliContainerRuntime {
    binary: String,
}

impl DockerCliContainerRuntime {
    fn new() -> Self {
        let binary = std::env::var("OUBLIETTE_CONTAINER_BINARY").unwrap_or_else(|_| "docker".to_string());
        Self { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{} {}`", self.binary, args.join(" ")))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if !output.status.success() {
            anyhow::bail!(
                "`{} {}` failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliContainerRuntime {
    async fn create(&self, config: ContainerConfig) -> Result<()> {
        let mount = format!("{}:/run/oubliette/relay.sock", config.relay_socket_host_path);
        let mut args = vec!["create".to_string(), "--name".to_string(), config.name.clone()];
        for (host, container) in &config.mounts {
            args.push("-v".to_string());
            args.push(format!("{host}:{container}"));
        }
        args.push("-v".to_string());
        args.push(mount);
        args.push(config.image.clone());
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&borrowed).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run_checked(&["start", name]).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run_checked(&["stop", name]).await
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.run_checked(&["rm", "-f", name]).await
        } else {
            self.run_checked(&["rm", name]).await
        }
    }

    async fn status(&self, name: &str) -> Result<bool> {
        let output = self.run(&["inspect", "-f", "{{.State.Running}}", name]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn exec(&self, name: &str, cmd: &[String], cwd: &str) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), "-w".to_string(), cwd.to_string(), name.to_string()];
        args.extend(cmd.iter().cloned());
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&borrowed).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let output = self.run(&["logs", "--tail", &tail, name]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.run(&["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.run_checked(&["pull", image]).await
    }

    async fn ping(&self) -> Result<()> {
        self.run_checked(&["version", "--format", "{{.Server.Version}}"]).await
    }
}

/// Breaks the construction cycle between `SessionController` (which needs a
/// `RelayConnector` handle up front) and `RelaySocketHandler` (whose own
/// constructor needs the already-built `SessionController`): the controller
/// is built against this shim, and the real handler is slotted in with
/// `bind` once it exists, before either is ever asked to serve a session.
#[derive(Default)]
struct DeferredRelayConnector {
    inner: tokio::sync::OnceCell<Arc<RelaySocketHandler>>,
}

impl DeferredRelayConnector {
    fn bind(&self, handler: Arc<RelaySocketHandler>) {
        self.inner.set(handler).ok();
    }
}

#[async_trait]
impl RelayConnector for DeferredRelayConnector {
    async fn connect_upstream(&self, session_id: &str, project_id: &str, depth: u32) -> Result<()> {
        let handler = self
            .inner
            .get()
            .ok_or_else(|| anyhow::anyhow!("relay handler not yet bound"))?;
        handler.connect_upstream(session_id, project_id, depth).await
    }
}

async fn build_orchestrator(config: Arc<OrchestratorConfig>) -> Result<Orchestrator> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;
    std::fs::create_dir_all(&config.relay_socket_dir)
        .with_context(|| format!("failed to create relay socket directory {}", config.relay_socket_dir.display()))?;

    let db_path = config.data_dir.join("oubliette.db");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    SessionStore::migrate(&pool).await.context("session store migration failed")?;
    WorkspaceStore::migrate(&pool).await.context("workspace store migration failed")?;
    TokenStore::migrate(&pool).await.context("token store migration failed")?;
    ScheduleStore::migrate(&pool).await.context("schedule store migration failed")?;
    info!(db = %db_path.display(), "database migrated");

    let projects: Arc<dyn oubliette::project::ProjectRegistry> = Arc::new(InMemoryProjectRegistry::new());
    let containers: Arc<dyn ContainerRuntime> = Arc::new(DockerCliContainerRuntime::new());
    let agent_runtime = Arc::new(StubAgentRuntime);
    let active = Arc::new(ActiveSessionManager::new(config.max_active_sessions, config.idle_timeout_secs));
    let tokens = TokenStore::new(pool.clone());

    let relay_connector = Arc::new(DeferredRelayConnector::default());
    let controller = Arc::new(SessionController::new(
        projects.clone(),
        containers.clone(),
        agent_runtime,
        SessionStore::new(pool.clone()),
        WorkspaceStore::new(pool.clone()),
        active,
        relay_connector.clone(),
    ));

    let schedule_runner = Arc::new(ScheduleRunner::new(
        ScheduleStore::new(pool.clone()),
        controller.clone(),
        std::time::Duration::from_secs(config.schedule_target_deadline_secs),
    ));

    let tool_registry = Arc::new(tools::build_registry(
        projects.clone(),
        containers.clone(),
        controller.clone(),
        tokens.clone(),
        schedule_runner.clone(),
        config.max_active_sessions,
        config.idle_timeout_secs,
    ));

    let relay = Arc::new(RelaySocketHandler::new(
        config.clone(),
        controller.clone(),
        tokens.clone(),
        tool_registry.clone(),
    ));
    relay_connector.bind(relay.clone());

    Ok(Orchestrator {
        config,
        projects,
        containers,
        controller,
        relay,
        schedule_runner,
        tokens,
        tool_registry,
        started_at: std::time::Instant::now(),
    })
}

async fn run_serve(config: Arc<OrchestratorConfig>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "oubliette starting");
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        max_active_sessions = config.max_active_sessions,
        "config loaded"
    );

    let orchestrator = build_orchestrator(config).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    Server::new(orchestrator, shutdown).run().await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_doctor(config: &Arc<OrchestratorConfig>) -> Result<()> {
    let mut failed = false;

    let probe = config.data_dir.join(".oubliette-doctor-probe");
    std::fs::create_dir_all(&config.data_dir).ok();
    let data_dir_ok = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    println!(
        "data directory ({}): {}",
        config.data_dir.display(),
        if data_dir_ok { "writable" } else { "NOT WRITABLE" }
    );
    failed |= !data_dir_ok;

    let containers = DockerCliContainerRuntime::new();
    let container_ok = containers.ping().await.is_ok();
    println!(
        "container runtime ({}): {}",
        containers.binary,
        if container_ok { "reachable" } else { "NOT REACHABLE" }
    );
    failed |= !container_ok;

    let db_path = config.data_dir.join("oubliette.db");
    let db_ok = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await
        .is_ok();
    println!("database ({}): {}", db_path.display(), if db_ok { "reachable" } else { "NOT REACHABLE" });
    failed |= !db_ok;

    if failed {
        warn!("doctor checks failed");
        std::process::exit(1);
    }
    println!("all checks passed");
    Ok(())
}
