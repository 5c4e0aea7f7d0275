//! `OrchestratorConfig` loading.
//!
//! Follows a CLI/env > TOML file > built-in default priority chain, plus a
//! per-platform `default_data_dir` resolution.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_PORT: u16 = 4900;
const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 32;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_CALLER_TOOL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SOCKET_WAIT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SCHEDULE_TARGET_DEADLINE_SECS: u64 = 300;

#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    max_active_sessions: Option<usize>,
    idle_timeout_secs: Option<u64>,
    caller_tool_timeout_secs: Option<u64>,
    socket_wait_timeout_secs: Option<u64>,
    schedule_target_deadline_secs: Option<u64>,
    relay_socket_dir: Option<PathBuf>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub log: String,
    pub max_active_sessions: usize,
    pub idle_timeout_secs: u64,
    /// Fixed at 60s; still configurable for tests.
    pub caller_tool_timeout_secs: u64,
    /// Bounded wait for a project's relay socket to appear.
    pub socket_wait_timeout_secs: u64,
    /// Per-execution deadline for the schedule runner (~5 minutes).
    pub schedule_target_deadline_secs: u64,
    pub relay_socket_dir: PathBuf,
}

pub struct ConfigArgs {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
    pub max_active_sessions: Option<usize>,
}

impl OrchestratorConfig {
    pub fn new(args: ConfigArgs) -> Self {
        let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = args.port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = args.log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_active_sessions = args
            .max_active_sessions
            .or(toml.max_active_sessions)
            .unwrap_or(DEFAULT_MAX_ACTIVE_SESSIONS);
        let idle_timeout_secs = toml.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let caller_tool_timeout_secs = toml
            .caller_tool_timeout_secs
            .unwrap_or(DEFAULT_CALLER_TOOL_TIMEOUT_SECS);
        let socket_wait_timeout_secs = toml
            .socket_wait_timeout_secs
            .unwrap_or(DEFAULT_SOCKET_WAIT_TIMEOUT_SECS);
        let schedule_target_deadline_secs = toml
            .schedule_target_deadline_secs
            .unwrap_or(DEFAULT_SCHEDULE_TARGET_DEADLINE_SECS);
        let relay_socket_dir = toml
            .relay_socket_dir
            .unwrap_or_else(|| data_dir.join("relay"));

        Self {
            data_dir,
            port,
            log,
            max_active_sessions,
            idle_timeout_secs,
            caller_tool_timeout_secs,
            socket_wait_timeout_secs,
            schedule_target_deadline_secs,
            relay_socket_dir,
        }
    }

    /// Path of the per-project relay socket ("Socket path: one per
    /// project").
    pub fn project_socket_path(&self, project_id: &str) -> PathBuf {
        self.relay_socket_dir.join(format!("{project_id}.sock"))
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("oubliette");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("oubliette");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("oubliette");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("oubliette");
        }
    }
    PathBuf::from(".oubliette")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_args_override_toml_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig::new(ConfigArgs {
            port: Some(9999),
            data_dir: Some(dir.path().to_path_buf()),
            log: None,
            max_active_sessions: None,
        });
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.max_active_sessions, DEFAULT_MAX_ACTIVE_SESSIONS);
        assert_eq!(cfg.caller_tool_timeout_secs, 60);
    }

    #[test]
    fn project_socket_path_is_nested_under_relay_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig::new(ConfigArgs {
            port: None,
            data_dir: Some(dir.path().to_path_buf()),
            log: None,
            max_active_sessions: None,
        });
        let path = cfg.project_socket_path("proj-1");
        assert!(path.ends_with("proj-1.sock"));
        assert!(path.starts_with(&cfg.relay_socket_dir));
    }
}
