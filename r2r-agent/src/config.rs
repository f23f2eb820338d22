//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2r_core::{Role, SessionConfig};

/// Agent configuration. File: ~/.config/r2r/config.toml or /etc/r2r/config.toml.
/// Env overrides: R2R_AGENT_ID, R2R_LISTEN_PORT, R2R_HEARTBEAT_SECS, R2R_NEGOTIATION_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `source_id` of everything this agent sends.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// TCP port for `listen` (default 8080).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Heartbeat interval for `connect` (default 15 s).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Idle time before an open negotiation expires (default 60 s).
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_max_frame_errors")]
    pub max_frame_errors: u32,
}

fn default_agent_id() -> String {
    "robot_1".to_string()
}
fn default_listen_port() -> u16 {
    8080
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_negotiation_timeout_secs() -> u64 {
    60
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_frame_len() -> usize {
    r2r_core::wire::MAX_FRAME_LEN
}
fn default_max_frame_errors() -> u32 {
    r2r_core::config::DEFAULT_MAX_FRAME_ERRORS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            listen_port: default_listen_port(),
            heartbeat_secs: default_heartbeat_secs(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_frame_len: default_max_frame_len(),
            max_frame_errors: default_max_frame_errors(),
        }
    }
}

impl Config {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Session settings for one connection in the given role.
    pub fn session(&self, role: Role) -> SessionConfig {
        let mut s = SessionConfig::new(self.agent_id.clone(), role);
        s.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        s.max_frame_len = self.max_frame_len;
        s.max_frame_errors = self.max_frame_errors;
        s
    }
}

/// Load config: merge default, then config file (explicit path or first default path present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => parse_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("R2R_AGENT_ID") {
        if !s.is_empty() {
            c.agent_id = s;
        }
    }
    if let Some(s) = var("R2R_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = var("R2R_HEARTBEAT_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.heartbeat_secs = n;
        }
    }
    if let Some(s) = var("R2R_NEGOTIATION_TIMEOUT_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.negotiation_timeout_secs = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/r2r/config.toml"));
    }
    out.push(PathBuf::from("/etc/r2r/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    toml::from_str::<Config>(&s).map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))
}
