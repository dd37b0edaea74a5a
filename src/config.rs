use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Project-local directory holding the store, lock, log and worktrees.
pub const STATE_DIR: &str = ".ensemble";

const DEFAULT_MAX_AGENTS: usize = 4;
const DEFAULT_MAX_COMPLETION_RETRIES: u32 = 2;
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_BIND: &str = "127.0.0.1";
/// Any free port; the daemon publishes the one it got in its lock marker.
const DEFAULT_PORT: u16 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on concurrently running agent sessions.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Extra sessions granted to an agent whose completion marker is not yet done.
    #[serde(default = "default_max_completion_retries")]
    pub max_completion_retries: u32,
    /// Wall-clock budget for one agent session.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL on `daemon stop`.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    pub command: Option<String>,
    pub worktree_dir: Option<String>,
    pub base_branch: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_agents: DEFAULT_MAX_AGENTS,
            max_completion_retries: DEFAULT_MAX_COMPLETION_RETRIES,
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            command: None,
            worktree_dir: None,
            base_branch: None,
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    pub fn state_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(STATE_DIR)
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("config.toml")
    }

    pub fn store_path(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("state.db")
    }

    pub fn lock_path(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("daemon.lock")
    }

    pub fn log_path(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("daemon.log")
    }

    pub fn worktrees_dir(&self, repo_root: &Path) -> PathBuf {
        match &self.worktree_dir {
            Some(dir) => {
                let expanded = expand_tilde(dir);
                if expanded.is_absolute() {
                    expanded
                } else {
                    repo_root.join(expanded)
                }
            }
            None => Self::state_dir(repo_root).join("worktrees"),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = Self::config_path(repo_root);
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, repo_root: &Path) -> Result<()> {
        let state_dir = Self::state_dir(repo_root);
        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)?;
        }
        let path = Self::config_path(repo_root);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(Error::Validation("max_agents must be at least 1".into()));
        }
        if self.agent_timeout_secs == 0 {
            return Err(Error::Validation(
                "agent_timeout_secs must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn ensure_dirs(&self, repo_root: &Path) -> Result<()> {
        for dir in [Self::state_dir(repo_root), self.worktrees_dir(repo_root)] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        if !Self::config_path(repo_root).exists() {
            self.save(repo_root)?;
        }
        Ok(())
    }
}

fn default_max_agents() -> usize {
    DEFAULT_MAX_AGENTS
}

fn default_max_completion_retries() -> u32 {
    DEFAULT_MAX_COMPLETION_RETRIES
}

fn default_agent_timeout_secs() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_stop_grace_secs() -> u64 {
    DEFAULT_STOP_GRACE_SECS
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
