//! Single-instance lock marker.
//!
//! `.ensemble/daemon.lock` holds the running daemon's pid and HTTP address
//! as JSON. It is created exclusively, so two daemons racing for the same
//! repository cannot both win. A marker whose pid is gone is stale and is
//! replaced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub bind: String,
    /// Port the API listens on; 0 until the listener is bound.
    pub port: u16,
}

impl LockInfo {
    pub fn current(bind: &str, port: u16) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            bind: bind.to_string(),
            port,
        }
    }

    pub fn is_process_alive(&self) -> bool {
        is_process_running(self.pid)
    }

    pub fn is_listening(&self) -> bool {
        self.port != 0
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.bind, self.port)
    }
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

/// Read the marker. A missing file is `None`; an unreadable one is
/// treated as stale and also `None`.
pub fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable lock marker");
                Ok(None)
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The marker of a live daemon, removing a stale one on the way.
pub fn live_lock(path: &Path) -> Result<Option<LockInfo>> {
    match read_lock(path)? {
        Some(info) if info.is_process_alive() => Ok(Some(info)),
        Some(info) => {
            info!(old_pid = info.pid, "removing stale lock marker");
            remove_lock(path)?;
            Ok(None)
        }
        None if path.exists() => {
            remove_lock(path)?;
            Ok(None)
        }
        None => Ok(None),
    }
}

fn remove_lock(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Take the lock for this process.
///
/// # Errors
/// [`Error::DaemonAlreadyRunning`] when a live daemon holds it.
pub fn acquire(path: &Path, info: LockInfo) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Second attempt only after clearing a stale marker.
    for _ in 0..2 {
        if let Some(existing) = live_lock(path)? {
            return Err(Error::DaemonAlreadyRunning { pid: existing.pid });
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
                file.sync_all()?;
                debug!(pid = info.pid, path = %path.display(), "lock acquired");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    pid: info.pid,
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let pid = read_lock(path)?.map(|l| l.pid).unwrap_or(0);
    Err(Error::DaemonAlreadyRunning { pid })
}

/// Removes the marker on drop, if it still names this process.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the marker's contents, e.g. once the listener's port is
    /// known. The swap is a rename, so the file never goes missing.
    pub fn publish(&self, info: &LockInfo) -> Result<()> {
        if info.pid != self.pid {
            return Err(Error::InvalidState(format!(
                "lock held by pid {} cannot publish pid {}",
                self.pid, info.pid
            )));
        }
        let staged = self.path.with_extension("lock.tmp");
        fs::write(&staged, serde_json::to_string_pretty(info)?)?;
        fs::rename(&staged, &self.path)?;
        debug!(port = info.port, path = %self.path.display(), "lock updated");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let ours = matches!(read_lock(&self.path), Ok(Some(info)) if info.pid == self.pid);
        if !ours {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}
