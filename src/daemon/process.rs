//! Controlling the daemon from the CLI: start, stop, status.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::lock::{self, is_process_running, LockInfo};
use crate::api::{DaemonClient, StatusReport};
use crate::config::Config;
use crate::{Error, Result};

/// How long `start` waits for the new daemon to answer its health check.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running {
        pid: u32,
        base_url: String,
        /// `None` while the daemon holds the lock but its API is not up.
        report: Option<StatusReport>,
    },
    Stopped,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonStatus::Running { .. })
    }
}

/// Report whether a daemon serves this repository.
pub async fn status(repo_root: &Path) -> Result<DaemonStatus> {
    let Some(info) = lock::live_lock(&Config::lock_path(repo_root))? else {
        return Ok(DaemonStatus::Stopped);
    };
    let report = query(&info).await?;
    Ok(DaemonStatus::Running {
        pid: info.pid,
        base_url: info.base_url(),
        report,
    })
}

/// Ask the daemon named by `info` for its report. Only an answer carrying
/// that daemon's pid counts: the port may belong to another process.
async fn query(info: &LockInfo) -> Result<Option<StatusReport>> {
    if !info.is_listening() {
        debug!(pid = info.pid, "daemon holds the lock but is not listening yet");
        return Ok(None);
    }
    match DaemonClient::new(info.base_url())?.status().await {
        Ok(report) if report.pid == info.pid => Ok(Some(report)),
        Ok(report) => {
            warn!(
                expected = info.pid,
                answered = report.pid,
                url = %info.base_url(),
                "another daemon answers on this daemon's port"
            );
            Ok(None)
        }
        Err(e) => {
            debug!(error = %e, "daemon holds the lock but its API did not answer");
            Ok(None)
        }
    }
}

/// A client for the running daemon.
///
/// # Errors
/// [`Error::DaemonNotRunning`] when no live daemon holds the lock.
pub fn client(repo_root: &Path) -> Result<DaemonClient> {
    match lock::live_lock(&Config::lock_path(repo_root))? {
        Some(info) if info.is_listening() => DaemonClient::new(info.base_url()),
        Some(info) => Err(Error::Daemon(format!(
            "daemon (pid {}) is still starting",
            info.pid
        ))),
        None => Err(Error::DaemonNotRunning),
    }
}

/// Start a detached daemon unless one is already running, in which case
/// its status is returned and nothing is spawned.
pub async fn start(repo_root: &Path, debug: bool) -> Result<DaemonStatus> {
    let current = status(repo_root).await?;
    if current.is_running() {
        info!("daemon already running");
        return Ok(current);
    }

    let config = Config::load(repo_root)?;
    config.ensure_dirs(repo_root)?;
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ensemble"));
    let mut cmd = Command::new(exe);
    cmd.arg("daemon")
        .arg("run")
        .arg("--repo")
        .arg(repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if debug {
        cmd.arg("--debug");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach from the terminal's process group so ^C in the shell
        // does not reach the daemon.
        cmd.process_group(0);
    }
    let mut child = cmd.spawn()?;
    info!(pid = child.id(), "daemon spawned");

    // Ready once the lock names a daemon that answers as itself on the
    // port it published.
    let lock_path = Config::lock_path(repo_root);
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(info) = lock::live_lock(&lock_path)? {
            if query(&info).await?.is_some() {
                if info.pid != child.id() {
                    info!(pid = info.pid, "another start won the race");
                }
                return status(repo_root).await;
            }
        }
        if let Some(exit) = child.try_wait()? {
            return Err(Error::Daemon(format!(
                "daemon exited during startup ({exit}); see {}",
                Config::log_path(repo_root).display()
            )));
        }
        tokio::time::sleep(POLL).await;
    }
    Err(Error::Timeout(STARTUP_TIMEOUT))
}

/// SIGTERM, wait out the grace period, then SIGKILL. Returns `false` when
/// no daemon was running.
pub async fn stop(repo_root: &Path, grace: Duration) -> Result<bool> {
    let lock_path = Config::lock_path(repo_root);
    let Some(info) = lock::live_lock(&lock_path)? else {
        return Ok(false);
    };

    info!(pid = info.pid, "sending SIGTERM to daemon");
    signal(info.pid, false)?;
    if !wait_for_exit(info.pid, grace).await {
        warn!(pid = info.pid, "daemon did not stop within {grace:?}, sending SIGKILL");
        signal(info.pid, true)?;
        wait_for_exit(info.pid, Duration::from_secs(2)).await;
    }
    remove_if_owned(&lock_path, &info)?;
    Ok(true)
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !is_process_running(pid) {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    !is_process_running(pid)
}

/// A killed daemon cannot clean up its own lock.
fn remove_if_owned(lock_path: &Path, info: &LockInfo) -> Result<()> {
    if let Some(current) = lock::read_lock(lock_path)? {
        if current.pid == info.pid {
            std::fs::remove_file(lock_path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn signal(pid: u32, force: bool) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| Error::Daemon(format!("invalid pid {pid}")))?;
    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Daemon(format!("cannot signal pid {pid}: {e}"))),
    }
}

#[cfg(not(unix))]
fn signal(pid: u32, _force: bool) -> Result<()> {
    Err(Error::Daemon(format!(
        "stopping pid {pid} is only supported on unix"
    )))
}
