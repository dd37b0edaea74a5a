//! Keeping agents inside their worktrees.
//!
//! [`Sandbox`] answers whether a path lies within a root, lexically, so it
//! works for paths that do not exist yet. [`CheckoutMonitor`] fingerprints
//! the main checkout around every session: anything that changed there was
//! written outside every worktree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use git2::Oid;
use tracing::debug;

use crate::git::GitOps;
use crate::{Error, Result};

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: &Path) -> Self {
        Self {
            root: normalize(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths are taken relative to the root.
    pub fn contains(&self, path: &Path) -> bool {
        let resolved = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.root.join(path))
        };
        resolved.starts_with(&self.root)
    }

    /// The subset of `paths` outside the root.
    pub fn violations<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) -> Vec<PathBuf> {
        paths
            .into_iter()
            .filter(|p| !self.contains(p))
            .map(Path::to_path_buf)
            .collect()
    }
}

type Fingerprints = BTreeMap<String, Option<Oid>>;

/// A change seen in the main checkout, waiting for one of the sessions
/// that were open when it appeared to claim it.
#[derive(Debug)]
struct Sighting {
    path: String,
    candidates: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct MonitorState {
    last: Fingerprints,
    next_window: u64,
    open: BTreeSet<u64>,
    pending: Vec<Sighting>,
}

/// Watches the main checkout across every agent session of the daemon.
///
/// Each session opens a window before it starts and closes it when it
/// ends. The checkout is fingerprinted at every open and close; a path
/// whose contents changed since the previous fingerprint is blamed on the
/// sessions open at that moment, and is reported once, to the first of
/// them to close.
#[derive(Debug, Clone)]
pub struct CheckoutMonitor {
    repo_root: PathBuf,
    excluded: Vec<String>,
    state: Arc<Mutex<MonitorState>>,
}

impl CheckoutMonitor {
    pub fn new(repo_root: &Path, excluded: Vec<String>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            excluded,
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MonitorState>> {
        self.state
            .lock()
            .map_err(|_| Error::InvalidState("checkout monitor poisoned".into()))
    }

    /// Fingerprint the checkout and record what changed since last time.
    fn observe(&self, state: &mut MonitorState) -> Result<()> {
        let prefixes: Vec<&str> = self.excluded.iter().map(String::as_str).collect();
        let now = GitOps::new(&self.repo_root)?.dirty_files(&prefixes)?;
        if !state.open.is_empty() {
            let changed: BTreeSet<&String> = now
                .iter()
                .filter(|(path, blob)| state.last.get(*path) != Some(*blob))
                .map(|(path, _)| path)
                .chain(state.last.keys().filter(|path| !now.contains_key(*path)))
                .collect();
            for path in changed {
                debug!(path = %path, sessions = state.open.len(), "main checkout changed");
                state.pending.push(Sighting {
                    path: path.clone(),
                    candidates: state.open.clone(),
                });
            }
        }
        state.last = now;
        Ok(())
    }

    /// Open a window for one session.
    pub fn begin(&self) -> Result<AuditWindow> {
        let mut state = self.lock()?;
        self.observe(&mut state)?;
        let id = state.next_window;
        state.next_window += 1;
        state.open.insert(id);
        Ok(AuditWindow {
            monitor: self.clone(),
            id,
            closed: false,
        })
    }

    fn close(&self, id: u64, state: &mut MonitorState) -> Vec<String> {
        state.open.remove(&id);
        let (mine, rest): (Vec<Sighting>, Vec<Sighting>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|s| s.candidates.contains(&id));
        state.pending = rest
            .into_iter()
            .filter(|s| s.candidates.iter().any(|c| state.open.contains(c)))
            .collect();
        let paths: BTreeSet<String> = mine.into_iter().map(|s| s.path).collect();
        paths.into_iter().collect()
    }
}

/// One session's stretch of time under a [`CheckoutMonitor`]. Dropping it
/// without [`finish`](Self::finish) closes it and discards its claims.
#[derive(Debug)]
pub struct AuditWindow {
    monitor: CheckoutMonitor,
    id: u64,
    closed: bool,
}

impl AuditWindow {
    /// Close the window, returning the main-checkout paths changed while it
    /// was open that no earlier-closing session claimed.
    pub fn finish(mut self) -> Result<Vec<String>> {
        self.closed = true;
        let monitor = self.monitor.clone();
        let mut state = monitor.lock()?;
        let observed = monitor.observe(&mut state);
        let paths = monitor.close(self.id, &mut state);
        observed.map(|()| paths)
    }
}

impl Drop for AuditWindow {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(mut state) = self.monitor.lock() {
            self.monitor.close(self.id, &mut state);
        }
    }
}
