//! Reads the per-unit documents the agents maintain.
//!
//! Each unit has a goal document at `docs/chunks/<id>/GOAL.md` whose YAML
//! front matter carries the completion marker (`status`) and the declared
//! resource footprint (`code_paths`). The daemon only reads these; agents
//! write them inside their worktrees.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::UnitId;
use crate::{Error, Result};

/// Marker statuses that mean the unit's work is finished.
const DONE_STATUSES: &[&str] = &["ACTIVE", "COMPLETE", "DONE"];
/// Marker statuses that mean work is still in progress.
const PENDING_STATUSES: &[&str] = &["FUTURE", "IMPLEMENTING"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarker {
    pub status: String,
    pub done: bool,
}

/// Source of completion markers and resource footprints.
pub trait ArtifactSource: Send + Sync {
    /// Current completion marker.
    ///
    /// # Errors
    /// [`Error::MalformedMarker`] when the document is missing or its marker
    /// cannot be interpreted.
    fn read_completion_marker(&self, unit: &UnitId) -> Result<CompletionMarker>;

    /// Paths the unit declared it will touch.
    fn read_resource_footprint(&self, unit: &UnitId) -> Result<BTreeSet<String>>;
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    status: Option<String>,
    #[serde(default)]
    code_paths: Vec<String>,
}

/// Goal documents on disk. The unit's worktree copy wins over the main
/// checkout, since that is where the agent edits it.
#[derive(Debug, Clone)]
pub struct ChunkArtifacts {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl ChunkArtifacts {
    pub fn new(repo_root: &Path, worktrees_dir: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
        }
    }

    pub fn relative_doc_path(unit: &UnitId) -> PathBuf {
        Path::new("docs")
            .join("chunks")
            .join(unit.as_str())
            .join("GOAL.md")
    }

    fn doc_path(&self, unit: &UnitId) -> PathBuf {
        let relative = Self::relative_doc_path(unit);
        let in_worktree = self.worktrees_dir.join(unit.as_str()).join(&relative);
        if in_worktree.exists() {
            in_worktree
        } else {
            self.repo_root.join(relative)
        }
    }

    fn front_matter(&self, unit: &UnitId) -> Result<FrontMatter> {
        let malformed = |reason: String| Error::MalformedMarker {
            unit: unit.to_string(),
            reason,
        };
        let path = self.doc_path(unit);
        let contents = fs::read_to_string(&path)
            .map_err(|e| malformed(format!("cannot read {}: {e}", path.display())))?;
        let yaml = split_front_matter(&contents)
            .ok_or_else(|| malformed(format!("{} has no front matter", path.display())))?;
        serde_yaml::from_str(yaml).map_err(|e| malformed(format!("bad front matter: {e}")))
    }
}

impl ArtifactSource for ChunkArtifacts {
    fn read_completion_marker(&self, unit: &UnitId) -> Result<CompletionMarker> {
        let front = self.front_matter(unit)?;
        let status = front
            .status
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MalformedMarker {
                unit: unit.to_string(),
                reason: "missing status".into(),
            })?;
        parse_marker(unit, &status)
    }

    fn read_resource_footprint(&self, unit: &UnitId) -> Result<BTreeSet<String>> {
        Ok(self
            .front_matter(unit)?
            .code_paths
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect())
    }
}

fn parse_marker(unit: &UnitId, status: &str) -> Result<CompletionMarker> {
    if DONE_STATUSES.contains(&status) {
        Ok(CompletionMarker {
            status: status.to_string(),
            done: true,
        })
    } else if PENDING_STATUSES.contains(&status) {
        Ok(CompletionMarker {
            status: status.to_string(),
            done: false,
        })
    } else {
        Err(Error::MalformedMarker {
            unit: unit.to_string(),
            reason: format!("unknown status {status:?}"),
        })
    }
}

/// YAML between a leading `---` line and the next `---` line.
fn split_front_matter(contents: &str) -> Option<&str> {
    let contents = contents.strip_prefix('\u{feff}').unwrap_or(contents);
    let after = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    if after.starts_with("---") {
        return Some("");
    }
    let end = after.find("\n---")?;
    Some(&after[..end])
}
