//! Per-unit worktrees and integration back into the base branch.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::UnitId;
use crate::git::GitOps;
use crate::Result;

/// Branch prefix for unit branches.
pub const BRANCH_PREFIX: &str = "ensemble/";

pub fn unit_branch(unit: &UnitId) -> String {
    format!("{BRANCH_PREFIX}{unit}")
}

/// Where a unit's agent works and how its result lands.
///
/// Both calls block; the scheduler runs them on the blocking pool.
pub trait Workspace: Send + Sync {
    /// Make sure the unit has a worktree and return its path.
    fn prepare(&self, unit: &UnitId) -> Result<PathBuf>;

    /// Commit the worktree and merge the unit branch into the base branch.
    /// Returns the resulting base commit.
    ///
    /// # Errors
    /// [`crate::Error::MergeConflict`] leaves the base branch untouched.
    fn integrate(&self, unit: &UnitId, worktree: &Path) -> Result<String>;
}

pub struct GitWorkspace {
    git: GitOps,
    worktrees_dir: PathBuf,
    base_branch: String,
}

impl GitWorkspace {
    /// `base_branch` defaults to the branch checked out in `repo_root`.
    pub fn new(repo_root: &Path, worktrees_dir: &Path, base_branch: Option<&str>) -> Result<Self> {
        let git = GitOps::new(repo_root)?;
        let base_branch = match base_branch {
            Some(branch) => branch.to_string(),
            None => git.current_branch()?,
        };
        if !git.branch_exists(&base_branch)? {
            return Err(crate::Error::Validation(format!(
                "base branch '{base_branch}' does not exist"
            )));
        }
        Ok(Self {
            git,
            worktrees_dir: worktrees_dir.to_path_buf(),
            base_branch,
        })
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn worktree_path(&self, unit: &UnitId) -> PathBuf {
        self.worktrees_dir.join(unit.as_str())
    }
}

impl Workspace for GitWorkspace {
    fn prepare(&self, unit: &UnitId) -> Result<PathBuf> {
        let path = self.worktree_path(unit);
        let created = self
            .git
            .ensure_worktree(&unit_branch(unit), &path, &self.base_branch)?;
        if created {
            info!(unit = %unit, path = %path.display(), "created worktree");
        }
        Ok(path)
    }

    fn integrate(&self, unit: &UnitId, worktree: &Path) -> Result<String> {
        if let Some(commit) = self
            .git
            .commit_all(worktree, &format!("{unit}: final changes"))?
        {
            info!(unit = %unit, %commit, "committed outstanding changes");
        }
        let outcome = self.git.merge_into(&self.base_branch, &unit_branch(unit))?;
        info!(
            unit = %unit,
            commit = %outcome.commit,
            fast_forward = outcome.fast_forward,
            "merged into {}",
            self.base_branch
        );
        Ok(outcome.commit)
    }
}
