use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, IndexAddOption, ObjectType, Oid, Repository, Signature, StatusOptions,
};
use tracing::debug;

use crate::{Error, Result};

/// Result of merging a unit branch into the base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Tip of the base branch after the merge.
    pub commit: String,
    pub fast_forward: bool,
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "opening repository");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Working directory of the main checkout.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Short name of the checked-out branch.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        match head.shorthand() {
            Some(name) if head.is_branch() => Ok(name.to_string()),
            _ => Err(Error::Validation(
                "repository HEAD is detached; set base_branch in config".into(),
            )),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Create the worktree at `worktree_path` on `branch`, branching from
    /// `base` if the branch is new. Returns `false` if the worktree already
    /// existed and was reused.
    pub fn ensure_worktree(&self, branch: &str, worktree_path: &Path, base: &str) -> Result<bool> {
        if worktree_path.exists() && Repository::open(worktree_path).is_ok() {
            debug!(path = %worktree_path.display(), "reusing worktree");
            return Ok(false);
        }
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo = self.repo()?;
        let branch_obj = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let base_commit = repo
                    .find_branch(base, BranchType::Local)?
                    .get()
                    .peel_to_commit()?;
                debug!(branch, base, commit = %base_commit.id(), "creating branch");
                repo.branch(branch, &base_commit, false)?
            }
            Err(e) => return Err(e.into()),
        };
        let branch_ref = branch_obj.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes, so the worktree is named after its folder.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("bad worktree path {}", worktree_path.display())))?;
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        debug!(path = %worktree_path.display(), branch, "worktree created");
        Ok(true)
    }

    /// Stage and commit everything in the worktree. Returns `None` when
    /// there was nothing to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            debug!(path = %worktree_path.display(), "nothing to commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %commit_id, "commit created");
        Ok(Some(commit_id.to_string()))
    }

    /// Merge `source` into `base`, computing the merge in memory. The main
    /// checkout is only touched (safely) when it has `base` checked out.
    ///
    /// # Errors
    /// [`Error::MergeConflict`] with the conflicting paths; `base` is left
    /// unchanged in that case.
    pub fn merge_into(&self, base: &str, source: &str) -> Result<MergeOutcome> {
        let repo = self.repo()?;
        let base_ref = format!("refs/heads/{base}");
        let base_commit = repo.find_reference(&base_ref)?.peel_to_commit()?;
        let source_commit = repo
            .find_branch(source, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        if base_commit.id() == source_commit.id()
            || repo.graph_descendant_of(base_commit.id(), source_commit.id())?
        {
            return Ok(MergeOutcome {
                commit: base_commit.id().to_string(),
                fast_forward: true,
            });
        }

        let (target, fast_forward) =
            if repo.graph_descendant_of(source_commit.id(), base_commit.id())? {
                (source_commit.id(), true)
            } else {
                let mut index = repo.merge_commits(&base_commit, &source_commit, None)?;
                if index.has_conflicts() {
                    let mut paths = Vec::new();
                    for conflict in index.conflicts()? {
                        let conflict = conflict?;
                        if let Some(entry) = conflict
                            .our
                            .as_ref()
                            .or(conflict.their.as_ref())
                            .or(conflict.ancestor.as_ref())
                        {
                            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
                        }
                    }
                    return Err(Error::MergeConflict { paths });
                }
                let tree_id = index.write_tree_to(&repo)?;
                let tree = repo.find_tree(tree_id)?;
                let sig = signature(&repo)?;
                let commit_id = repo.commit(
                    None,
                    &sig,
                    &sig,
                    &format!("Merge {source} into {base}"),
                    &tree,
                    &[&base_commit, &source_commit],
                )?;
                (commit_id, false)
            };

        // The main checkout is refreshed against the old tip before the ref
        // moves, so files new in the merge are written out.
        let head_is_base = repo
            .head()
            .ok()
            .and_then(|h| h.name().map(|n| n == base_ref))
            .unwrap_or(false);
        if head_is_base {
            let object = repo.find_object(target, None)?;
            repo.checkout_tree(&object, Some(git2::build::CheckoutBuilder::new().safe()))?;
        }
        repo.reference(
            &base_ref,
            target,
            true,
            &format!("ensemble: merge {source} into {base}"),
        )?;

        let outcome = MergeOutcome {
            commit: target.to_string(),
            fast_forward,
        };
        debug!(base, source, commit = %outcome.commit, ff = outcome.fast_forward, "merged");
        Ok(outcome)
    }

    /// Modified, staged or untracked paths of the main checkout, skipping
    /// anything under the given prefixes, with the blob id of their current
    /// contents (`None` once deleted).
    pub fn dirty_files(&self, exclude: &[&str]) -> Result<BTreeMap<String, Option<Oid>>> {
        let repo = self.repo()?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::Validation("repository has no working directory".into()))?
            .to_path_buf();
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut files = BTreeMap::new();
        for path in statuses.iter().filter_map(|entry| entry.path().map(String::from)) {
            if exclude.iter().any(|prefix| path.starts_with(prefix)) {
                continue;
            }
            let full = workdir.join(&path);
            let blob = if full.is_file() {
                Some(Oid::hash_file(ObjectType::Blob, &full)?)
            } else {
                None
            };
            files.insert(path, blob);
        }
        Ok(files)
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("ensemble", "ensemble@localhost"))?)
}
