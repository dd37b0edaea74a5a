//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted agent sessions that edit worktrees the way a real agent would
//! - A scheduler harness wired to an on-disk or in-memory store

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use ensemble::artifacts::ChunkArtifacts;
use ensemble::core::{Phase, UnitId, UnitStatus, WorkUnit};
use ensemble::orchestration::{
    AgentPool, AgentRunner, EventBus, GitWorkspace, RunOutcome, RunRequest, Scheduler,
    SchedulerConfig, UnitEvent,
};
use ensemble::state::StateStore;
use ensemble::Result;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
    /// Worktrees live outside the checkout so merges never see them.
    pub worktrees: TempDir,
}

impl TestRepo {
    /// Create a new test repository with an initial commit on `main`.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self {
            temp_dir,
            path,
            worktrees: TempDir::new().expect("Failed to create worktrees directory"),
        }
    }

    pub fn worktrees_dir(&self) -> &Path {
        self.worktrees.path()
    }

    /// Commit a goal document for `unit` declaring `code_paths`.
    pub fn add_goal(&self, unit: &str, status: &str, code_paths: &[&str]) {
        let relative = ChunkArtifacts::relative_doc_path(&id(unit));
        write_goal(&self.path.join(relative), status, code_paths);
        git(&self.path, &["add", "."]);
        git(&self.path, &["commit", "-m", &format!("goal for {unit}")]);
    }

    /// Contents of `file` on the checked-out base branch.
    pub fn read(&self, file: &str) -> Option<String> {
        std::fs::read_to_string(self.path.join(file)).ok()
    }

    pub fn log_messages(&self) -> Vec<String> {
        let output = Command::new("git")
            .args(["log", "--format=%s"])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git log");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn write_goal(path: &Path, status: &str, code_paths: &[&str]) {
    std::fs::create_dir_all(path.parent().expect("goal path has a parent"))
        .expect("Failed to create goal directory");
    let listed: Vec<String> = code_paths.iter().map(|p| format!("\"{p}\"")).collect();
    let doc = format!(
        "---\nstatus: {status}\ncode_paths: [{}]\n---\n\n# Goal\n",
        listed.join(", ")
    );
    std::fs::write(path, doc).expect("Failed to write goal");
}

pub fn id(s: &str) -> UnitId {
    UnitId::new(s).expect("valid unit id")
}

pub fn paths(list: &[&str]) -> Option<BTreeSet<String>> {
    Some(list.iter().map(|p| p.to_string()).collect())
}

/// What a scripted session does when it is run.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write `file` with `contents` in the worktree and succeed.
    Edit { file: String, contents: String },
    /// Set the unit's goal marker in the worktree and succeed.
    Mark { status: String },
    /// Succeed without touching anything.
    Succeed,
    /// Ask the operator something.
    Ask(String),
    /// Exit with an error.
    Fail(String),
    /// Sleep past any reasonable timeout.
    Hang,
}

/// One recorded invocation of the runner.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub unit: UnitId,
    pub phase: Phase,
    pub prompt: String,
    pub resume: Option<String>,
}

/// Agent runner that plays back per-unit scripts. Units without a script
/// left just succeed.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<UnitId, VecDeque<Step>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, unit: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id(unit), steps.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, unit: &str) -> Vec<Invocation> {
        let unit = id(unit);
        self.calls().into_iter().filter(|c| c.unit == unit).collect()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        self.calls.lock().unwrap().push(Invocation {
            unit: request.unit.clone(),
            phase: request.phase,
            prompt: request.prompt.clone(),
            resume: request.resume.clone(),
        });
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.unit)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed);

        let session_id = Some(format!("session-{}", request.unit));
        match step {
            Step::Edit { file, contents } => {
                let target = request.worktree.join(file);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, contents)?;
            }
            Step::Mark { status } => {
                let goal = request
                    .worktree
                    .join(ChunkArtifacts::relative_doc_path(&request.unit));
                write_goal(&goal, &status, &[]);
            }
            Step::Succeed => {}
            Step::Ask(question) => {
                return Ok(RunOutcome::Question {
                    session_id,
                    question,
                })
            }
            Step::Fail(error) => return Ok(RunOutcome::Failed { session_id, error }),
            Step::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
        Ok(RunOutcome::Succeeded {
            session_id,
            output: format!("{} phase finished", request.phase),
        })
    }
}

/// A scheduler over a real git repository and goal documents.
pub struct Harness {
    pub repo: TestRepo,
    pub runner: Arc<ScriptedRunner>,
    pub scheduler: Scheduler,
    pub events: broadcast::Receiver<UnitEvent>,
}

impl Harness {
    pub fn new(max_agents: usize) -> Self {
        Self::with_options(max_agents, Duration::from_secs(30), 3)
    }

    pub fn with_options(max_agents: usize, timeout: Duration, max_retries: u32) -> Self {
        let repo = TestRepo::new();
        let store = StateStore::open_in_memory().expect("in-memory store");
        Self::build(repo, store, max_agents, timeout, max_retries)
    }

    pub fn build(
        repo: TestRepo,
        store: StateStore,
        max_agents: usize,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let runner = ScriptedRunner::new();
        let workspace = GitWorkspace::new(&repo.path, repo.worktrees_dir(), Some("main"))
            .expect("workspace over test repo");
        let artifacts = ChunkArtifacts::new(&repo.path, repo.worktrees_dir());
        let events = EventBus::default();
        let receiver = events.subscribe();
        let pool = AgentPool::new(runner.clone(), max_agents, timeout);
        let scheduler = Scheduler::new(
            store,
            pool,
            Arc::new(artifacts),
            Arc::new(workspace),
            events,
            SchedulerConfig {
                max_completion_retries: max_retries,
                poll_interval: Duration::from_millis(10),
            },
        );
        Self {
            repo,
            runner,
            scheduler,
            events: receiver,
        }
    }

    pub fn unit(&self, unit: &str) -> WorkUnit {
        self.scheduler.store().load(&id(unit)).expect("unit exists")
    }

    pub fn status(&self, unit: &str) -> UnitStatus {
        self.unit(unit).status
    }

    /// Alternate passes and session completions until nothing is running
    /// and a pass starts nothing new, or `limit` steps have been taken.
    pub async fn drive(&mut self, limit: usize) {
        for _ in 0..limit {
            self.scheduler.pass().await.expect("pass");
            if !self.scheduler.step().await.expect("step") {
                return;
            }
        }
        panic!("scheduler still busy after {limit} steps");
    }

    /// Event names received so far.
    pub fn drain_events(&mut self) -> Vec<UnitEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}
