//! Agent sessions.
//!
//! [`AgentRunner`] is the seam between the scheduler and whatever executes
//! a phase. [`ClaudeRunner`] runs the configured agent CLI headlessly in the
//! unit's worktree and turns its JSON result into a [`RunOutcome`].

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use super::detection;
use super::sandbox::{CheckoutMonitor, Sandbox};
use crate::agent::AgentCommand;
use crate::core::{Phase, UnitId};
use crate::util::{blocking, tail_chars};
use crate::{Error, Result};

/// One phase (or a continuation of one) to run for a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub unit: UnitId,
    pub phase: Phase,
    pub worktree: PathBuf,
    pub prompt: String,
    /// Session to continue instead of starting a new one.
    pub resume: Option<String>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded {
        session_id: Option<String>,
        output: String,
    },
    /// The agent stopped to ask the operator something.
    Question {
        session_id: Option<String>,
        question: String,
    },
    Failed {
        session_id: Option<String>,
        error: String,
    },
    /// The agent wrote outside its worktree.
    SandboxViolation {
        session_id: Option<String>,
        paths: Vec<String>,
    },
    TimedOut {
        after: Duration,
    },
}

impl RunOutcome {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded { session_id, .. }
            | RunOutcome::Question { session_id, .. }
            | RunOutcome::Failed { session_id, .. }
            | RunOutcome::SandboxViolation { session_id, .. } => session_id.as_deref(),
            RunOutcome::TimedOut { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded { .. } => "succeeded",
            RunOutcome::Question { .. } => "question",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::SandboxViolation { .. } => "sandbox_violation",
            RunOutcome::TimedOut { .. } => "timed_out",
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one session to completion. The pool enforces the wall-clock
    /// timeout by dropping this future, so implementations must clean up
    /// on drop.
    async fn run(&self, request: RunRequest) -> Result<RunOutcome>;
}

/// Parsed final message of a headless session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub session_id: Option<String>,
    pub result: std::result::Result<String, String>,
    /// Paths of tool calls the agent CLI refused.
    pub denied_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    permission_denials: Vec<Denial>,
}

#[derive(Debug, Deserialize)]
struct Denial {
    #[serde(default)]
    tool_input: serde_json::Value,
}

const UNPARSED_TAIL_CHARS: usize = 400;

/// Input keys that carry a filesystem path in agent tool calls.
const PATH_KEYS: &[&str] = &["file_path", "notebook_path", "path"];

/// Parse the JSON printed by `--output-format json`.
pub fn parse_reply(json: &str) -> Result<AgentReply> {
    let raw: RawReply = serde_json::from_str(json.trim())?;
    let result = match raw.subtype.as_deref() {
        Some("success") if !raw.is_error => Ok(raw.result.unwrap_or_default()),
        Some("success") => Err(raw.result.unwrap_or_else(|| "agent reported an error".into())),
        Some(other) => Err(raw
            .error
            .or(raw.result)
            .unwrap_or_else(|| format!("agent ended with {other}"))),
        None => match (raw.error, raw.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) if !raw.is_error => Ok(result),
            (None, Some(result)) => Err(result),
            (None, None) => Err("unknown response format".to_string()),
        },
    };
    let denied_paths = raw
        .permission_denials
        .iter()
        .flat_map(|d| {
            PATH_KEYS
                .iter()
                .filter_map(move |key| d.tool_input.get(*key).and_then(|v| v.as_str()))
        })
        .map(PathBuf::from)
        .collect();
    Ok(AgentReply {
        session_id: raw.session_id,
        result,
        denied_paths,
    })
}

/// Output the agent CLI printed that is not its JSON result. Whatever the
/// exit code, nothing here says the phase got done.
pub fn unparsed_reply(
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
    session_id: Option<String>,
) -> AgentReply {
    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    let detail = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };
    let error = if detail.trim().is_empty() {
        format!("agent exited with {code} and printed no result")
    } else {
        format!(
            "agent exited with {code} without a JSON result: {}",
            tail_chars(detail, UNPARSED_TAIL_CHARS)
        )
    };
    AgentReply {
        session_id,
        result: Err(error),
        denied_paths: Vec::new(),
    }
}

/// Classify a reply, checking the final message for a question.
pub fn classify(reply: AgentReply) -> RunOutcome {
    match reply.result {
        Ok(output) => match detection::extract_question(&output) {
            Some(question) => RunOutcome::Question {
                session_id: reply.session_id,
                question,
            },
            None => RunOutcome::Succeeded {
                session_id: reply.session_id,
                output,
            },
        },
        Err(error) => RunOutcome::Failed {
            session_id: reply.session_id,
            error,
        },
    }
}

/// Runs the configured agent CLI in headless mode.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    agent: AgentCommand,
    worktrees_dir: PathBuf,
    /// Shared by every session so concurrent ones are told apart.
    monitor: CheckoutMonitor,
}

impl ClaudeRunner {
    pub fn new(agent: AgentCommand, repo_root: &Path, worktrees_dir: &Path) -> Self {
        let mut audit_excludes = vec![format!("{}/", crate::config::STATE_DIR)];
        if let Ok(relative) = worktrees_dir.strip_prefix(repo_root) {
            audit_excludes.push(format!("{}/", relative.display()));
        }
        Self {
            agent,
            worktrees_dir: worktrees_dir.to_path_buf(),
            monitor: CheckoutMonitor::new(repo_root, audit_excludes),
        }
    }

    pub fn agent(&self) -> &AgentCommand {
        &self.agent
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        if !Sandbox::new(&self.worktrees_dir).contains(&request.worktree) {
            return Err(Error::Validation(format!(
                "worktree {} is outside {}",
                request.worktree.display(),
                self.worktrees_dir.display()
            )));
        }
        if !self.agent.is_available() {
            return Err(Error::AgentNotAvailable(self.agent.binary().to_string()));
        }

        let monitor = self.monitor.clone();
        let window = blocking(move || monitor.begin()).await?;

        info!(
            unit = %request.unit,
            phase = %request.phase,
            resume = request.resume.is_some(),
            "starting agent session"
        );
        let output = Command::new(self.agent.binary())
            .args(
                self.agent
                    .headless_args(&request.prompt, request.resume.as_deref()),
            )
            .current_dir(&request.worktree)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(unit = %request.unit, %stdout, "agent output");

        let reply = match parse_reply(&stdout) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(unit = %request.unit, error = %e, "agent output is not JSON");
                unparsed_reply(
                    output.status.code(),
                    &stdout,
                    &stderr,
                    request.resume.clone(),
                )
            }
        };

        let mut escaped = blocking(move || window.finish()).await?;
        let refused = Sandbox::new(&request.worktree)
            .violations(reply.denied_paths.iter().map(PathBuf::as_path));
        escaped.extend(refused.iter().map(|p| p.display().to_string()));
        if !escaped.is_empty() {
            warn!(unit = %request.unit, paths = ?escaped, "agent wrote outside its worktree");
            return Ok(RunOutcome::SandboxViolation {
                session_id: reply.session_id,
                paths: escaped,
            });
        }
        Ok(classify(reply))
    }
}
