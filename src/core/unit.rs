//! Work unit data model.
//!
//! A work unit is one independently-mergeable piece of work. It carries a
//! lifecycle phase, a scheduling status and the bookkeeping that goes with
//! each status. All status changes go through the methods here, which check
//! the transition table, keep the per-status fields consistent and append to
//! the unit's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::transition::{check_transition, Phase, UnitStatus};
use crate::error::{Error, Result};

/// Stable, human-readable identifier of a work unit.
///
/// Used as a directory and branch name, so it is restricted to ASCII
/// letters, digits, `-`, `_` and `.`, and may not start with `.` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if id.is_empty() || id.len() > 128 || !valid_chars || id.starts_with(['.', '-']) {
            return Err(Error::InvalidUnitId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UnitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for UnitId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.0
    }
}

/// One append-only log line of a unit's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// Phase after the event.
    pub phase: Phase,
    /// Status after the event.
    pub status: UnitStatus,
    pub note: Option<String>,
}

/// The central entity the daemon schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub phase: Phase,
    pub status: UnitStatus,
    /// Isolated working copy, assigned on first dispatch.
    pub worktree: Option<PathBuf>,
    /// Units that must reach DONE first. Non-empty exactly when BLOCKED.
    pub blocked_by: BTreeSet<UnitId>,
    /// Why an operator is needed. Present exactly when NEEDS_ATTENTION.
    pub attention_reason: Option<String>,
    /// Running units a conflict flag was raised against.
    pub conflicts_with: BTreeSet<UnitId>,
    /// Operator answer to deliver on the next dispatch.
    pub pending_answer: Option<String>,
    /// Completion-verification retries consumed in the current phase.
    pub completion_retries: u32,
    /// Most recent agent session, used to resume.
    pub session_id: Option<String>,
    /// Files and directories this unit declared it will touch.
    pub footprint: BTreeSet<String>,
    /// Higher runs first.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

impl WorkUnit {
    /// A fresh unit: phase GOAL, status READY.
    pub fn new(id: UnitId, footprint: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            phase: Phase::Goal,
            status: UnitStatus::Ready,
            worktree: None,
            blocked_by: BTreeSet::new(),
            attention_reason: None,
            conflicts_with: BTreeSet::new(),
            pending_answer: None,
            completion_retries: 0,
            session_id: None,
            footprint,
            priority: 0,
            created_at: now,
            updated_at: now,
            history: vec![HistoryEntry {
                at: now,
                phase: Phase::Goal,
                status: UnitStatus::Ready,
                note: Some("created".to_string()),
            }],
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Blockers plus conflict partners.
    pub fn related_units(&self) -> BTreeSet<UnitId> {
        self.blocked_by
            .union(&self.conflicts_with)
            .cloned()
            .collect()
    }

    /// Append a history line without changing status.
    pub fn note(&mut self, note: impl Into<String>) {
        self.touch(Some(note.into()));
    }

    /// Dispatch: READY or NEEDS_ATTENTION to RUNNING.
    pub fn start(&mut self, worktree: PathBuf) -> Result<()> {
        let note = format!("dispatched for {} phase", self.phase);
        self.set_status(UnitStatus::Running, note)?;
        self.worktree = Some(worktree);
        Ok(())
    }

    /// A non-terminal phase finished: move to the next phase and back to READY.
    pub fn advance_phase(&mut self) -> Result<Phase> {
        let next = self.phase.next().ok_or_else(|| Error::InvalidPhaseAdvance {
            from: self.phase.to_string(),
        })?;
        check_transition(self.status, UnitStatus::Ready)?;
        let finished = self.phase;
        self.phase = next;
        self.completion_retries = 0;
        self.set_status(UnitStatus::Ready, format!("{finished} phase finished"))?;
        Ok(next)
    }

    /// Completion verified and merged.
    pub fn complete(&mut self, note: impl Into<String>) -> Result<()> {
        if !self.phase.is_terminal() {
            return Err(Error::InvalidState(format!(
                "{} cannot be DONE in phase {}",
                self.id, self.phase
            )));
        }
        self.set_status(UnitStatus::Done, note.into())?;
        self.completion_retries = 0;
        Ok(())
    }

    /// Escalate to the operator.
    pub fn flag(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(Error::Validation("attention reason must not be empty".into()));
        }
        self.set_status(UnitStatus::NeedsAttention, reason.clone())?;
        self.attention_reason = Some(reason);
        Ok(())
    }

    /// Escalate a possible conflict with running units.
    pub fn flag_conflict(&mut self, reason: impl Into<String>, with: BTreeSet<UnitId>) -> Result<()> {
        if with.is_empty() || with.contains(&self.id) {
            return Err(Error::Validation(format!(
                "conflict partners of {} must be other units",
                self.id
            )));
        }
        self.flag(reason)?;
        self.conflicts_with = with;
        Ok(())
    }

    /// Wait for other units to reach DONE.
    pub fn block(&mut self, on: BTreeSet<UnitId>) -> Result<()> {
        if on.is_empty() || on.contains(&self.id) {
            return Err(Error::Validation(format!(
                "blockers of {} must be other units",
                self.id
            )));
        }
        let names: Vec<&str> = on.iter().map(UnitId::as_str).collect();
        self.set_status(UnitStatus::Blocked, format!("blocked on {}", names.join(", ")))?;
        self.blocked_by = on;
        Ok(())
    }

    /// Every blocker is done.
    pub fn unblock(&mut self) -> Result<()> {
        if self.status != UnitStatus::Blocked {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: UnitStatus::Ready.to_string(),
            });
        }
        self.set_status(UnitStatus::Ready, "blockers done".to_string())
    }

    /// Operator resolution back to READY, optionally carrying an answer for
    /// the agent.
    pub fn resolve(&mut self, answer: Option<String>, note: impl Into<String>) -> Result<()> {
        if self.status != UnitStatus::NeedsAttention {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: UnitStatus::Ready.to_string(),
            });
        }
        self.set_status(UnitStatus::Ready, note.into())?;
        self.pending_answer = answer;
        Ok(())
    }

    /// Consume one completion-verification retry while staying RUNNING.
    pub fn record_completion_retry(&mut self, max: u32) -> Result<u32> {
        if self.status != UnitStatus::Running || !self.phase.is_terminal() {
            return Err(Error::InvalidState(format!(
                "{} is not verifying completion",
                self.id
            )));
        }
        if self.completion_retries >= max {
            return Err(Error::InvalidState(format!(
                "{} exhausted {max} completion retries",
                self.id
            )));
        }
        self.completion_retries += 1;
        self.note(format!(
            "completion marker not done, retry {}/{max}",
            self.completion_retries
        ));
        Ok(self.completion_retries)
    }

    pub fn take_pending_answer(&mut self) -> Option<String> {
        self.pending_answer.take()
    }

    /// Per-status field consistency. Checked by the store before every write.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |detail: &str| {
            Err(Error::InvariantViolation {
                id: self.id.to_string(),
                detail: detail.to_string(),
            })
        };

        let attention = self.status == UnitStatus::NeedsAttention;
        let has_reason = self
            .attention_reason
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty());
        if attention != has_reason {
            return violation("attention reason must be present exactly when NEEDS_ATTENTION");
        }
        if (self.status == UnitStatus::Blocked) != !self.blocked_by.is_empty() {
            return violation("blocked_by must be non-empty exactly when BLOCKED");
        }
        if !self.conflicts_with.is_empty() && !attention {
            return violation("conflict partners are only kept while NEEDS_ATTENTION");
        }
        if self.blocked_by.contains(&self.id) || self.conflicts_with.contains(&self.id) {
            return violation("a unit cannot reference itself");
        }
        if self.status == UnitStatus::Done && !self.phase.is_terminal() {
            return violation("DONE requires phase COMPLETE");
        }
        Ok(())
    }

    fn set_status(&mut self, to: UnitStatus, note: String) -> Result<()> {
        check_transition(self.status, to)?;
        match self.status {
            UnitStatus::NeedsAttention => {
                self.attention_reason = None;
                self.conflicts_with.clear();
            }
            UnitStatus::Blocked => self.blocked_by.clear(),
            _ => {}
        }
        self.status = to;
        self.touch(Some(note));
        Ok(())
    }

    fn touch(&mut self, note: Option<String>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(HistoryEntry {
            at: now,
            phase: self.phase,
            status: self.status,
            note,
        });
    }
}
