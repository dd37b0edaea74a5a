//! Lifecycle phases and scheduling statuses of a work unit.
//!
//! Phases only move forward. Statuses move according to [`STATUS_TRANSITIONS`],
//! which is the single source of truth: every status change in the crate is
//! checked against it and an unlisted edge is an error, never a silent no-op.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Lifecycle phase. Ordered: `Goal < Plan < Implement < Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Goal,
    Plan,
    Implement,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Goal, Phase::Plan, Phase::Implement, Phase::Complete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Goal => "GOAL",
            Phase::Plan => "PLAN",
            Phase::Implement => "IMPLEMENT",
            Phase::Complete => "COMPLETE",
        }
    }

    /// The phase after this one, or `None` for the terminal phase.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Goal => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Implement),
            Phase::Implement => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown phase: {s}")))
    }
}

/// Scheduling status, independent of phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    /// Eligible for dispatch.
    Ready,
    /// An agent session is active.
    Running,
    /// Waiting on other units to reach DONE.
    Blocked,
    /// Waiting on an operator decision.
    NeedsAttention,
    /// Terminal.
    Done,
}

impl UnitStatus {
    pub const ALL: [UnitStatus; 5] = [
        UnitStatus::Ready,
        UnitStatus::Running,
        UnitStatus::Blocked,
        UnitStatus::NeedsAttention,
        UnitStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Ready => "READY",
            UnitStatus::Running => "RUNNING",
            UnitStatus::Blocked => "BLOCKED",
            UnitStatus::NeedsAttention => "NEEDS_ATTENTION",
            UnitStatus::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Done)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UnitStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown status: {s}")))
    }
}

/// Allowed status edges, as data.
///
/// `Ready -> NeedsAttention` covers a conflict flagged before dispatch and
/// `NeedsAttention -> Blocked` covers an operator "serialize" verdict.
pub const STATUS_TRANSITIONS: &[(UnitStatus, &[UnitStatus])] = &[
    (
        UnitStatus::Ready,
        &[
            UnitStatus::Running,
            UnitStatus::Blocked,
            UnitStatus::NeedsAttention,
        ],
    ),
    (
        UnitStatus::Running,
        &[
            UnitStatus::Ready,
            UnitStatus::Done,
            UnitStatus::NeedsAttention,
            UnitStatus::Blocked,
        ],
    ),
    (UnitStatus::Blocked, &[UnitStatus::Ready]),
    (
        UnitStatus::NeedsAttention,
        &[UnitStatus::Ready, UnitStatus::Running, UnitStatus::Blocked],
    ),
    (UnitStatus::Done, &[]),
];

/// Statuses reachable from `from` in one step.
pub fn allowed_targets(from: UnitStatus) -> &'static [UnitStatus] {
    STATUS_TRANSITIONS
        .iter()
        .find(|(source, _)| *source == from)
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

pub fn can_transition(from: UnitStatus, to: UnitStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Fails loudly on an edge missing from the table.
pub fn check_transition(from: UnitStatus, to: UnitStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
