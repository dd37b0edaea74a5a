//! Core domain model: work units, their state machine and conflict verdicts.

pub mod transition;
pub mod unit;
pub mod verdict;

pub use transition::{allowed_targets, can_transition, check_transition, Phase, UnitStatus};
pub use unit::{HistoryEntry, UnitId, WorkUnit};
pub use verdict::{UnitPair, Verdict, VerdictBook};
