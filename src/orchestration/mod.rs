//! Orchestration layer for the ensemble daemon.
//!
//! The scheduler drives work units through their phases: the conflict
//! oracle gates dispatch, the agent pool runs sessions concurrently through
//! an [`AgentRunner`], and each finished session is fed back into the unit
//! state machine and persisted before anything else happens.

pub mod detection;
pub mod events;
pub mod oracle;
mod pool;
pub mod prompts;
pub mod runner;
pub mod sandbox;
mod scheduler;
pub mod workspace;

pub use events::{EventBus, UnitEvent, UnitSummary};
pub use oracle::{check_conflict, Assessment};
pub use pool::AgentPool;
pub use runner::{AgentRunner, ClaudeRunner, RunOutcome, RunRequest};
pub use sandbox::{AuditWindow, CheckoutMonitor, Sandbox};
pub use scheduler::{Command, PassReport, Scheduler, SchedulerConfig, SchedulerHandle};
pub use workspace::{GitWorkspace, Workspace};
