//! Daemon lifecycle.
//!
//! Handles:
//! - the single-instance lock marker
//! - detached start, graceful stop and status from the CLI
//! - the foreground daemon process hosting the scheduler and the HTTP API

pub mod lock;
mod process;
mod server;

pub use lock::{LockGuard, LockInfo};
pub use process::{client, start, status, stop, DaemonStatus};
pub use server::run;
