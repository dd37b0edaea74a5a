//! Structured logging for the ensemble daemon and CLI.
//!
//! Log levels:
//! - ERROR: Failures that stop the daemon or lose an agent session
//! - WARN: Unexpected conditions that are recoverable
//! - INFO: Lifecycle events (startup, shutdown, dispatch, transitions)
//! - DEBUG: Scheduling passes and store access
//! - TRACE: Raw agent output
//!
//! Debug mode can be enabled with `--debug` flag or `ENSEMBLE_DEBUG=1` env var.
//! `RUST_LOG` overrides both.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

static WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn debug_from_env() -> bool {
    std::env::var("ENSEMBLE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Default filter directive for the given debug flag.
pub fn default_directive(debug: bool) -> &'static str {
    if debug || debug_from_env() {
        "ensemble=debug,info"
    } else {
        "info"
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

/// Log to stderr. Used by short-lived CLI commands.
pub fn init_stderr(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(filter(debug))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Log to an append-only file through a non-blocking writer. Used by the daemon,
/// whose stdio is detached.
pub fn init_file(log_path: &Path, debug: bool) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    let _ = WORKER_GUARD.set(guard);

    let _ = tracing_subscriber::registry()
        .with(filter(debug))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer),
        )
        .try_init();

    info!(path = %log_path.display(), "logging initialized");
    Ok(())
}
