use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("State store is unreadable at {path}: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("State store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Work unit not found: {0}")]
    UnitNotFound(String),

    #[error("Work unit already exists: {0}")]
    UnitExists(String),

    #[error("Invalid work unit id: {0:?}")]
    InvalidUnitId(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Cannot advance phase past {from}")]
    InvalidPhaseAdvance { from: String },

    #[error("Work unit {id} violates invariant: {detail}")]
    InvariantViolation { id: String, detail: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Malformed completion marker for {unit}: {reason}")]
    MalformedMarker { unit: String, reason: String },

    #[error("Merge conflict in {}", paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    #[error("Daemon already running (pid {pid})")]
    DaemonAlreadyRunning { pid: u32 },

    #[error("Daemon is not running")]
    DaemonNotRunning,

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Agent pool is full (max: {max})")]
    AgentPoolFull { max: usize },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Errors the daemon cannot continue past: the store is gone or unreadable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(_) | Error::StoreCorrupt { .. } | Error::SchemaTooNew { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
