//! Schema migrations for the state store.
//!
//! Migrations are numbered, additive and applied in order at startup. The
//! applied version lives in SQLite's `user_version` header, and each
//! migration commits together with its version bump, so running
//! [`migrate`] again is a no-op and an interrupted upgrade resumes where it
//! stopped. Existing rows pick up defaults for new columns.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::{Error, Result};

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "work units and history",
        sql: "
            CREATE TABLE work_units (
                id          TEXT PRIMARY KEY,
                phase       TEXT NOT NULL,
                status      TEXT NOT NULL,
                worktree    TEXT,
                blocked_by  TEXT NOT NULL DEFAULT '[]',
                session_id  TEXT,
                footprint   TEXT NOT NULL DEFAULT '[]',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX idx_work_units_status ON work_units(status);
            CREATE TABLE unit_history (
                seq      INTEGER PRIMARY KEY AUTOINCREMENT,
                unit_id  TEXT NOT NULL,
                at       TEXT NOT NULL,
                phase    TEXT NOT NULL,
                status   TEXT NOT NULL,
                note     TEXT
            );
            CREATE INDEX idx_unit_history_unit ON unit_history(unit_id, seq);
        ",
    },
    Migration {
        version: 2,
        name: "attention tracking",
        sql: "
            ALTER TABLE work_units ADD COLUMN attention_reason TEXT;
            ALTER TABLE work_units ADD COLUMN conflicts_with TEXT NOT NULL DEFAULT '[]';
        ",
    },
    Migration {
        version: 3,
        name: "completion retries",
        sql: "
            ALTER TABLE work_units ADD COLUMN completion_retries INTEGER NOT NULL DEFAULT 0;
        ",
    },
    Migration {
        version: 4,
        name: "operator answers, priority and verdicts",
        sql: "
            ALTER TABLE work_units ADD COLUMN pending_answer TEXT;
            ALTER TABLE work_units ADD COLUMN priority INTEGER NOT NULL DEFAULT 0;
            CREATE TABLE conflict_verdicts (
                unit_a      TEXT NOT NULL,
                unit_b      TEXT NOT NULL,
                verdict     TEXT NOT NULL,
                decided_at  TEXT NOT NULL,
                PRIMARY KEY (unit_a, unit_b)
            );
        ",
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply every migration newer than the stored version. Returns how many ran.
pub fn migrate(conn: &mut Connection) -> Result<usize> {
    migrate_to(conn, latest_version())
}

/// Apply migrations up to and including `target`.
pub fn migrate_to(conn: &mut Connection, target: i64) -> Result<usize> {
    let current = current_version(conn)?;
    let supported = latest_version();
    if current > supported {
        return Err(Error::SchemaTooNew {
            found: current,
            supported,
        });
    }

    let mut applied = 0;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        debug!(version = migration.version, name = migration.name, "applying migration");
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        applied += 1;
    }

    if applied > 0 {
        info!(from = current, to = current_version(conn)?, "store schema migrated");
    }
    Ok(applied)
}
