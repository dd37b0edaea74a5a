//! SQLite-backed persistence for work units.
//!
//! Every write runs in a single transaction: the unit row and the history
//! lines it gained are committed together or not at all. A connection mutex
//! serialises writers within the process.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::migration;
use crate::core::{HistoryEntry, Phase, UnitId, UnitPair, UnitStatus, Verdict, VerdictBook, WorkUnit};
use crate::{Error, Result};

const UNIT_COLUMNS: &str = "id, phase, status, worktree, blocked_by, attention_reason, \
     conflicts_with, pending_answer, completion_retries, session_id, footprint, priority, \
     created_at, updated_at";

/// Columns of one `work_units` row, before validation.
struct UnitRow {
    id: String,
    phase: String,
    status: String,
    worktree: Option<String>,
    blocked_by: String,
    attention_reason: Option<String>,
    conflicts_with: String,
    pending_answer: Option<String>,
    completion_retries: i64,
    session_id: Option<String>,
    footprint: String,
    priority: i64,
    created_at: String,
    updated_at: String,
}

impl UnitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase: row.get(1)?,
            status: row.get(2)?,
            worktree: row.get(3)?,
            blocked_by: row.get(4)?,
            attention_reason: row.get(5)?,
            conflicts_with: row.get(6)?,
            pending_answer: row.get(7)?,
            completion_retries: row.get(8)?,
            session_id: row.get(9)?,
            footprint: row.get(10)?,
            priority: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_unit(self, history: Vec<HistoryEntry>) -> Result<WorkUnit> {
        Ok(WorkUnit {
            id: UnitId::new(self.id)?,
            phase: self.phase.parse::<Phase>()?,
            status: self.status.parse::<UnitStatus>()?,
            worktree: self.worktree.map(PathBuf::from),
            blocked_by: serde_json::from_str(&self.blocked_by)?,
            attention_reason: self.attention_reason,
            conflicts_with: serde_json::from_str(&self.conflicts_with)?,
            pending_answer: self.pending_answer,
            completion_retries: u32::try_from(self.completion_retries)
                .map_err(|_| Error::Validation("negative completion_retries".into()))?,
            session_id: self.session_id,
            footprint: serde_json::from_str(&self.footprint)?,
            priority: self.priority,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            history,
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("bad timestamp {raw:?}: {e}")))
}

fn json_set<T: serde::Serialize>(set: &BTreeSet<T>) -> Result<String> {
    Ok(serde_json::to_string(set)?)
}

/// Durable store of work units, their history and conflict verdicts.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Open (creating if needed) and migrate the store at `path`.
    ///
    /// # Errors
    /// An unreadable or corrupt file yields [`Error::StoreCorrupt`]; the
    /// caller must treat it as fatal.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let corrupt = |reason: String| Error::StoreCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let conn = Connection::open(path).map_err(|e| corrupt(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| corrupt(e.to_string()))?;

        let store = Self::init(conn, Some(path.to_path_buf())).map_err(|e| match e {
            Error::SchemaTooNew { .. } => e,
            other => corrupt(other.to_string()),
        })?;
        debug!(path = %path.display(), "state store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        migration::migrate(&mut conn)?;
        conn.query_row("SELECT count(*) FROM work_units", [], |row| row.get::<_, i64>(0))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::InvalidState("state store connection poisoned".into()))
    }

    /// A row that breaks the unit invariants was written behind our back.
    fn validated(&self, unit: WorkUnit) -> Result<WorkUnit> {
        unit.check_invariants().map_err(|e| Error::StoreCorrupt {
            path: self
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(":memory:")),
            reason: format!("unit {}: {e}", unit.id),
        })?;
        Ok(unit)
    }

    pub fn schema_version(&self) -> Result<i64> {
        migration::current_version(&*self.conn()?)
    }

    /// Insert a new unit with its initial history.
    pub fn create(&self, unit: &WorkUnit) -> Result<()> {
        unit.check_invariants()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM work_units WHERE id = ?1",
                [unit.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(Error::UnitExists(unit.id.to_string()));
        }

        tx.execute(
            &format!(
                "INSERT INTO work_units ({UNIT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                unit.id.as_str(),
                unit.phase.as_str(),
                unit.status.as_str(),
                unit.worktree.as_ref().map(|p| p.to_string_lossy().into_owned()),
                json_set(&unit.blocked_by)?,
                unit.attention_reason,
                json_set(&unit.conflicts_with)?,
                unit.pending_answer,
                unit.completion_retries,
                unit.session_id,
                json_set(&unit.footprint)?,
                unit.priority,
                unit.created_at.to_rfc3339(),
                unit.updated_at.to_rfc3339(),
            ],
        )?;
        for entry in &unit.history {
            insert_history(&tx, &unit.id, entry)?;
        }
        tx.commit()?;
        debug!(unit = %unit.id, "unit created");
        Ok(())
    }

    pub fn get(&self, id: &UnitId) -> Result<Option<WorkUnit>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = ?1"),
                [id.as_str()],
                UnitRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let history = read_history(&conn, id)?;
                Ok(Some(self.validated(row.into_unit(history)?)?))
            }
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing unit is an error.
    pub fn load(&self, id: &UnitId) -> Result<WorkUnit> {
        self.get(id)?
            .ok_or_else(|| Error::UnitNotFound(id.to_string()))
    }

    /// Persist the unit's current fields and any history lines it gained.
    ///
    /// A unit whose history is shorter than what is stored was read before a
    /// concurrent write and is rejected instead of overwriting it.
    pub fn update(&self, unit: &WorkUnit) -> Result<()> {
        unit.check_invariants()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored: i64 = tx.query_row(
            "SELECT count(*) FROM unit_history WHERE unit_id = ?1",
            [unit.id.as_str()],
            |row| row.get(0),
        )?;
        let stored = stored as usize;
        if unit.history.len() < stored {
            return Err(Error::InvalidState(format!(
                "stale copy of {}: {} history entries, store has {stored}",
                unit.id,
                unit.history.len()
            )));
        }

        let changed = tx.execute(
            "UPDATE work_units SET phase = ?2, status = ?3, worktree = ?4, blocked_by = ?5, \
             attention_reason = ?6, conflicts_with = ?7, pending_answer = ?8, \
             completion_retries = ?9, session_id = ?10, footprint = ?11, priority = ?12, \
             updated_at = ?13 WHERE id = ?1",
            params![
                unit.id.as_str(),
                unit.phase.as_str(),
                unit.status.as_str(),
                unit.worktree.as_ref().map(|p| p.to_string_lossy().into_owned()),
                json_set(&unit.blocked_by)?,
                unit.attention_reason,
                json_set(&unit.conflicts_with)?,
                unit.pending_answer,
                unit.completion_retries,
                unit.session_id,
                json_set(&unit.footprint)?,
                unit.priority,
                unit.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::UnitNotFound(unit.id.to_string()));
        }

        for entry in &unit.history[stored..] {
            insert_history(&tx, &unit.id, entry)?;
        }
        tx.commit()?;
        debug!(unit = %unit.id, status = %unit.status, phase = %unit.phase, "unit updated");
        Ok(())
    }

    /// Units ordered by priority (high first) then age, optionally filtered.
    pub fn list(&self, status: Option<UnitStatus>) -> Result<Vec<WorkUnit>> {
        let conn = self.conn()?;
        let order = "ORDER BY priority DESC, created_at ASC, id ASC";
        let rows: Vec<UnitRow> = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {UNIT_COLUMNS} FROM work_units WHERE status = ?1 {order}"
                ))?;
                let rows = stmt.query_map([status.as_str()], UnitRow::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {UNIT_COLUMNS} FROM work_units {order}"))?;
                let rows = stmt.query_map([], UnitRow::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        rows.into_iter()
            .map(|row| {
                let id = UnitId::new(row.id.clone())?;
                let history = read_history(&conn, &id)?;
                self.validated(row.into_unit(history)?)
            })
            .collect()
    }

    /// Append a history line directly, outside a status change.
    pub fn append_history(&self, id: &UnitId, entry: &HistoryEntry) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE work_units SET updated_at = ?2 WHERE id = ?1",
            params![id.as_str(), entry.at.to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(Error::UnitNotFound(id.to_string()));
        }
        insert_history(&tx, id, entry)?;
        tx.commit()?;
        Ok(())
    }

    pub fn history(&self, id: &UnitId) -> Result<Vec<HistoryEntry>> {
        read_history(&*self.conn()?, id)
    }

    /// Remove a unit, its history and any verdicts naming it.
    pub fn delete(&self, id: &UnitId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM work_units WHERE id = ?1", [id.as_str()])?;
        tx.execute("DELETE FROM unit_history WHERE unit_id = ?1", [id.as_str()])?;
        tx.execute(
            "DELETE FROM conflict_verdicts WHERE unit_a = ?1 OR unit_b = ?1",
            [id.as_str()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Number of units per status; every status is present.
    pub fn counts(&self) -> Result<BTreeMap<UnitStatus, usize>> {
        let conn = self.conn()?;
        let mut counts: BTreeMap<UnitStatus, usize> =
            UnitStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut stmt = conn.prepare("SELECT status, count(*) FROM work_units GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            counts.insert(status.parse()?, n as usize);
        }
        Ok(counts)
    }

    /// Upsert an operator verdict for a pair.
    pub fn record_verdict(&self, pair: &UnitPair, verdict: Verdict) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO conflict_verdicts (unit_a, unit_b, verdict, decided_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(unit_a, unit_b) DO UPDATE SET
                 verdict = excluded.verdict, decided_at = excluded.decided_at",
            params![
                pair.first.as_str(),
                pair.second.as_str(),
                verdict.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn verdicts(&self) -> Result<VerdictBook> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT unit_a, unit_b, verdict FROM conflict_verdicts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut book = VerdictBook::new();
        for row in rows {
            let (a, b, verdict) = row?;
            book.insert(UnitPair::new(UnitId::new(a)?, UnitId::new(b)?)?, verdict.parse()?);
        }
        Ok(book)
    }
}

fn insert_history(tx: &Transaction<'_>, id: &UnitId, entry: &HistoryEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO unit_history (unit_id, at, phase, status, note) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.as_str(),
            entry.at.to_rfc3339(),
            entry.phase.as_str(),
            entry.status.as_str(),
            entry.note
        ],
    )?;
    Ok(())
}

fn read_history(conn: &Connection, id: &UnitId) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT at, phase, status, note FROM unit_history WHERE unit_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([id.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;
    let mut history = Vec::new();
    for row in rows {
        let (at, phase, status, note) = row?;
        history.push(HistoryEntry {
            at: parse_time(&at)?,
            phase: phase.parse()?,
            status: status.parse()?,
            note,
        });
    }
    Ok(history)
}
