//! SQLite audit log of completed sync attempts.
//!
//! Purely informational: sync state and the generation counter live in
//! memory and are never restored from here.

use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::{SyncOutcome, SyncResult};
use crate::types::{SyncReason, Timestamp};

/// Sync records kept by default. Older rows are pruned.
pub const DEFAULT_RETENTION: usize = 1000;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One row of the `sync_attempts` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: i64,
    pub reason: SyncReason,
    pub outcome: SyncOutcome,
    pub message: String,
    pub details: Option<String>,
    pub duration_ms: u64,
    pub timestamp: Timestamp,
    pub attempts: u32,
    pub generation: u64,
    pub commit_hash: Option<String>,
}

pub struct SyncHistory {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "SELECT id, reason, outcome, message, details, duration_ms, \
     timestamp, attempts, generation, commit_hash FROM sync_attempts";

impl SyncHistory {
    /// Open or create the history database at the given path.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Initialize the database schema. This is idempotent.
    pub fn init(&self) -> Result<(), HistoryError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_attempts (
                id INTEGER PRIMARY KEY,
                reason TEXT NOT NULL,
                outcome TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT,
                duration_ms INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                commit_hash TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_attempts_timestamp ON sync_attempts(timestamp);
            ",
        )?;
        Ok(())
    }

    /// Record a completed sync. `AlreadyInProgress` no-ops are not stored
    /// and return `None`.
    pub fn record(&self, result: &SyncResult) -> Result<Option<i64>, HistoryError> {
        if result.outcome == SyncOutcome::AlreadyInProgress {
            return Ok(None);
        }

        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_attempts
                (reason, outcome, message, details, duration_ms, timestamp, attempts,
                 generation, commit_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.reason.as_str(),
                result.outcome.as_str(),
                result.message,
                result.details,
                result.duration_ms as i64,
                result.timestamp as i64,
                result.attempts,
                result.generation as i64,
                result.commit.as_ref().map(|c| c.hash.as_str()),
            ],
        )?;
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Most recent attempts first.
    pub fn recent(&self, limit: usize) -> Result<Vec<SyncRecord>, HistoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS))?;
        let rows = stmt.query_map(params![limit as i64], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn last_success(&self) -> Result<Option<SyncRecord>, HistoryError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("{} WHERE outcome = ?1 ORDER BY id DESC LIMIT 1", SELECT_COLUMNS),
                params![SyncOutcome::Synced.as_str()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn count(&self) -> Result<u64, HistoryError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM sync_attempts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete all but the newest `keep` rows. Returns the number deleted.
    pub fn prune(&self, keep: usize) -> Result<usize, HistoryError> {
        let deleted = self.conn().execute(
            "DELETE FROM sync_attempts WHERE id NOT IN
                (SELECT id FROM sync_attempts ORDER BY id DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        Ok(deleted)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    let reason: String = row.get(1)?;
    let outcome: String = row.get(2)?;
    Ok(SyncRecord {
        id: row.get(0)?,
        reason: reason.parse().map_err(|e: String| text_error(1, e))?,
        outcome: outcome.parse().map_err(|e: String| text_error(2, e))?,
        message: row.get(3)?,
        details: row.get(4)?,
        duration_ms: row.get::<_, i64>(5)? as u64,
        timestamp: row.get::<_, i64>(6)? as u64,
        attempts: row.get(7)?,
        generation: row.get::<_, i64>(8)? as u64,
        commit_hash: row.get(9)?,
    })
}

fn text_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::mirror::HeadCommit;
    use crate::types::now_millis;

    fn create_test_history() -> (SyncHistory, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("state").join("history.db");
        let history = SyncHistory::open(&db_path).unwrap();
        history.init().unwrap();
        (history, dir)
    }

    fn result(outcome: SyncOutcome, generation: u64) -> SyncResult {
        SyncResult {
            outcome,
            success: outcome == SyncOutcome::Synced,
            message: format!("{} run", outcome.as_str()),
            details: (outcome == SyncOutcome::Failed).then(|| "git fetch failed: boom".to_string()),
            duration_ms: 1234,
            timestamp: now_millis(),
            reason: SyncReason::Scheduled,
            attempts: 2,
            generation,
            commit: (outcome == SyncOutcome::Synced).then(|| HeadCommit {
                hash: format!("{:040}", generation),
                message: "Update".to_string(),
                author: "a <a@b>".to_string(),
                timestamp: 0,
            }),
        }
    }

    #[test]
    fn init_is_idempotent() {
        let (history, _dir) = create_test_history();
        history.init().unwrap();
        assert_eq!(history.count().unwrap(), 0);
    }

    #[test]
    fn records_roundtrip_newest_first() {
        let (history, _dir) = create_test_history();
        let first = result(SyncOutcome::Synced, 1);
        let second = result(SyncOutcome::Failed, 2);
        history.record(&first).unwrap().unwrap();
        history.record(&second).unwrap().unwrap();

        let recent = history.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].generation, 2);
        assert_eq!(recent[0].outcome, SyncOutcome::Failed);
        assert_eq!(recent[0].details.as_deref(), Some("git fetch failed: boom"));
        assert!(recent[0].commit_hash.is_none());

        assert_eq!(recent[1].generation, 1);
        assert_eq!(recent[1].reason, SyncReason::Scheduled);
        assert_eq!(recent[1].duration_ms, 1234);
        assert_eq!(recent[1].attempts, 2);
        assert_eq!(recent[1].timestamp, first.timestamp);
        assert_eq!(recent[1].commit_hash.as_deref(), Some(first.commit.unwrap().hash.as_str()));

        assert_eq!(history.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn no_op_results_are_not_recorded() {
        let (history, _dir) = create_test_history();
        assert_eq!(
            history.record(&result(SyncOutcome::AlreadyInProgress, 0)).unwrap(),
            None
        );
        assert_eq!(history.count().unwrap(), 0);
    }

    #[test]
    fn last_success_skips_failures() {
        let (history, _dir) = create_test_history();
        assert!(history.last_success().unwrap().is_none());

        history.record(&result(SyncOutcome::Synced, 1)).unwrap();
        history.record(&result(SyncOutcome::Partial, 2)).unwrap();
        history.record(&result(SyncOutcome::Failed, 3)).unwrap();

        let last = history.last_success().unwrap().unwrap();
        assert_eq!(last.generation, 1);
    }

    #[test]
    fn prune_keeps_newest() {
        let history = SyncHistory::open_in_memory().unwrap();
        history.init().unwrap();
        for generation in 1..=5 {
            history.record(&result(SyncOutcome::Synced, generation)).unwrap();
        }

        assert_eq!(history.prune(2).unwrap(), 3);
        let generations: Vec<u64> = history
            .recent(10)
            .unwrap()
            .into_iter()
            .map(|r| r.generation)
            .collect();
        assert_eq!(generations, vec![5, 4]);
    }

    #[test]
    fn history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("history.db");
        {
            let history = SyncHistory::open(&db_path).unwrap();
            history.init().unwrap();
            history.record(&result(SyncOutcome::Synced, 7)).unwrap();
        }
        let history = SyncHistory::open(&db_path).unwrap();
        history.init().unwrap();
        assert_eq!(history.recent(5).unwrap()[0].generation, 7);
    }
}
