//! Pipeline state store: the trust root for crash recovery.
//!
//! SQLite-backed record of per-paper processing status, run bookkeeping and
//! batch checkpoints. Writes are synchronous and durable; a crashed
//! orchestrator finds the last checkpoint intact and skips everything
//! already completed. Completion is monotonic across runs: once any run has
//! completed a paper, `is_completed` reports it until the caller explicitly
//! purges.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::PaperStatus;

/// The trust root failed; the run must terminate.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Could not create state directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Durable batch marker; advances only after a batch's writes completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub run_id: i64,
    pub batch_seq: u64,
    pub last_completed_paper_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-status counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// SQLite-backed state store.
///
/// The database is opened once; all access goes through a single internally
/// serialized connection.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        // Durability first: every mark must survive a crash.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("State store opened: {}", db_path.display());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("state connection poisoned");
        conn.execute_batch(
            r#"
            -- One row per orchestrator invocation
            CREATE TABLE IF NOT EXISTS runs (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                config TEXT,
                stats TEXT
            );

            -- Processing status per (run, paper)
            CREATE TABLE IF NOT EXISTS paper_state (
                run_id INTEGER NOT NULL REFERENCES runs(run_id),
                paper_id TEXT NOT NULL,
                status TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                PRIMARY KEY (run_id, paper_id)
            );

            -- Durable batch markers for resume
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(run_id),
                batch_seq INTEGER NOT NULL,
                last_completed_paper_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_paper_state_paper
                ON paper_state(paper_id, status);
            CREATE INDEX IF NOT EXISTS idx_paper_state_run_status
                ON paper_state(run_id, status);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_run
                ON checkpoints(run_id, batch_seq);
        "#,
        )?;
        Ok(())
    }

    /// Register a new run and return its id.
    pub fn begin_run(&self, city: &str, config_json: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock().expect("state connection poisoned");
        conn.execute(
            "INSERT INTO runs (city, started_at, status, config) VALUES (?, ?, 'running', ?)",
            params![city, Utc::now().to_rfc3339(), config_json],
        )?;
        let run_id = conn.last_insert_rowid();
        info!("Started pipeline run {} for {}", run_id, city);
        Ok(run_id)
    }

    /// Close out a run with its terminal status and serialized counters.
    pub fn finish_run(&self, run_id: i64, status: &str, stats_json: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().expect("state connection poisoned");
        conn.execute(
            "UPDATE runs SET ended_at = ?, status = ?, stats = ? WHERE run_id = ?",
            params![Utc::now().to_rfc3339(), status, stats_json, run_id],
        )?;
        info!("Pipeline run {} ended with status: {}", run_id, status);
        Ok(())
    }

    /// Record a status transition for one paper.
    ///
    /// `completed` is sticky within a run: attempts to move a completed
    /// paper to any other status are ignored. Marking `failed` increments
    /// the retry counter.
    pub fn mark(
        &self,
        run_id: i64,
        paper_id: &str,
        status: PaperStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let retry_bump = i64::from(status == PaperStatus::Failed);
        let conn = self.conn.lock().expect("state connection poisoned");
        conn.execute(
            r#"
            INSERT INTO paper_state
                (run_id, paper_id, status, first_seen, updated_at, retry_count, last_error)
            VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)
            ON CONFLICT(run_id, paper_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                retry_count = paper_state.retry_count + ?5,
                last_error = excluded.last_error
            WHERE paper_state.status != 'completed'
            "#,
            params![
                run_id,
                paper_id,
                status.as_str(),
                now,
                retry_bump,
                error
            ],
        )?;
        Ok(())
    }

    /// Whether ANY run has ever completed this paper.
    pub fn is_completed(&self, paper_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM paper_state WHERE paper_id = ? AND status = 'completed'",
            params![paper_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Paper ids completed in any run, for bulk skip checks.
    pub fn completed_paper_ids(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let mut stmt =
            conn.prepare("SELECT DISTINCT paper_id FROM paper_state WHERE status = 'completed'")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn write_checkpoint(
        &self,
        run_id: i64,
        batch_seq: u64,
        last_completed_paper_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("state connection poisoned");
        conn.execute(
            "INSERT INTO checkpoints (run_id, batch_seq, last_completed_paper_id, created_at)
             VALUES (?, ?, ?, ?)",
            params![
                run_id,
                batch_seq as i64,
                last_completed_paper_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!("Checkpoint: run {} batch {}", run_id, batch_seq);
        Ok(())
    }

    pub fn latest_checkpoint(&self, run_id: i64) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let checkpoint = conn
            .query_row(
                "SELECT run_id, batch_seq, last_completed_paper_id, created_at
                 FROM checkpoints WHERE run_id = ?
                 ORDER BY batch_seq DESC LIMIT 1",
                params![run_id],
                |row| {
                    Ok(Checkpoint {
                        run_id: row.get(0)?,
                        batch_seq: row.get::<_, i64>(1)? as u64,
                        last_completed_paper_id: row.get(2)?,
                        created_at: parse_datetime(&row.get::<_, String>(3)?),
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    /// Papers marked failed in the given run.
    pub fn failed_paper_ids(&self, run_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let mut stmt =
            conn.prepare("SELECT paper_id FROM paper_state WHERE run_id = ? AND status = 'failed'")?;
        let ids = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Move failed papers of a run back to pending for explicit retry.
    pub fn reset_failed(&self, run_id: i64) -> Result<usize> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let changed = conn.execute(
            "UPDATE paper_state SET status = 'pending', updated_at = ?
             WHERE run_id = ? AND status = 'failed'",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        info!("Reset {} failed paper(s) to pending", changed);
        Ok(changed)
    }

    /// Downgrade every in-progress paper of a run to failed. Used when a
    /// batch aborts and at startup for papers orphaned by a crash.
    pub fn fail_in_progress(&self, run_id: i64, error: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let changed = conn.execute(
            "UPDATE paper_state
             SET status = 'failed', updated_at = ?, retry_count = retry_count + 1, last_error = ?
             WHERE run_id = ? AND status = 'in_progress'",
            params![Utc::now().to_rfc3339(), error, run_id],
        )?;
        if changed > 0 {
            debug!("Downgraded {} in-progress paper(s) to failed", changed);
        }
        Ok(changed)
    }

    /// Per-status counters for one run.
    pub fn summarize(&self, run_id: i64) -> Result<StateSummary> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM paper_state WHERE run_id = ? GROUP BY status",
        )?;
        let mut summary = StateSummary::default();
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (status, count) = row?;
            match PaperStatus::from_str(&status) {
                Some(PaperStatus::Pending) => summary.pending = count,
                Some(PaperStatus::InProgress) => summary.in_progress = count,
                Some(PaperStatus::Completed) => summary.completed = count,
                Some(PaperStatus::Failed) => summary.failed = count,
                Some(PaperStatus::Skipped) => summary.skipped = count,
                None => {}
            }
        }
        Ok(summary)
    }

    /// Most recent runs, newest first: (run_id, city, status, started_at).
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<(i64, String, String, String)>> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT run_id, city, status, started_at FROM runs
             ORDER BY run_id DESC LIMIT ?",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Id of the most recent run, if any.
    pub fn latest_run_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().expect("state connection poisoned");
        let run_id = conn
            .query_row("SELECT MAX(run_id) FROM runs", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(run_id)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_recorded() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.begin_run("augsburg", None).unwrap();

        store
            .mark(run, "paper-1", PaperStatus::InProgress, None)
            .unwrap();
        assert!(!store.is_completed("paper-1").unwrap());

        store
            .mark(run, "paper-1", PaperStatus::Completed, None)
            .unwrap();
        assert!(store.is_completed("paper-1").unwrap());
    }

    #[test]
    fn completed_is_sticky_within_a_run() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.begin_run("augsburg", None).unwrap();

        store
            .mark(run, "paper-1", PaperStatus::Completed, None)
            .unwrap();
        store
            .mark(run, "paper-1", PaperStatus::Failed, Some("too late"))
            .unwrap();

        assert!(store.is_completed("paper-1").unwrap());
        let summary = store.summarize(run).unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn completion_is_visible_across_runs() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.begin_run("augsburg", None).unwrap();
        store
            .mark(first, "paper-1", PaperStatus::Completed, None)
            .unwrap();

        let second = store.begin_run("augsburg", None).unwrap();
        assert!(store.is_completed("paper-1").unwrap());
        let summary = store.summarize(second).unwrap();
        assert_eq!(summary.completed, 0);
    }

    #[test]
    fn failed_marks_carry_error_and_retry_count() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.begin_run("augsburg", None).unwrap();

        store
            .mark(run, "paper-1", PaperStatus::InProgress, None)
            .unwrap();
        store
            .mark(run, "paper-1", PaperStatus::Failed, Some("HTTP 404"))
            .unwrap();

        let failed = store.failed_paper_ids(run).unwrap();
        assert!(failed.contains("paper-1"));

        let reset = store.reset_failed(run).unwrap();
        assert_eq!(reset, 1);
        assert!(store.failed_paper_ids(run).unwrap().is_empty());
    }

    #[test]
    fn checkpoints_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.begin_run("augsburg", None).unwrap();

        assert!(store.latest_checkpoint(run).unwrap().is_none());

        store.write_checkpoint(run, 1, "paper-10").unwrap();
        store.write_checkpoint(run, 2, "paper-20").unwrap();

        let checkpoint = store.latest_checkpoint(run).unwrap().unwrap();
        assert_eq!(checkpoint.batch_seq, 2);
        assert_eq!(checkpoint.last_completed_paper_id, "paper-20");
    }

    #[test]
    fn crashed_in_progress_papers_are_downgraded() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.begin_run("augsburg", None).unwrap();

        store
            .mark(run, "paper-1", PaperStatus::InProgress, None)
            .unwrap();
        store
            .mark(run, "paper-2", PaperStatus::Completed, None)
            .unwrap();

        let changed = store.fail_in_progress(run, "batch aborted").unwrap();
        assert_eq!(changed, 1);

        let summary = store.summarize(run).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pipeline_state.db");

        {
            let store = StateStore::open(&db_path).unwrap();
            let run = store.begin_run("augsburg", None).unwrap();
            store
                .mark(run, "paper-1", PaperStatus::Completed, None)
                .unwrap();
            store.write_checkpoint(run, 1, "paper-1").unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.is_completed("paper-1").unwrap());
        let run_id = store.latest_run_id().unwrap().unwrap();
        let checkpoint = store.latest_checkpoint(run_id).unwrap().unwrap();
        assert_eq!(checkpoint.last_completed_paper_id, "paper-1");
    }
}
