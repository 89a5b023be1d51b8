//! Execution and log history.
//!
//! Executions are appended once and then only moved forward through their
//! status lifecycle; a row that already reached a terminal status is never
//! rewritten. Log records are append-only.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use scriptguard_core::error::Result;
use scriptguard_core::types::{Execution, LogRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::persistence::{SchedulerDb, fmt_ts, get_opt_ts, get_ts, parse_text};

/// Hard cap on rows returned by one query.
pub const MAX_QUERY_LIMIT: usize = 5000;

/// Non-positive or oversized limits mean "as many as allowed".
pub fn clamp_limit(limit: Option<i64>) -> usize {
    match limit {
        Some(n) if n > 0 => (n as usize).min(MAX_QUERY_LIMIT),
        _ => MAX_QUERY_LIMIT,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub task_id: Option<String>,
    pub execution_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub execution_id: Option<String>,
    pub task_id: Option<String>,
    pub limit: Option<i64>,
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub executions: usize,
    pub logs: usize,
}

/// Execution/log store over the shared database.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Arc<SchedulerDb>,
}

impl ExecutionStore {
    pub fn new(db: Arc<SchedulerDb>) -> Self {
        Self { db }
    }

    pub fn append(&self, exec: &Execution) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO executions
                 (id, task_id, task_name, trigger_source, status, submitted_at, start_time,
                  end_time, duration_ms, exit_code, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    exec.id,
                    exec.task_id,
                    exec.task_name,
                    exec.trigger.as_str(),
                    exec.status.as_str(),
                    fmt_ts(&exec.submitted_at),
                    exec.start_time.as_ref().map(fmt_ts),
                    exec.end_time.as_ref().map(fmt_ts),
                    exec.duration_ms,
                    exec.exit_code,
                    exec.error_message,
                ],
            )
        })?;
        Ok(())
    }

    /// Persist a status change. Returns false if the stored row is already
    /// terminal (or missing) and was left untouched.
    pub fn update(&self, exec: &Execution) -> Result<bool> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET status = ?2, start_time = ?3, end_time = ?4,
                   duration_ms = ?5, exit_code = ?6, error_message = ?7
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![
                    exec.id,
                    exec.status.as_str(),
                    exec.start_time.as_ref().map(fmt_ts),
                    exec.end_time.as_ref().map(fmt_ts),
                    exec.duration_ms,
                    exec.exit_code,
                    exec.error_message,
                ],
            )
        })?;
        Ok(changed > 0)
    }

    /// Append a batch of log records in one transaction.
    pub fn append_logs(&self, records: &[LogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO execution_logs
                     (execution_id, task_id, sequence, stream, stream_sequence, timestamp, line)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for r in records {
                    stmt.execute(params![
                        r.execution_id,
                        r.task_id,
                        r.sequence as i64,
                        r.stream.as_str(),
                        r.stream_sequence as i64,
                        fmt_ts(&r.timestamp),
                        r.line,
                    ])?;
                }
            }
            tx.commit()
        })
    }

    pub fn append_log(&self, record: &LogRecord) -> Result<()> {
        self.append_logs(std::slice::from_ref(record))
    }

    pub fn get(&self, id: &str) -> Result<Option<Execution>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {EXEC_COLUMNS} FROM executions WHERE id = ?1"),
                [id],
                execution_from_row,
            )
            .optional()
        })
    }

    /// Most recent first.
    pub fn query_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        let limit = clamp_limit(query.limit) as i64;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXEC_COLUMNS} FROM executions
                 WHERE (?1 IS NULL OR task_id = ?1) AND (?2 IS NULL OR id = ?2)
                 ORDER BY submitted_at DESC, rowid DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![query.task_id, query.execution_id, limit],
                execution_from_row,
            )?;
            rows.collect()
        })
    }

    /// Most recent first (highest sequence first within an execution).
    pub fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let limit = clamp_limit(query.limit) as i64;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM execution_logs
                 WHERE (?1 IS NULL OR execution_id = ?1) AND (?2 IS NULL OR task_id = ?2)
                 ORDER BY rowid DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![query.execution_id, query.task_id, limit],
                log_from_row,
            )?;
            rows.collect()
        })
    }

    /// Last `n` stderr lines of an execution, oldest first.
    pub fn tail_stderr(&self, execution_id: &str, n: usize) -> Result<Vec<String>> {
        let mut lines = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT line FROM execution_logs
                 WHERE execution_id = ?1 AND stream = 'stderr'
                 ORDER BY sequence DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![execution_id, n as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })?;
        lines.reverse();
        Ok(lines)
    }

    /// Close out executions a previous process left unfinished.
    pub fn mark_interrupted(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET status = 'cancelled', end_time = ?1,
                   error_message = COALESCE(error_message, 'interrupted by service restart')
                 WHERE status IN ('pending', 'running')",
                [fmt_ts(&now)],
            )
        })
    }

    /// Delete executions that ended before `cutoff`, with their logs.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = fmt_ts(&cutoff);
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let logs = tx.execute(
                "DELETE FROM execution_logs WHERE execution_id IN
                   (SELECT id FROM executions WHERE end_time IS NOT NULL AND end_time < ?1)",
                [&cutoff],
            )?;
            let executions = tx.execute(
                "DELETE FROM executions WHERE end_time IS NOT NULL AND end_time < ?1",
                [&cutoff],
            )?;
            tx.commit()?;
            Ok(SweepReport { executions, logs })
        })
    }

    /// Reclaim the space freed by deletes. Must run outside a transaction.
    pub fn vacuum(&self) -> Result<()> {
        self.db.with_conn(|conn| conn.execute_batch("VACUUM"))
    }
}

const EXEC_COLUMNS: &str = "id, task_id, task_name, trigger_source, status, submitted_at, \
    start_time, end_time, duration_ms, exit_code, error_message";

const LOG_COLUMNS: &str =
    "execution_id, task_id, sequence, stream, stream_sequence, timestamp, line";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let trigger: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Execution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        task_name: row.get(2)?,
        trigger: parse_text(3, &trigger)?,
        status: parse_text(4, &status)?,
        submitted_at: get_ts(row, 5)?,
        start_time: get_opt_ts(row, 6)?,
        end_time: get_opt_ts(row, 7)?,
        duration_ms: row.get(8)?,
        exit_code: row.get(9)?,
        error_message: row.get(10)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    let stream: String = row.get(3)?;
    Ok(LogRecord {
        execution_id: row.get(0)?,
        task_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        stream: parse_text(3, &stream)?,
        stream_sequence: row.get::<_, i64>(4)? as u64,
        timestamp: get_ts(row, 5)?,
        line: row.get(6)?,
    })
}
