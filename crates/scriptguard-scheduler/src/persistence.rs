//! SQLite-backed persistence for tasks, execution history, and settings.
//! One connection behind a mutex: writes are serialized, WAL keeps readers cheap.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::Task;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// SQLite persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the database. `:memory:` gives a private in-memory store.
    pub fn open(path: &Path) -> Result<Self> {
        if path != Path::new(":memory:")
            && let Some(parent) = path.parent()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")
            .map_err(|e| db_err("DB pragma", e))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                environment_id TEXT NOT NULL,
                script_path TEXT NOT NULL,
                schedule TEXT NOT NULL DEFAULT 'manual',
                enabled INTEGER NOT NULL DEFAULT 1,
                notify_channel TEXT,             -- 'dingtalk', 'wecom', 'webhook'
                timeout_seconds INTEGER,         -- NULL = use global setting
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- No FK to tasks: history outlives deleted tasks.
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                trigger_source TEXT NOT NULL,    -- 'scheduled', 'manual'
                status TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                duration_ms INTEGER,
                exit_code INTEGER,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id, submitted_at);
            CREATE INDEX IF NOT EXISTS idx_executions_end ON executions(end_time);

            CREATE TABLE IF NOT EXISTS execution_logs (
                execution_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                stream TEXT NOT NULL,            -- 'stdout', 'stderr'
                stream_sequence INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                line TEXT NOT NULL,
                PRIMARY KEY (execution_id, sequence),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_logs_task ON execution_logs(task_id);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
            )
        })
    }

    /// Run a closure against the locked connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ScriptGuardError::Database(format!("Lock: {e}")))?;
        f(&mut conn).map_err(|e| db_err("Query", e))
    }

    // ─── Tasks ────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks
                 (id, name, environment_id, script_path, schedule, enabled, notify_channel,
                  timeout_seconds, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.id,
                    task.name,
                    task.environment_id,
                    task.script_path,
                    task.schedule,
                    task.enabled as i32,
                    task.notify_channel.map(|c| c.as_str()),
                    task.timeout_seconds.map(|s| s as i64),
                    fmt_ts(&task.created_at),
                    fmt_ts(&task.updated_at),
                ],
            )
        })?;
        Ok(())
    }

    /// Returns false when no row has this id.
    pub fn update_task(&self, task: &Task) -> Result<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET name = ?2, environment_id = ?3, script_path = ?4, schedule = ?5,
                   enabled = ?6, notify_channel = ?7, timeout_seconds = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    task.id,
                    task.name,
                    task.environment_id,
                    task.script_path,
                    task.schedule,
                    task.enabled as i32,
                    task.notify_channel.map(|c| c.as_str()),
                    task.timeout_seconds.map(|s| s as i64),
                    fmt_ts(&task.updated_at),
                ],
            )
        })?;
        Ok(changed > 0)
    }

    /// Returns false when no row has this id.
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let changed = self.with_conn(|conn| conn.execute("DELETE FROM tasks WHERE id = ?1", [id]))?;
        Ok(changed > 0)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()
        })
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, rowid"
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            rows.collect()
        })
    }

    // ─── Settings ─────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, fmt_ts(&Utc::now())],
            )
        })?;
        Ok(())
    }

    /// Insert defaults only where no value exists yet.
    pub fn seed_settings(&self, defaults: &[(&str, String)]) -> Result<()> {
        let now = fmt_ts(&Utc::now());
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in defaults {
                tx.execute(
                    "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, value, now],
                )?;
            }
            tx.commit()
        })
    }

    pub fn all_settings(&self) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }
}

const TASK_COLUMNS: &str = "id, name, environment_id, script_path, schedule, enabled, \
    notify_channel, timeout_seconds, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let channel: Option<String> = row.get(6)?;
    let timeout: Option<i64> = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        environment_id: row.get(2)?,
        script_path: row.get(3)?,
        schedule: row.get(4)?,
        enabled: row.get::<_, i32>(5)? != 0,
        notify_channel: channel.map(|c| parse_text(6, &c)).transpose()?,
        timeout_seconds: timeout.map(|s| s.max(0) as u64),
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

/// Fixed-width UTC timestamp; lexicographic order matches time order.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a text column through `FromStr`.
pub(crate) fn parse_text<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ScriptGuardError>,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn db_err(context: &str, e: rusqlite::Error) -> ScriptGuardError {
    ScriptGuardError::Database(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptguard_core::types::{ChannelKind, TaskDraft};

    fn sample(name: &str) -> Task {
        Task::from_draft(
            TaskDraft::new(name, "py39", "/srv/etl.py")
                .with_schedule("0 2 * * *")
                .with_channel(ChannelKind::DingTalk)
                .with_timeout(120),
            Utc::now(),
        )
    }

    #[test]
    fn test_task_roundtrip() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = sample("etl");
        db.insert_task(&task).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[test]
    fn test_list_in_creation_order() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let first = sample("first");
        let mut second = sample("second");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        db.insert_task(&second).unwrap();
        db.insert_task(&first).unwrap();

        let names: Vec<_> = db.list_tasks().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_update_and_delete_unknown() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = sample("ghost");
        assert!(!db.update_task(&task).unwrap());
        assert!(!db.delete_task(&task.id).unwrap());

        db.insert_task(&task).unwrap();
        assert!(db.delete_task(&task.id).unwrap());
        assert!(db.get_task(&task.id).unwrap().is_none());
    }

    #[test]
    fn test_settings_seed_does_not_overwrite() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.put_setting("max_concurrency", "2").unwrap();
        db.seed_settings(&[
            ("max_concurrency", "5".to_string()),
            ("log_retention_days", "30".to_string()),
        ])
        .unwrap();

        assert_eq!(db.get_setting("max_concurrency").unwrap().as_deref(), Some("2"));
        assert_eq!(db.get_setting("log_retention_days").unwrap().as_deref(), Some("30"));
        assert_eq!(db.all_settings().unwrap().len(), 2);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("scriptguard.db");
        let task = sample("persisted");
        {
            let db = SchedulerDb::open(&path).unwrap();
            db.insert_task(&task).unwrap();
            db.put_setting("timezone", "Asia/Shanghai").unwrap();
        }
        let db = SchedulerDb::open(&path).unwrap();
        assert_eq!(db.get_task(&task.id).unwrap().unwrap().name, "persisted");
        assert_eq!(db.get_setting("timezone").unwrap().as_deref(), Some("Asia/Shanghai"));
    }
}
