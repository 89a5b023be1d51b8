//! Domain types: environments, tasks, executions, and log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, ScriptGuardError};

// ─── Environments ──────────────────────────────────────────

/// Where an environment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// Listed under `[[environments]]` in config.
    Declared,
    /// Found by `conda env list`.
    Conda,
    /// Interpreter found on PATH.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Discovered,
    Missing,
}

/// A named interpreter usable by tasks. Produced whole by a scan, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    /// Interpreter executable the script is handed to.
    pub executable: String,
    pub kind: EnvironmentKind,
    pub status: EnvironmentStatus,
}

impl Environment {
    /// Build an environment, checking the executable for availability.
    pub fn detect(id: &str, name: &str, executable: &str, kind: EnvironmentKind) -> Self {
        let status = if Path::new(executable).is_file() {
            EnvironmentStatus::Discovered
        } else {
            EnvironmentStatus::Missing
        };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            executable: executable.to_string(),
            kind,
            status,
        }
    }

    /// Discovered at scan time and the executable is still on disk now.
    pub fn is_available(&self) -> bool {
        self.status == EnvironmentStatus::Discovered && Path::new(&self.executable).is_file()
    }
}

// ─── Notification channels ─────────────────────────────────

/// Failure-alert channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// DingTalk group robot.
    DingTalk,
    /// WeCom (WeChat Work) group robot.
    WeCom,
    /// Generic JSON webhook.
    Webhook,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::DingTalk, ChannelKind::WeCom, ChannelKind::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::DingTalk => "dingtalk",
            ChannelKind::WeCom => "wecom",
            ChannelKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ScriptGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dingtalk" => Ok(ChannelKind::DingTalk),
            "wecom" => Ok(ChannelKind::WeCom),
            "webhook" => Ok(ChannelKind::Webhook),
            other => Err(ScriptGuardError::validation(format!(
                "unknown notification channel: {other}"
            ))),
        }
    }
}

// ─── Tasks ─────────────────────────────────────────────────

/// Schedule sentinel for tasks that only run on demand.
pub const MANUAL_SCHEDULE: &str = "manual";

fn default_schedule() -> String { MANUAL_SCHEDULE.into() }
fn bool_true() -> bool { true }

/// User-supplied task fields for create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub environment_id: String,
    pub script_path: String,
    /// Cron expression(s) separated by `;`, or `manual`.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notify_channel: Option<ChannelKind>,
    /// Overrides the global timeout; 0 means unlimited.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl TaskDraft {
    pub fn new(name: &str, environment_id: &str, script_path: &str) -> Self {
        Self {
            name: name.to_string(),
            environment_id: environment_id.to_string(),
            script_path: script_path.to_string(),
            schedule: default_schedule(),
            enabled: true,
            notify_channel: None,
            timeout_seconds: None,
        }
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.schedule = schedule.to_string();
        self
    }

    pub fn with_channel(mut self, channel: ChannelKind) -> Self {
        self.notify_channel = Some(channel);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A persisted task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub environment_id: String,
    pub script_path: String,
    pub schedule: String,
    pub enabled: bool,
    pub notify_channel: Option<ChannelKind>,
    pub timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// New task with a freshly generated id.
    pub fn from_draft(draft: TaskDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            environment_id: draft.environment_id,
            script_path: draft.script_path,
            schedule: draft.schedule.trim().to_string(),
            enabled: draft.enabled,
            notify_channel: draft.notify_channel,
            timeout_seconds: draft.timeout_seconds,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the editable fields; id and created_at are kept.
    pub fn apply(&mut self, draft: TaskDraft, now: DateTime<Utc>) {
        self.name = draft.name.trim().to_string();
        self.environment_id = draft.environment_id;
        self.script_path = draft.script_path;
        self.schedule = draft.schedule.trim().to_string();
        self.enabled = draft.enabled;
        self.notify_channel = draft.notify_channel;
        self.timeout_seconds = draft.timeout_seconds;
        self.updated_at = now;
    }

    pub fn to_draft(&self) -> TaskDraft {
        TaskDraft {
            name: self.name.clone(),
            environment_id: self.environment_id.clone(),
            script_path: self.script_path.clone(),
            schedule: self.schedule.clone(),
            enabled: self.enabled,
            notify_channel: self.notify_channel,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

// ─── Executions ────────────────────────────────────────────

/// Why an execution was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

impl FromStr for Trigger {
    type Err = ScriptGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "manual" => Ok(Trigger::Manual),
            other => Err(ScriptGuardError::validation(format!("unknown trigger: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Terminal outcomes that raise a failure alert.
    pub fn is_alerting(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    fn can_become(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed)
                | (Running, Success) | (Running, Failed) | (Running, Timeout) | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ScriptGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(ScriptGuardError::validation(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// One run of a task's script.
///
/// `task_id` and `task_name` are a snapshot taken at submit time; the task may
/// have been deleted since, in which case the id no longer resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub trigger: Trigger,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn pending(task: &Task, trigger: Trigger, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            trigger,
            status: ExecutionStatus::Pending,
            submitted_at: now,
            start_time: None,
            end_time: None,
            duration_ms: None,
            exit_code: None,
            error_message: None,
        }
    }

    /// Pending → Running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ExecutionStatus::Running)?;
        self.start_time = Some(now);
        Ok(())
    }

    /// Move to a terminal status; stamps end time and duration.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(ScriptGuardError::validation(format!(
                "{status} is not a terminal status"
            )));
        }
        self.transition(status)?;
        self.end_time = Some(now);
        self.duration_ms = self
            .start_time
            .map(|started| (now - started).num_milliseconds().max(0));
        self.exit_code = exit_code;
        self.error_message = error_message;
        Ok(())
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_become(next) {
            return Err(ScriptGuardError::validation(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

// ─── Log records ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl FromStr for LogStream {
    type Err = ScriptGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(ScriptGuardError::validation(format!("unknown log stream: {other}"))),
        }
    }
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub execution_id: String,
    pub task_id: String,
    /// Execution-wide order, gapless from 1.
    pub sequence: u64,
    pub stream: LogStream,
    /// Line number within `stream`, from 1.
    pub stream_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}
