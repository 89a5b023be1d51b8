//! Task store: validated CRUD over task definitions.
//!
//! Every write is mirrored into the scheduler before the call returns, so a
//! caller never observes a stored task the scheduler disagrees with.

use chrono::Utc;
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::{Task, TaskDraft};
use std::sync::Arc;

use crate::cron::Schedule;
use crate::engine::SchedulerHandle;
use crate::environments::EnvironmentRegistry;
use crate::persistence::SchedulerDb;

/// Longest per-task timeout accepted, in seconds.
pub const MAX_TASK_TIMEOUT_SECS: u64 = 86_400;

#[derive(Clone)]
pub struct TaskStore {
    db: Arc<SchedulerDb>,
    registry: Arc<EnvironmentRegistry>,
    scheduler: SchedulerHandle,
}

impl TaskStore {
    pub fn new(db: Arc<SchedulerDb>, registry: Arc<EnvironmentRegistry>, scheduler: SchedulerHandle) -> Self {
        Self {
            db,
            registry,
            scheduler,
        }
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Result<Vec<Task>> {
        self.db.list_tasks()
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.db
            .get_task(id)?
            .ok_or_else(|| ScriptGuardError::not_found("Task", id))
    }

    pub async fn create(&self, draft: TaskDraft) -> Result<Task> {
        self.validate(&draft).await?;
        let task = Task::from_draft(draft, Utc::now());
        self.db.insert_task(&task)?;
        self.sync_scheduler(&task).await;
        tracing::info!("📅 Task added: '{}' ({})", task.name, task.id);
        Ok(task)
    }

    pub async fn update(&self, id: &str, draft: TaskDraft) -> Result<Task> {
        let mut task = self.get(id)?;
        self.validate(&draft).await?;
        task.apply(draft, Utc::now());
        if !self.db.update_task(&task)? {
            return Err(ScriptGuardError::not_found("Task", id));
        }
        self.sync_scheduler(&task).await;
        tracing::info!("📝 Task updated: '{}' ({})", task.name, task.id);
        Ok(task)
    }

    /// Unschedule, then delete. History rows for the task are kept.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let task = self.get(id)?;
        if let Err(e) = self.scheduler.remove(id).await {
            tracing::warn!("⚠️ Scheduler unavailable while deleting '{}': {e}", task.name);
        }
        match self.db.delete_task(id) {
            Ok(true) => {
                tracing::info!("🗑️ Task removed: '{}' ({})", task.name, task.id);
                Ok(())
            }
            Ok(false) => Err(ScriptGuardError::not_found("Task", id)),
            Err(e) => {
                // Still stored, so it must stay scheduled.
                self.sync_scheduler(&task).await;
                Err(e)
            }
        }
    }

    async fn validate(&self, draft: &TaskDraft) -> Result<()> {
        if draft.name.trim().is_empty() {
            return Err(ScriptGuardError::validation("task name must not be empty"));
        }
        if draft.script_path.trim().is_empty() {
            return Err(ScriptGuardError::validation("script path must not be empty"));
        }
        if let Some(secs) = draft.timeout_seconds
            && secs > MAX_TASK_TIMEOUT_SECS
        {
            return Err(ScriptGuardError::validation(format!(
                "timeout must be 0 (unlimited) or at most {MAX_TASK_TIMEOUT_SECS} seconds"
            )));
        }
        Schedule::parse(&draft.schedule)?;
        self.registry
            .resolve(&draft.environment_id)
            .await
            .map_err(|_| {
                ScriptGuardError::validation(format!(
                    "unknown environment '{}'",
                    draft.environment_id
                ))
            })?;
        Ok(())
    }

    async fn sync_scheduler(&self, task: &Task) {
        if let Err(e) = self.scheduler.upsert(task.clone()).await {
            tracing::warn!("⚠️ Scheduler unavailable for '{}': {e}", task.name);
        }
    }
}
