//! ScriptGuard service. Wires the components together and exposes the
//! operations the gateway and CLI call.

use scriptguard_core::config::ScriptGuardConfig;
use scriptguard_core::error::Result;
use scriptguard_core::types::{ChannelKind, Environment, Execution, LogRecord, Task, TaskDraft, Trigger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{Clock, ScheduledTask, SchedulerEngine, SchedulerHandle, SystemClock};
use crate::environments::EnvironmentRegistry;
use crate::executor::{EngineEvent, EngineOptions, ExecutionEngine, ExecutionTicket};
use crate::history::{ExecutionQuery, ExecutionStore, LogQuery, SweepReport};
use crate::limiter::GateStats;
use crate::notify::{DeliveryResult, Notifier};
use crate::persistence::SchedulerDb;
use crate::retention::{cleanup_now, spawn_retention};
use crate::settings::{SettingKey, SettingValue, Settings};
use crate::store::TaskStore;

pub struct ScriptGuard {
    registry: Arc<EnvironmentRegistry>,
    settings: Settings,
    history: ExecutionStore,
    tasks: TaskStore,
    engine: ExecutionEngine,
    notifier: Notifier,
    scheduler: SchedulerHandle,
    background: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl ScriptGuard {
    /// Open the database under `data_dir`, discover environments, and start
    /// the scheduler and retention loops.
    pub async fn start(config: &ScriptGuardConfig) -> Result<Self> {
        let db = SchedulerDb::open(&config.database_path())?;
        let registry = EnvironmentRegistry::from_config(&config.discovery, &config.environments);
        Self::start_with(config, db, registry, Arc::new(SystemClock)).await
    }

    /// Start from explicit parts.
    pub async fn start_with(
        config: &ScriptGuardConfig,
        db: SchedulerDb,
        registry: EnvironmentRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = Arc::new(db);
        let registry = Arc::new(registry);
        let settings = Settings::new(db.clone())?;
        let history = ExecutionStore::new(db.clone());
        let notifier = Notifier::new(settings.clone(), history.clone())?;

        let options = EngineOptions {
            kill_grace: Duration::from_millis(config.scheduler.kill_grace_ms),
            ..Default::default()
        };
        let engine = ExecutionEngine::new(
            db.clone(),
            registry.clone(),
            settings.clone(),
            Arc::new(notifier.clone()),
            options,
        );
        engine.recover_interrupted()?;

        // Scan before the clock loop starts so a due task never waits on it.
        let envs = registry.list().await;
        tracing::debug!("{} environment(s) ready", envs.len());

        let tasks = db.list_tasks()?;
        let mut background = Vec::with_capacity(2);
        let scheduler = if config.scheduler.fire_schedules {
            let (handle, scheduler_loop) = SchedulerEngine::new(
                clock,
                Arc::new(engine.clone()),
                settings.clone(),
                Duration::from_millis(config.scheduler.tick_interval_ms.max(10)),
            )
            .spawn(&tasks);
            background.push(scheduler_loop);
            handle
        } else {
            tracing::debug!("Schedule firing disabled for this process");
            SchedulerHandle::detached()
        };

        let stop = CancellationToken::new();
        let retention = spawn_retention(
            history.clone(),
            settings.clone(),
            Duration::from_secs(config.scheduler.retention_sweep_interval_secs.max(1)),
            stop.clone(),
        );
        background.push(retention);

        tracing::info!("🚀 ScriptGuard started with {} task(s)", tasks.len());
        Ok(Self {
            tasks: TaskStore::new(db, registry.clone(), scheduler.clone()),
            registry,
            settings,
            history,
            engine,
            notifier,
            scheduler,
            background: Mutex::new(background),
            stop,
        })
    }

    // ─── Environments ─────────────────────────────────────────

    pub async fn get_environments(&self, refresh: bool) -> Vec<Environment> {
        if refresh {
            self.registry.refresh().await
        } else {
            self.registry.list().await
        }
    }

    // ─── Tasks ────────────────────────────────────────────────

    pub fn get_tasks(&self) -> Result<Vec<Task>> {
        self.tasks.list()
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks.get(id)
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        self.tasks.create(draft).await
    }

    pub async fn update_task(&self, id: &str, draft: TaskDraft) -> Result<Task> {
        self.tasks.update(id, draft).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.delete(id).await
    }

    /// Run a task now. Returns the Pending execution.
    pub async fn execute_task_now(&self, id: &str) -> Result<Execution> {
        Ok(self.run_task(id).await?.execution)
    }

    /// Run a task now and keep a handle on its outcome.
    pub async fn run_task(&self, id: &str) -> Result<ExecutionTicket> {
        self.engine.submit(id, Trigger::Manual).await
    }

    pub fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        self.engine.cancel(execution_id)
    }

    pub async fn scheduled(&self) -> Result<Vec<ScheduledTask>> {
        self.scheduler.snapshot().await
    }

    // ─── History ──────────────────────────────────────────────

    pub fn get_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        self.history.query_executions(query)
    }

    pub fn get_logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        self.history.query_logs(query)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe()
    }

    pub fn gate_stats(&self) -> GateStats {
        self.engine.gate().stats()
    }

    // ─── Config ───────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<SettingValue> {
        self.settings.get(key)
    }

    pub fn get_all_config(&self) -> Result<BTreeMap<String, SettingValue>> {
        self.settings.get_all()
    }

    pub fn update_config(&self, key: &str, value: SettingValue) -> Result<SettingValue> {
        let stored = self.settings.update(key, value)?;
        if SettingKey::from_key(key.trim()) == Some(SettingKey::MaxConcurrency) {
            self.engine.gate().set_max(self.settings.max_concurrency());
        }
        Ok(stored)
    }

    // ─── Maintenance ──────────────────────────────────────────

    /// Apply retention now and compact the database file.
    pub fn cleanup_database(&self) -> Result<SweepReport> {
        cleanup_now(&self.history, &self.settings, chrono::Utc::now())
    }

    // ─── Notifications ────────────────────────────────────────

    pub async fn test_notification(
        &self,
        channel: ChannelKind,
        webhook_url: Option<&str>,
    ) -> Result<DeliveryResult> {
        self.notifier.test(channel, webhook_url).await
    }

    /// Stop the loops, cancel running executions, and wait for them.
    pub async fn shutdown(&self) {
        tracing::info!("🛑 ScriptGuard shutting down");
        self.stop.cancel();
        self.scheduler.shutdown().await;
        self.engine.shutdown().await;
        let handles = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Background task ended abnormally: {e}");
            }
        }
    }
}
