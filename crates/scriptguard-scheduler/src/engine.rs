//! Scheduler engine: the clock loop that fires due tasks.
//!
//! The loop owns a [`ScheduleBook`] and is the only thing that touches it.
//! Task changes arrive as [`SchedulerCommand`] messages; each tick compares the
//! injected [`Clock`] against every entry's next fire time and hands due tasks
//! to a [`Submitter`]. Missed fire times are not replayed: after a fire (or a
//! long pause) the next time is computed from "now".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::{Execution, Task};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cron::Schedule;
use crate::settings::Settings;

/// Source of "now". Swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Where due tasks go.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit_scheduled(&self, task_id: &str) -> Result<Execution>;
}

// ─── Schedule book ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Idle,
    Due,
    Dispatched,
}

#[derive(Debug, Clone)]
struct ScheduleEntry {
    task_name: String,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
    state: EntryState,
}

/// Public view of one scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub task_name: String,
    pub next_fire: DateTime<Utc>,
    pub state: EntryState,
}

/// Next-fire bookkeeping for every enabled, cron-scheduled task.
pub struct ScheduleBook {
    entries: HashMap<String, ScheduleEntry>,
    tz: Tz,
}

impl ScheduleBook {
    pub fn new(tz: Tz) -> Self {
        Self {
            entries: HashMap::new(),
            tz,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Add, replace, or drop the entry for a task. Returns the next fire time
    /// if the task is now scheduled.
    pub fn upsert(&mut self, task: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries.remove(&task.id);
        if !task.enabled {
            return None;
        }
        let schedule = match Schedule::parse(&task.schedule) {
            Ok(s) if s.is_manual() => return None,
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("⚠️ Task '{}' has an unusable schedule, not scheduling: {e}", task.name);
                return None;
            }
        };
        let Some(next_fire) = schedule.next_after(now, self.tz) else {
            tracing::warn!("⚠️ Task '{}' schedule never fires again", task.name);
            return None;
        };
        self.entries.insert(
            task.id.clone(),
            ScheduleEntry {
                task_name: task.name.clone(),
                schedule,
                next_fire,
                state: EntryState::Idle,
            },
        );
        Some(next_fire)
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        self.entries.remove(task_id).is_some()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark every entry whose time has come as Due, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter_mut()
            .filter(|(_, e)| e.state == EntryState::Idle && e.next_fire <= now)
            .map(|(id, e)| {
                e.state = EntryState::Due;
                (e.next_fire, id.clone())
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn mark_dispatched(&mut self, task_id: &str) {
        if let Some(entry) = self.entries.get_mut(task_id) {
            entry.state = EntryState::Dispatched;
        }
    }

    /// Back to Idle with the next fire time after `now`; an entry that will
    /// never fire again is dropped.
    pub fn advance(&mut self, task_id: &str, now: DateTime<Utc>) {
        let tz = self.tz;
        let Some(entry) = self.entries.get_mut(task_id) else {
            return;
        };
        match entry.schedule.next_after(now, tz) {
            Some(next) => {
                entry.next_fire = next;
                entry.state = EntryState::Idle;
            }
            None => {
                tracing::warn!("⚠️ Task '{}' schedule exhausted, removing", entry.task_name);
                self.entries.remove(task_id);
            }
        }
    }

    /// Switch timezone and recompute every next fire time from `now`.
    pub fn retime(&mut self, tz: Tz, now: DateTime<Utc>) {
        self.tz = tz;
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            self.advance(&id, now);
        }
    }

    pub fn snapshot(&self) -> Vec<ScheduledTask> {
        let mut list: Vec<ScheduledTask> = self
            .entries
            .iter()
            .map(|(id, e)| ScheduledTask {
                task_id: id.clone(),
                task_name: e.task_name.clone(),
                next_fire: e.next_fire,
                state: e.state,
            })
            .collect();
        list.sort_by(|a, b| a.next_fire.cmp(&b.next_fire).then_with(|| a.task_id.cmp(&b.task_id)));
        list
    }
}

// ─── Loop & handle ────────────────────────────────────────

pub enum SchedulerCommand {
    Upsert { task: Task, ack: oneshot::Sender<()> },
    Remove { task_id: String, ack: oneshot::Sender<bool> },
    Snapshot(oneshot::Sender<Vec<ScheduledTask>>),
    /// Run one tick immediately.
    Tick(oneshot::Sender<()>),
    Shutdown,
}

/// Cheap, cloneable handle to the scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    /// `None` when detached: nothing is ever scheduled.
    tx: Option<mpsc::Sender<SchedulerCommand>>,
}

impl SchedulerHandle {
    /// A handle with no loop behind it. Upserts are accepted and dropped,
    /// so tasks can still be edited without anything firing.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_none()
    }

    /// Returns once the loop has applied the change.
    pub async fn upsert(&self, task: Task) -> Result<()> {
        if self.is_detached() {
            return Ok(());
        }
        let (ack, rx) = oneshot::channel();
        self.send(SchedulerCommand::Upsert { task, ack }).await?;
        rx.await.map_err(|_| ScriptGuardError::ShuttingDown)
    }

    /// Returns whether the task had been scheduled.
    pub async fn remove(&self, task_id: &str) -> Result<bool> {
        if self.is_detached() {
            return Ok(false);
        }
        let (ack, rx) = oneshot::channel();
        self.send(SchedulerCommand::Remove {
            task_id: task_id.to_string(),
            ack,
        })
        .await?;
        rx.await.map_err(|_| ScriptGuardError::ShuttingDown)
    }

    pub async fn snapshot(&self) -> Result<Vec<ScheduledTask>> {
        if self.is_detached() {
            return Ok(Vec::new());
        }
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| ScriptGuardError::ShuttingDown)
    }

    pub async fn tick(&self) -> Result<()> {
        if self.is_detached() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Tick(tx)).await?;
        rx.await.map_err(|_| ScriptGuardError::ShuttingDown)
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(SchedulerCommand::Shutdown).await;
        }
    }

    async fn send(&self, cmd: SchedulerCommand) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tx.send(cmd)
            .await
            .map_err(|_| ScriptGuardError::ShuttingDown)
    }
}

/// The scheduler loop state.
pub struct SchedulerEngine {
    book: ScheduleBook,
    clock: Arc<dyn Clock>,
    submitter: Arc<dyn Submitter>,
    settings: Settings,
    tick_interval: Duration,
}

impl SchedulerEngine {
    pub fn new(
        clock: Arc<dyn Clock>,
        submitter: Arc<dyn Submitter>,
        settings: Settings,
        tick_interval: Duration,
    ) -> Self {
        Self {
            book: ScheduleBook::new(settings.timezone()),
            clock,
            submitter,
            settings,
            tick_interval,
        }
    }

    /// Seed the book and start the loop.
    pub fn spawn(mut self, tasks: &[Task]) -> (SchedulerHandle, JoinHandle<()>) {
        let now = self.clock.now();
        for task in tasks {
            self.book.upsert(task, now);
        }
        tracing::info!(
            "⏰ Scheduler started: {} scheduled task(s), tick every {:?}",
            self.book.len(),
            self.tick_interval
        );
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(self.run(rx));
        (SchedulerHandle { tx: Some(tx) }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCommand>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                cmd = rx.recv() => match cmd {
                    Some(SchedulerCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd).await,
                },
            }
        }
        tracing::info!("⏰ Scheduler stopped");
    }

    async fn handle(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Upsert { task, ack } => {
                match self.book.upsert(&task, self.clock.now()) {
                    Some(next) => tracing::debug!("⏰ '{}' next fire at {}", task.name, next),
                    None => tracing::debug!("⏰ '{}' not scheduled", task.name),
                }
                let _ = ack.send(());
            }
            SchedulerCommand::Remove { task_id, ack } => {
                let _ = ack.send(self.book.remove(&task_id));
            }
            SchedulerCommand::Snapshot(reply) => {
                let _ = reply.send(self.book.snapshot());
            }
            SchedulerCommand::Tick(done) => {
                self.tick().await;
                let _ = done.send(());
            }
            SchedulerCommand::Shutdown => {}
        }
    }

    /// One pass: submit every due task, then move it to its next fire time.
    async fn tick(&mut self) {
        let now = self.clock.now();
        let tz = self.settings.timezone();
        if tz != self.book.timezone() {
            tracing::info!("⏰ Timezone changed to {tz}, recomputing fire times");
            self.book.retime(tz, now);
        }

        for task_id in self.book.take_due(now) {
            match self.submitter.submit_scheduled(&task_id).await {
                Ok(exec) => {
                    tracing::info!("⏰ Fired '{}' → execution {}", exec.task_name, exec.id);
                    self.book.mark_dispatched(&task_id);
                }
                Err(e @ ScriptGuardError::NotFound { kind: "Task", .. }) => {
                    tracing::warn!("⚠️ Scheduled task {task_id} is gone, unscheduling: {e}");
                    self.book.remove(&task_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Scheduled task {task_id} skipped this time: {e}");
                }
            }
            self.book.advance(&task_id, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SchedulerDb;
    use crate::settings::SettingValue;
    use chrono::TimeZone;
    use scriptguard_core::types::{TaskDraft, Trigger};
    use std::sync::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(t: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(t)))
        }
        fn set(&self, t: DateTime<Utc>) {
            *self.0.lock().unwrap() = t;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Records submissions; unknown ids fail with NotFound.
    #[derive(Default)]
    struct Recorder {
        tasks: Mutex<HashMap<String, Task>>,
        fired: Mutex<Vec<(String, DateTime<Utc>)>>,
        clock: Mutex<Option<Arc<ManualClock>>>,
        env_missing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Submitter for Recorder {
        async fn submit_scheduled(&self, task_id: &str) -> Result<Execution> {
            let task = self
                .tasks
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .ok_or_else(|| ScriptGuardError::not_found("Task", task_id))?;
            if self.env_missing.lock().unwrap().iter().any(|id| id == task_id) {
                return Err(ScriptGuardError::not_found("Environment", &task.environment_id));
            }
            let now = self.clock.lock().unwrap().as_ref().map(|c| c.now()).unwrap_or_else(Utc::now);
            self.fired.lock().unwrap().push((task_id.to_string(), now));
            Ok(Execution::pending(&task, Trigger::Scheduled, now))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 7, 59, 30).unwrap()
    }

    fn task(name: &str, schedule: &str) -> Task {
        Task::from_draft(TaskDraft::new(name, "py39", "/srv/x.py").with_schedule(schedule), t0())
    }

    fn settings() -> Settings {
        Settings::new(Arc::new(SchedulerDb::open_in_memory().unwrap())).unwrap()
    }

    fn start(tasks: &[Task]) -> (SchedulerHandle, Arc<ManualClock>, Arc<Recorder>, Settings) {
        let clock = ManualClock::at(t0());
        let recorder = Arc::new(Recorder::default());
        *recorder.clock.lock().unwrap() = Some(clock.clone());
        for t in tasks {
            recorder.tasks.lock().unwrap().insert(t.id.clone(), t.clone());
        }
        let settings = settings();
        let engine = SchedulerEngine::new(
            clock.clone(),
            recorder.clone(),
            settings.clone(),
            Duration::from_secs(3600),
        );
        let (handle, _join) = engine.spawn(tasks);
        (handle, clock, recorder, settings)
    }

    #[test]
    fn test_book_skips_disabled_and_manual() {
        let mut book = ScheduleBook::new(Tz::UTC);
        let mut disabled = task("off", "0 8 * * *");
        disabled.enabled = false;
        assert!(book.upsert(&disabled, t0()).is_none());
        assert!(book.upsert(&task("manual", "manual"), t0()).is_none());
        assert!(book.upsert(&task("broken", "not cron"), t0()).is_none());
        assert!(book.is_empty());

        let next = book.upsert(&task("etl", "0 8 * * *"), t0()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_book_disable_removes_entry() {
        let mut book = ScheduleBook::new(Tz::UTC);
        let mut t = task("etl", "0 8 * * *");
        book.upsert(&t, t0());
        assert!(book.contains(&t.id));
        t.enabled = false;
        book.upsert(&t, t0());
        assert!(!book.contains(&t.id));
    }

    #[test]
    fn test_book_due_cycle() {
        let mut book = ScheduleBook::new(Tz::UTC);
        let t = task("etl", "0 8 * * *");
        book.upsert(&t, t0());
        assert!(book.take_due(t0()).is_empty());

        let fire = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(book.take_due(fire), vec![t.id.clone()]);
        assert_eq!(book.snapshot()[0].state, EntryState::Due);
        // Due entries are not handed out twice.
        assert!(book.take_due(fire).is_empty());

        book.mark_dispatched(&t.id);
        assert_eq!(book.snapshot()[0].state, EntryState::Dispatched);
        book.advance(&t.id, fire);
        let snap = book.snapshot();
        assert_eq!(snap[0].state, EntryState::Idle);
        assert_eq!(snap[0].next_fire, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_no_backfill_after_gap() {
        let mut book = ScheduleBook::new(Tz::UTC);
        let t = task("hourly", "0 * * * *");
        book.upsert(&t, t0());

        // Three hours pass without a tick: one fire, next is in the future.
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 5).unwrap();
        assert_eq!(book.take_due(late).len(), 1);
        book.advance(&t.id, late);
        assert!(book.take_due(late).is_empty());
        assert_eq!(
            book.snapshot()[0].next_fire,
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_retime_on_timezone_change() {
        let mut book = ScheduleBook::new(Tz::UTC);
        let t = task("etl", "0 8 * * *");
        book.upsert(&t, t0());
        book.retime(chrono_tz::Asia::Shanghai, t0());
        // 08:00 Shanghai on Mar 2 = 00:00 UTC Mar 2.
        assert_eq!(
            book.snapshot()[0].next_fire,
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_loop_fires_due_task_once() {
        let etl = task("etl", "0 8 * * *");
        let (handle, clock, recorder, _) = start(std::slice::from_ref(&etl));

        handle.tick().await.unwrap();
        assert!(recorder.fired.lock().unwrap().is_empty());

        clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 1).unwrap());
        handle.tick().await.unwrap();
        handle.tick().await.unwrap();
        let fired = recorder.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, etl.id);

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap[0].next_fire, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_never_fires() {
        let mut off = task("off", "* * * * *");
        off.enabled = false;
        let (handle, clock, recorder, _) = start(std::slice::from_ref(&off));

        for minute in 0..5 {
            clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 8, minute, 0).unwrap());
            handle.tick().await.unwrap();
        }
        assert!(recorder.fired.lock().unwrap().is_empty());
        assert!(handle.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_stops_firing() {
        let etl = task("etl", "* * * * *");
        let (handle, clock, recorder, _) = start(std::slice::from_ref(&etl));
        assert!(handle.remove(&etl.id).await.unwrap());
        assert!(!handle.remove(&etl.id).await.unwrap());

        clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        handle.tick().await.unwrap();
        assert!(recorder.fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_reschedules() {
        let mut etl = task("etl", "manual");
        let (handle, clock, recorder, _) = start(&[]);
        recorder.tasks.lock().unwrap().insert(etl.id.clone(), etl.clone());

        handle.upsert(etl.clone()).await.unwrap();
        assert!(handle.snapshot().await.unwrap().is_empty());

        etl.schedule = "0 8 * * *".into();
        handle.upsert(etl.clone()).await.unwrap();
        clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());
        handle.tick().await.unwrap();
        assert_eq!(recorder.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_error_keeps_loop_alive() {
        let ghost = task("ghost", "* * * * *");
        let live = task("live", "* * * * *");
        let (handle, clock, recorder, _) = start(&[ghost.clone(), live.clone()]);
        recorder.tasks.lock().unwrap().remove(&ghost.id);

        clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());
        handle.tick().await.unwrap();
        let fired = recorder.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, live.id);
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].task_id, live.id);
    }

    #[tokio::test]
    async fn test_timezone_setting_applied_on_tick() {
        let etl = task("etl", "0 8 * * *");
        let (handle, _clock, _, settings) = start(std::slice::from_ref(&etl));
        settings
            .update("timezone", SettingValue::Str("Asia/Shanghai".into()))
            .unwrap();
        handle.tick().await.unwrap();
        assert_eq!(
            handle.snapshot().await.unwrap()[0].next_fire,
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (handle, _, _, _) = start(&[]);
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            handle.snapshot().await.unwrap_err(),
            ScriptGuardError::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn test_missing_environment_keeps_schedule() {
        let etl = task("etl", "0 8 * * *");
        let (handle, clock, recorder, _) = start(std::slice::from_ref(&etl));
        recorder.env_missing.lock().unwrap().push(etl.id.clone());

        clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());
        handle.tick().await.unwrap();
        assert!(recorder.fired.lock().unwrap().is_empty());
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].next_fire, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());

        // Environment back: the next day fires again.
        recorder.env_missing.lock().unwrap().clear();
        clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        handle.tick().await.unwrap();
        assert_eq!(recorder.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detached_handle_schedules_nothing() {
        let handle = SchedulerHandle::detached();
        assert!(handle.is_detached());
        handle.upsert(task("etl", "* * * * *")).await.unwrap();
        assert!(handle.snapshot().await.unwrap().is_empty());
        assert!(!handle.remove("etl").await.unwrap());
        handle.tick().await.unwrap();
        handle.shutdown().await;
    }
}
