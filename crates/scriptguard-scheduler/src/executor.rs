//! Execution engine. Runs task scripts as child processes.
//!
//! Each submission becomes exactly one [`Execution`]. A driver task waits for
//! a slot at the [`ConcurrencyGate`], launches the environment's interpreter on
//! the script, and pipes stdout/stderr through two readers into a single log
//! writer that assigns the execution-wide sequence (1, 2, 3, ... with no gaps).
//! The driver is the only writer of the execution's status.
//!
//! Lifecycle: Pending → Running → Success | Failed | Timeout | Cancelled.
//! Failed and Timeout trigger the task's alert channel after the slot is freed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::{
    Environment, Execution, ExecutionStatus, LogRecord, LogStream, Task, Trigger,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::Submitter;
use crate::environments::EnvironmentRegistry;
use crate::history::ExecutionStore;
use crate::limiter::ConcurrencyGate;
use crate::notify::FailureNotifier;
use crate::persistence::SchedulerDb;
use crate::settings::Settings;

/// Lines longer than this are cut and marked.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
const TRUNCATED_MARKER: &str = "...(truncated)";

/// Something that happened to an execution, for live viewers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Status(Execution),
    Log(LogRecord),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long to wait for output pipes after the process is gone.
    pub kill_grace: Duration,
    pub log_batch_size: usize,
    pub log_flush_interval: Duration,
    pub max_line_bytes: usize,
    pub event_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_millis(3000),
            log_batch_size: 200,
            log_flush_interval: Duration::from_millis(200),
            max_line_bytes: MAX_LINE_BYTES,
            event_capacity: 1024,
        }
    }
}

/// Handle returned by [`ExecutionEngine::submit`].
pub struct ExecutionTicket {
    /// Snapshot at submission (status Pending).
    pub execution: Execution,
    done: oneshot::Receiver<Execution>,
}

impl ExecutionTicket {
    /// Wait for the terminal state.
    pub async fn finished(self) -> Result<Execution> {
        self.done.await.map_err(|_| ScriptGuardError::ShuttingDown)
    }
}

/// The engine. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: Arc<SchedulerDb>,
    registry: Arc<EnvironmentRegistry>,
    history: ExecutionStore,
    settings: Settings,
    gate: ConcurrencyGate,
    notifier: Arc<dyn FailureNotifier>,
    events: broadcast::Sender<EngineEvent>,
    live: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    options: EngineOptions,
}

/// How the process side of a run ended.
struct RunOutcome {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl RunOutcome {
    fn new(status: ExecutionStatus, exit_code: Option<i32>, error: Option<String>) -> Self {
        Self {
            status,
            exit_code,
            error,
        }
    }
}

impl ExecutionEngine {
    pub fn new(
        db: Arc<SchedulerDb>,
        registry: Arc<EnvironmentRegistry>,
        settings: Settings,
        notifier: Arc<dyn FailureNotifier>,
        options: EngineOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(16));
        let gate = ConcurrencyGate::new(settings.max_concurrency());
        Self {
            inner: Arc::new(EngineInner {
                history: ExecutionStore::new(db.clone()),
                db,
                registry,
                settings,
                gate,
                notifier,
                events,
                live: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                options,
            }),
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    pub fn history(&self) -> &ExecutionStore {
        &self.inner.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Ids of executions not yet terminal.
    pub fn active(&self) -> Vec<String> {
        self.inner.live_map().keys().cloned().collect()
    }

    /// Create a Pending execution and start driving it.
    pub async fn submit(&self, task_id: &str, trigger: Trigger) -> Result<ExecutionTicket> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(ScriptGuardError::ShuttingDown);
        }
        let task = inner
            .db
            .get_task(task_id)?
            .ok_or_else(|| ScriptGuardError::not_found("Task", task_id))?;
        if trigger == Trigger::Scheduled && !task.enabled {
            return Err(ScriptGuardError::validation(format!(
                "task '{}' is disabled",
                task.name
            )));
        }
        let env = inner.registry.resolve(&task.environment_id).await?;
        if !env.is_available() {
            return Err(ScriptGuardError::EnvironmentUnavailable(format!(
                "'{}' ({} not found)",
                env.id, env.executable
            )));
        }

        let exec = Execution::pending(&task, trigger, Utc::now());
        inner.history.append(&exec)?;
        inner.emit(EngineEvent::Status(exec.clone()));
        tracing::info!(
            "📥 Execution {} queued for '{}' ({})",
            exec.id,
            task.name,
            trigger.as_str()
        );

        let token = inner.shutdown.child_token();
        inner.live_map().insert(exec.id.clone(), token.clone());

        let (done_tx, done_rx) = oneshot::channel();
        let snapshot = exec.clone();
        let driver = inner.clone();
        inner.tracker.spawn(async move {
            let id = exec.id.clone();
            let finished = driver.clone().drive(task, env, exec, token).await;
            driver.live_map().remove(&id);
            let _ = done_tx.send(finished);
        });

        Ok(ExecutionTicket {
            execution: snapshot,
            done: done_rx,
        })
    }

    /// Cancel a queued or running execution. Returns false if it already ended.
    pub fn cancel(&self, execution_id: &str) -> Result<bool> {
        if let Some(token) = self.inner.live_map().get(execution_id) {
            token.cancel();
            return Ok(true);
        }
        match self.inner.history.get(execution_id)? {
            Some(_) => Ok(false),
            None => Err(ScriptGuardError::not_found("Execution", execution_id)),
        }
    }

    /// Mark runs a previous process left Pending/Running as Cancelled.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let n = self.inner.history.mark_interrupted(Utc::now())?;
        if n > 0 {
            tracing::warn!("⚠️ Marked {n} interrupted execution(s) as cancelled");
        }
        Ok(n)
    }

    /// Cancel everything in flight and wait for the drivers to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("🛑 Execution engine stopped");
    }
}

#[async_trait]
impl Submitter for ExecutionEngine {
    async fn submit_scheduled(&self, task_id: &str) -> Result<Execution> {
        self.submit(task_id, Trigger::Scheduled)
            .await
            .map(|ticket| ticket.execution)
    }
}

impl EngineInner {
    fn live_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn persist(&self, exec: &Execution) {
        match self.history.update(exec) {
            Ok(true) => {}
            Ok(false) => tracing::warn!("⚠️ Execution {} was already final in storage", exec.id),
            Err(e) => tracing::warn!("⚠️ Failed to persist execution {}: {e}", exec.id),
        }
        self.emit(EngineEvent::Status(exec.clone()));
    }

    /// Timeout for a task: its own override, else the global setting. 0 = none.
    fn timeout_for(&self, task: &Task) -> Option<Duration> {
        match task.timeout_seconds {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.settings.timeout(),
        }
    }

    async fn drive(
        self: Arc<Self>,
        task: Task,
        env: Environment,
        mut exec: Execution,
        token: CancellationToken,
    ) -> Execution {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = self.gate.acquire() => Some(permit),
        };
        let Some(permit) = permit else {
            self.finish(&mut exec, RunOutcome::new(
                ExecutionStatus::Cancelled,
                None,
                Some("cancelled before start".into()),
            ));
            return exec;
        };

        if !self.start_or_fail(&mut exec) {
            return exec;
        }
        tracing::info!(
            "▶️ Execution {} started: '{}' via {} ({})",
            exec.id,
            task.name,
            env.id,
            env.executable
        );

        let outcome = self.run_process(&task, &env, &exec, &token).await;
        self.finish(&mut exec, outcome);
        drop(permit);

        if exec.status.is_alerting()
            && let Some(channel) = task.notify_channel
        {
            let result = self.notifier.notify_failure(channel, &task, &exec).await;
            tracing::debug!("Alert for execution {}: {:?}", exec.id, result);
        }
        exec
    }

    /// Mark the execution Running. If that is refused it ends Failed instead,
    /// so callers always get a terminal record back.
    fn start_or_fail(&self, exec: &mut Execution) -> bool {
        match exec.start(Utc::now()) {
            Ok(()) => {
                self.persist(exec);
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ Execution {} could not start: {e}", exec.id);
                self.finish(exec, RunOutcome::new(
                    ExecutionStatus::Failed,
                    None,
                    Some(format!("could not start: {e}")),
                ));
                false
            }
        }
    }

    fn finish(&self, exec: &mut Execution, outcome: RunOutcome) {
        if let Err(e) = exec.finish(outcome.status, outcome.exit_code, outcome.error, Utc::now()) {
            tracing::warn!("⚠️ {e}");
            return;
        }
        self.persist(exec);
        let log = format!(
            "Execution {} '{}' finished: {} (exit {:?}, {} ms)",
            exec.id,
            exec.task_name,
            exec.status,
            exec.exit_code,
            exec.duration_ms.unwrap_or_default()
        );
        match exec.status {
            ExecutionStatus::Success => tracing::info!("✅ {log}"),
            ExecutionStatus::Cancelled => tracing::info!("⏹️ {log}"),
            _ => tracing::warn!("❌ {log}"),
        }
    }

    async fn run_process(
        self: &Arc<Self>,
        task: &Task,
        env: &Environment,
        exec: &Execution,
        token: &CancellationToken,
    ) -> RunOutcome {
        let mut cmd = Command::new(&env.executable);
        cmd.arg(&task.script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true);
        if let Some(dir) = Path::new(&task.script_path).parent()
            && dir.is_dir()
        {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::new(
                    ExecutionStatus::Failed,
                    None,
                    Some(format!("failed to start {}: {e}", env.executable)),
                );
            }
        };

        let (line_tx, line_rx) = mpsc::channel::<RawLine>(1024);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        let max_line = self.options.max_line_bytes;
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(out, LogStream::Stdout, line_tx.clone(), max_line)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(err, LogStream::Stderr, line_tx.clone(), max_line)));
        }
        drop(line_tx);
        let writer = tokio::spawn(write_logs(
            self.clone(),
            exec.id.clone(),
            exec.task_id.clone(),
            line_rx,
        ));

        let timeout = self.timeout_for(task);
        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = deadline(timeout) => Ended::TimedOut,
            _ = token.cancelled() => Ended::Cancelled,
        };
        let ended = match ended {
            Ended::Exited(status) => Ended::Exited(status),
            other => {
                kill_process_tree(&mut child).await;
                other
            }
        };

        // Pipes close once every holder is dead; don't wait forever on them.
        let drain_until = Instant::now() + self.options.kill_grace;
        for mut reader in readers {
            if tokio::time::timeout_at(drain_until, &mut reader).await.is_err() {
                tracing::debug!("Output reader for {} did not drain, aborting", exec.id);
                reader.abort();
            }
        }
        let lines = writer.await.unwrap_or_default();
        tracing::debug!("Execution {} produced {lines} log line(s)", exec.id);

        match ended {
            Ended::Exited(Ok(status)) => exit_outcome(status),
            Ended::Exited(Err(e)) => RunOutcome::new(
                ExecutionStatus::Failed,
                None,
                Some(format!("failed to wait for process: {e}")),
            ),
            Ended::TimedOut => RunOutcome::new(
                ExecutionStatus::Timeout,
                None,
                Some(format!(
                    "timed out after {}s",
                    timeout.map(|t| t.as_secs()).unwrap_or_default()
                )),
            ),
            Ended::Cancelled => RunOutcome::new(
                ExecutionStatus::Cancelled,
                None,
                Some("cancelled".into()),
            ),
        }
    }
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending::<()>().await,
    }
}

fn exit_outcome(status: std::process::ExitStatus) -> RunOutcome {
    match status.code() {
        Some(0) => RunOutcome::new(ExecutionStatus::Success, Some(0), None),
        Some(code) => RunOutcome::new(ExecutionStatus::Failed, Some(code), None),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return RunOutcome::new(
                        ExecutionStatus::Failed,
                        None,
                        Some(format!("terminated by signal {signal}")),
                    );
                }
            }
            RunOutcome::new(ExecutionStatus::Failed, None, Some(format!("abnormal exit: {status}")))
        }
    }
}

/// Kill the script and anything it spawned.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!("killpg({pid}) failed: {e}");
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!("kill failed: {e}");
    }
}

// ─── Output capture ───────────────────────────────────────

struct RawLine {
    stream: LogStream,
    stream_sequence: u64,
    timestamp: DateTime<Utc>,
    line: String,
}

async fn read_stream<R>(reader: R, stream: LogStream, tx: mpsc::Sender<RawLine>, max_line: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0u64;
    loop {
        buf.clear();
        let truncated = match read_line_capped(&mut reader, &mut buf, max_line).await {
            Ok(None) => break,
            Ok(Some(truncated)) => truncated,
            Err(e) => {
                tracing::warn!("⚠️ Reading {} failed: {e}", stream.as_str());
                break;
            }
        };
        count += 1;
        let line = RawLine {
            stream,
            stream_sequence: count,
            timestamp: Utc::now(),
            line: decode_line(&buf, truncated),
        };
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Read one `\n`-terminated line, keeping at most `cap` bytes of it.
/// `Ok(None)` at EOF, otherwise whether the line was cut.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, cap: usize) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed_any = false;
    let mut truncated = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed_any.then_some(truncated));
        }
        let (len, newline) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = cap.saturating_sub(buf.len());
        let keep = len.min(room);
        buf.extend_from_slice(&available[..keep]);
        if keep < len {
            truncated = true;
        }
        reader.consume(len);
        consumed_any = true;
        if newline {
            return Ok(Some(truncated));
        }
    }
}

fn decode_line(bytes: &[u8], truncated: bool) -> String {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let mut line = String::from_utf8_lossy(&bytes[..end]).into_owned();
    if truncated {
        line.push_str(TRUNCATED_MARKER);
    }
    line
}

/// How often the final flush is retried before lines are given up.
const FINAL_FLUSH_ATTEMPTS: usize = 5;

/// Single writer: numbers lines in arrival order and stores them in batches.
/// Returns how many lines reached the store.
async fn write_logs(
    engine: Arc<EngineInner>,
    execution_id: String,
    task_id: String,
    mut rx: mpsc::Receiver<RawLine>,
) -> u64 {
    let batch_size = engine.options.log_batch_size.max(1);
    let mut pending = PendingLogs::with_capacity(batch_size);
    let mut sequence = 0u64;
    let mut flush_timer = tokio::time::interval(engine.options.log_flush_interval);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            raw = rx.recv() => {
                let Some(raw) = raw else { break };
                sequence += 1;
                let record = LogRecord {
                    execution_id: execution_id.clone(),
                    task_id: task_id.clone(),
                    sequence,
                    stream: raw.stream,
                    stream_sequence: raw.stream_sequence,
                    timestamp: raw.timestamp,
                    line: raw.line,
                };
                engine.emit(EngineEvent::Log(record.clone()));
                pending.records.push(record);
                // While the store is failing only the timer retries.
                if pending.records.len() >= batch_size && !pending.failing {
                    pending.flush(&engine.history);
                }
            }
            _ = flush_timer.tick() => pending.flush(&engine.history),
        }
    }

    for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
        pending.flush(&engine.history);
        if pending.records.is_empty() {
            break;
        }
        if attempt < FINAL_FLUSH_ATTEMPTS {
            tokio::time::sleep(engine.options.log_flush_interval).await;
        }
    }
    if !pending.records.is_empty() {
        tracing::error!(
            "❌ Gave up storing {} log line(s) for execution {execution_id}",
            pending.records.len()
        );
    }
    pending.stored
}

/// Lines numbered but not yet stored. A failed write keeps them, in order,
/// for the next attempt.
struct PendingLogs {
    records: Vec<LogRecord>,
    stored: u64,
    failing: bool,
}

impl PendingLogs {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            stored: 0,
            failing: false,
        }
    }

    fn flush(&mut self, history: &ExecutionStore) {
        if self.records.is_empty() {
            return;
        }
        match history.append_logs(&self.records) {
            Ok(()) => {
                if self.failing {
                    tracing::info!("✅ Log store recovered, wrote {} held line(s)", self.records.len());
                }
                self.stored += self.records.len() as u64;
                self.records.clear();
                self.failing = false;
            }
            Err(e) => {
                if !self.failing {
                    tracing::warn!(
                        "⚠️ Failed to store {} log line(s), holding them for retry: {e}",
                        self.records.len()
                    );
                }
                self.failing = true;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environments::DeclaredSource;
    use crate::history::LogQuery;
    use crate::notify::DeliveryResult;
    use scriptguard_core::config::DeclaredEnvironment;
    use scriptguard_core::types::{ChannelKind, TaskDraft};

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(ChannelKind, String, ExecutionStatus)>>,
    }

    #[async_trait]
    impl FailureNotifier for RecordingNotifier {
        async fn notify_failure(
            &self,
            channel: ChannelKind,
            _task: &Task,
            exec: &Execution,
        ) -> DeliveryResult {
            self.calls
                .lock()
                .unwrap()
                .push((channel, exec.id.clone(), exec.status));
            DeliveryResult::Delivered { status: 200 }
        }
    }

    struct Harness {
        engine: ExecutionEngine,
        db: Arc<SchedulerDb>,
        settings: Settings,
        notifier: Arc<RecordingNotifier>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
            let settings = Settings::new(db.clone()).unwrap();
            let registry = Arc::new(EnvironmentRegistry::new(vec![Box::new(DeclaredSource::new(vec![
                DeclaredEnvironment {
                    id: "sh".into(),
                    name: None,
                    executable: "/bin/sh".into(),
                },
                DeclaredEnvironment {
                    id: "gone".into(),
                    name: None,
                    executable: "/no/such/interpreter".into(),
                },
            ]))]));
            let notifier = Arc::new(RecordingNotifier::default());
            let options = EngineOptions {
                kill_grace: Duration::from_millis(500),
                ..Default::default()
            };
            let engine = ExecutionEngine::new(
                db.clone(),
                registry,
                settings.clone(),
                notifier.clone(),
                options,
            );
            Self {
                engine,
                db,
                settings,
                notifier,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn task(&self, name: &str, script: &str, f: impl FnOnce(TaskDraft) -> TaskDraft) -> Task {
            let path = self.dir.path().join(format!("{name}.sh"));
            std::fs::write(&path, script).unwrap();
            let draft = f(TaskDraft::new(name, "sh", &path.to_string_lossy()));
            let task = Task::from_draft(draft, Utc::now());
            self.db.insert_task(&task).unwrap();
            task
        }

        async fn run(&self, task: &Task) -> Execution {
            let ticket = self.engine.submit(&task.id, Trigger::Manual).await.unwrap();
            assert_eq!(ticket.execution.status, ExecutionStatus::Pending);
            tokio::time::timeout(Duration::from_secs(20), ticket.finished())
                .await
                .expect("execution should finish")
                .unwrap()
        }

        fn logs(&self, exec: &Execution) -> Vec<LogRecord> {
            let mut logs = self
                .engine
                .history()
                .query_logs(&LogQuery {
                    execution_id: Some(exec.id.clone()),
                    ..Default::default()
                })
                .unwrap();
            logs.reverse();
            logs
        }
    }

    #[tokio::test]
    async fn test_success_captures_both_streams() {
        let h = Harness::new();
        let task = h.task("hello", "echo hello\necho oops >&2\necho bye\n", |d| d);
        let exec = h.run(&task).await;

        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.exit_code, Some(0));
        assert!(exec.start_time.is_some());
        assert!(exec.end_time.is_some());
        assert!(exec.duration_ms.is_some());

        let logs = h.logs(&exec);
        assert_eq!(logs.len(), 3);
        let seqs: Vec<u64> = logs.iter().map(|l| l.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        let stderr: Vec<&str> = logs
            .iter()
            .filter(|l| l.stream == LogStream::Stderr)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stderr, vec!["oops"]);
        let stdout: Vec<&str> = logs
            .iter()
            .filter(|l| l.stream == LogStream::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stdout, vec!["hello", "bye"]);

        let stored = h.engine.history().get(&exec.id).unwrap().unwrap();
        assert_eq!(stored, exec);
        assert!(h.notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_notifies_once() {
        let h = Harness::new();
        let task = h.task("broken", "echo failing >&2\nexit 3\n", |d| {
            d.with_channel(ChannelKind::DingTalk)
        });
        let exec = h.run(&task).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.exit_code, Some(3));
        let calls = h.notifier.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(ChannelKind::DingTalk, exec.id.clone(), ExecutionStatus::Failed)]);
    }

    #[tokio::test]
    async fn test_failure_without_channel_is_silent() {
        let h = Harness::new();
        let task = h.task("quiet", "exit 1\n", |d| d);
        assert_eq!(h.run(&task).await.status, ExecutionStatus::Failed);
        assert!(h.notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_frees_slot() {
        let h = Harness::new();
        let task = h.task("hang", "echo started\nsleep 30\necho never\n", |d| {
            d.with_timeout(1).with_channel(ChannelKind::WeCom)
        });
        let begun = std::time::Instant::now();
        let exec = h.run(&task).await;

        assert_eq!(exec.status, ExecutionStatus::Timeout);
        assert!(exec.end_time.is_some());
        assert!(begun.elapsed() < Duration::from_secs(10));
        assert_eq!(h.engine.gate().running(), 0);

        let lines: Vec<String> = h.logs(&exec).into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["started"]);
        let calls = h.notifier.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_global_timeout_setting() {
        let h = Harness::new();
        h.settings
            .update("timeout_seconds", crate::settings::SettingValue::Int(1))
            .unwrap();
        let task = h.task("hang", "sleep 30\n", |d| d);
        assert_eq!(h.run(&task).await.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_unlimited() {
        let h = Harness::new();
        h.settings
            .update("timeout_seconds", crate::settings::SettingValue::Int(1))
            .unwrap();
        let task = h.task("slowish", "sleep 2\necho done\n", |d| d.with_timeout(0));
        let exec = h.run(&task).await;
        assert_eq!(exec.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_gapless_sequence_under_interleaving() {
        let h = Harness::new();
        let script = "i=1\nwhile [ $i -le 300 ]; do\n  echo out $i\n  echo err $i >&2\n  i=$((i+1))\ndone\n";
        let task = h.task("chatty", script, |d| d);
        let exec = h.run(&task).await;
        assert_eq!(exec.status, ExecutionStatus::Success);

        let logs = h.logs(&exec);
        assert_eq!(logs.len(), 600);
        for (i, rec) in logs.iter().enumerate() {
            assert_eq!(rec.sequence, i as u64 + 1);
        }
        for stream in [LogStream::Stdout, LogStream::Stderr] {
            let per: Vec<u64> = logs
                .iter()
                .filter(|l| l.stream == stream)
                .map(|l| l.stream_sequence)
                .collect();
            assert_eq!(per, (1..=300).collect::<Vec<u64>>());
        }
    }

    #[tokio::test]
    async fn test_ceiling_and_fifo_admission() {
        let h = Harness::new();
        h.engine.gate().set_max(1);
        let task = h.task("serial", "sleep 0.3\n", |d| d);

        let mut tickets = Vec::new();
        for _ in 0..3 {
            tickets.push(h.engine.submit(&task.id, Trigger::Manual).await.unwrap());
        }
        let mut done = Vec::new();
        for t in tickets {
            done.push(t.finished().await.unwrap());
        }
        for pair in done.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            assert_eq!(first.status, ExecutionStatus::Success);
            assert!(first.end_time.unwrap() <= second.start_time.unwrap());
        }
        let ids: std::collections::HashSet<_> = done.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let h = Harness::new();
        let missing = h.engine.submit("no-such-task", Trigger::Manual).await;
        assert!(missing.err().unwrap().is_not_found());

        let unavailable = h.task("x", "exit 0\n", |d| TaskDraft {
            environment_id: "gone".into(),
            ..d
        });
        let err = h.engine.submit(&unavailable.id, Trigger::Manual).await.err().unwrap();
        assert!(matches!(err, ScriptGuardError::EnvironmentUnavailable(_)));
        assert!(err.is_retryable());

        let unknown_env = h.task("y", "exit 0\n", |d| TaskDraft {
            environment_id: "py27".into(),
            ..d
        });
        let err = h.engine.submit(&unknown_env.id, Trigger::Manual).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_disabled_task_runs_only_on_demand() {
        let h = Harness::new();
        let task = h.task("off", "exit 0\n", |d| d.disabled());
        let err = h.engine.submit(&task.id, Trigger::Scheduled).await.err().unwrap();
        assert!(matches!(err, ScriptGuardError::Validation(_)));
        assert_eq!(h.run(&task).await.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_cancel_running() {
        let h = Harness::new();
        let task = h.task("long", "sleep 30\n", |d| d.with_channel(ChannelKind::DingTalk));
        let mut events = h.engine.subscribe();
        let ticket = h.engine.submit(&task.id, Trigger::Manual).await.unwrap();
        let id = ticket.execution.id.clone();

        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Status(e) if e.id == id && e.status == ExecutionStatus::Running => break,
                _ => {}
            }
        }
        assert!(h.engine.cancel(&id).unwrap());
        let exec = tokio::time::timeout(Duration::from_secs(10), ticket.finished())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(!h.engine.cancel(&id).unwrap());
        assert!(h.engine.cancel("unknown").unwrap_err().is_not_found());
        // Cancellation is not a failure.
        assert!(h.notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let h = Harness::new();
        h.engine.gate().set_max(1);
        let blocker = h.task("blocker", "sleep 1\n", |d| d);
        let queued = h.task("queued", "echo hi\n", |d| d);

        let first = h.engine.submit(&blocker.id, Trigger::Manual).await.unwrap();
        let second = h.engine.submit(&queued.id, Trigger::Manual).await.unwrap();
        assert!(h.engine.cancel(&second.execution.id).unwrap());

        let second = second.finished().await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Cancelled);
        assert!(second.start_time.is_none());
        assert!(second.end_time.is_some());
        assert_eq!(first.finished().await.unwrap().status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let h = Harness::new();
        let task = h.task("evented", "echo one\n", |d| d);
        let mut events = h.engine.subscribe();
        let exec = h.run(&task).await;

        let mut statuses = Vec::new();
        let mut lines = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::Status(e) if e.id == exec.id => statuses.push(e.status),
                EngineEvent::Log(l) if l.execution_id == exec.id => lines.push(l.line),
                _ => {}
            }
        }
        assert_eq!(
            statuses,
            vec![ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Success]
        );
        assert_eq!(lines, vec!["one"]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight() {
        let h = Harness::new();
        let task = h.task("long", "sleep 30\n", |d| d);
        let ticket = h.engine.submit(&task.id, Trigger::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(10), h.engine.shutdown())
            .await
            .unwrap();
        assert_eq!(ticket.finished().await.unwrap().status, ExecutionStatus::Cancelled);
        assert!(matches!(
            h.engine.submit(&task.id, Trigger::Manual).await.err().unwrap(),
            ScriptGuardError::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let h = Harness::new();
        let task = h.task("stale", "exit 0\n", |d| d);
        let stale = Execution::pending(&task, Trigger::Scheduled, Utc::now());
        h.engine.history().append(&stale).unwrap();
        assert_eq!(h.engine.recover_interrupted().unwrap(), 1);
        assert_eq!(
            h.engine.history().get(&stale.id).unwrap().unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    fn raw(stream: LogStream, n: u64, line: &str) -> RawLine {
        RawLine {
            stream,
            stream_sequence: n,
            timestamp: Utc::now(),
            line: line.into(),
        }
    }

    #[tokio::test]
    async fn test_log_batch_retried_after_store_failure() {
        let h = Harness::new();
        let task = h.task("flaky_store", "exit 0\n", |d| d);
        let exec = Execution::pending(&task, Trigger::Manual, Utc::now());
        h.engine.history().append(&exec).unwrap();

        h.db.with_conn(|c| c.execute_batch("ALTER TABLE execution_logs RENAME TO execution_logs_off"))
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        let writer = tokio::spawn(write_logs(
            h.engine.inner.clone(),
            exec.id.clone(),
            task.id.clone(),
            rx,
        ));
        for n in 1..=3 {
            tx.send(raw(LogStream::Stdout, n, &format!("early {n}"))).await.unwrap();
        }
        // Let at least one timed flush hit the missing table.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let held: i64 = h
            .db
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM execution_logs_off", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(held, 0);

        h.db.with_conn(|c| c.execute_batch("ALTER TABLE execution_logs_off RENAME TO execution_logs"))
            .unwrap();
        tx.send(raw(LogStream::Stderr, 1, "late 1")).await.unwrap();
        tx.send(raw(LogStream::Stdout, 4, "late 2")).await.unwrap();
        drop(tx);

        let stored = tokio::time::timeout(Duration::from_secs(10), writer)
            .await
            .expect("writer should finish")
            .unwrap();
        assert_eq!(stored, 5);

        let logs = h.logs(&exec);
        let sequences: Vec<u64> = logs.iter().map(|l| l.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(logs[0].line, "early 1");
        assert_eq!(logs[3].line, "late 1");
    }

    #[tokio::test]
    async fn test_refused_start_ends_failed() {
        let h = Harness::new();
        let task = h.task("twice", "exit 0\n", |d| d);
        let env = h.engine.inner.registry.resolve("sh").await.unwrap();
        let mut exec = Execution::pending(&task, Trigger::Manual, Utc::now());
        h.engine.history().append(&exec).unwrap();
        // Already Running, so a second start is refused.
        exec.start(Utc::now()).unwrap();

        let done = h
            .engine
            .inner
            .clone()
            .drive(task, env, exec, CancellationToken::new())
            .await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error_message.unwrap().contains("could not start"));

        let stored = h.engine.history().get(&done.id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert!(stored.end_time.is_some());
        assert_eq!(h.engine.inner.gate.running(), 0);
    }

    #[tokio::test]
    async fn test_read_line_capped_truncates() {
        let data = format!("{}\nshort\r\nlast", "x".repeat(50));
        let mut reader = BufReader::with_capacity(8, data.as_bytes());
        let mut buf = Vec::new();

        let cut = read_line_capped(&mut reader, &mut buf, 10).await.unwrap();
        assert_eq!(cut, Some(true));
        assert_eq!(decode_line(&buf, true), format!("{}{}", "x".repeat(10), TRUNCATED_MARKER));

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 10).await.unwrap(), Some(false));
        assert_eq!(decode_line(&buf, false), "short");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 10).await.unwrap(), Some(false));
        assert_eq!(decode_line(&buf, false), "last");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 10).await.unwrap(), None);
    }
}
