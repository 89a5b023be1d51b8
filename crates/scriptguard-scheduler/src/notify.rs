//! Failure alerts via DingTalk robot, WeCom robot, and a generic JSON webhook.
//!
//! Delivery never fails the caller: every outcome, including transport errors,
//! comes back as a [`DeliveryResult`] for logging or display.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::{ChannelKind, Execution, ExecutionStatus, Task};
use serde::Serialize;
use std::time::Duration;

use crate::history::ExecutionStore;
use crate::settings::{Settings, SettingKey, validate_webhook_url};

/// Per-request bound for webhook delivery.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(8);

/// Stderr lines appended to an alert when output is included.
const STDERR_TAIL_LINES: usize = 10;

/// Outcome of one webhook POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered { status: u16 },
    /// Non-2xx, or a robot API `errcode` other than 0.
    Rejected { status: u16, body: String },
    TransportError { message: String },
    /// No webhook URL saved for the channel.
    NotConfigured { channel: ChannelKind },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered { .. })
    }
}

/// Channel-neutral alert content.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    pub task_id: Option<String>,
    pub task_name: String,
    pub script_path: Option<String>,
    pub environment_id: Option<String>,
    pub execution_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub host: String,
    pub stderr_tail: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn for_execution(task: &Task, exec: &Execution, stderr_tail: Vec<String>) -> Self {
        let verb = match exec.status {
            ExecutionStatus::Timeout => "timed out",
            _ => "failed",
        };
        Self {
            title: format!("ScriptGuard: task '{}' {}", task.name, verb),
            task_id: Some(task.id.clone()),
            task_name: task.name.clone(),
            script_path: Some(task.script_path.clone()),
            environment_id: Some(task.environment_id.clone()),
            execution_id: Some(exec.id.clone()),
            status: Some(exec.status),
            exit_code: exec.exit_code,
            error_message: exec.error_message.clone(),
            duration_ms: exec.duration_ms,
            host: host_name(),
            stderr_tail,
            timestamp: exec.end_time.unwrap_or_else(Utc::now),
        }
    }

    pub fn test_message() -> Self {
        Self {
            title: "ScriptGuard: test notification".into(),
            task_id: None,
            task_name: "test".into(),
            script_path: None,
            environment_id: None,
            execution_id: None,
            status: None,
            exit_code: None,
            error_message: None,
            duration_ms: None,
            host: host_name(),
            stderr_tail: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Markdown body shared by the robot channels.
    pub fn markdown(&self) -> String {
        let mut text = format!("### {}\n\n", self.title);
        if self.status.is_none() {
            text.push_str("Webhook is configured correctly.\n\n");
        }
        let mut field = |label: &str, value: &str| {
            text.push_str(&format!("- **{label}**: {value}\n"));
        };
        if self.task_id.is_some() {
            field("Task", &self.task_name);
        }
        if let Some(path) = &self.script_path {
            field("Script", path);
        }
        if let Some(env) = &self.environment_id {
            field("Environment", env);
        }
        if let Some(status) = self.status {
            field("Status", status.as_str());
        }
        if let Some(code) = self.exit_code {
            field("Exit code", &code.to_string());
        }
        if let Some(ms) = self.duration_ms {
            field("Duration", &format!("{:.1}s", ms as f64 / 1000.0));
        }
        if let Some(err) = &self.error_message {
            field("Error", err);
        }
        if let Some(id) = &self.execution_id {
            field("Execution", id);
        }
        field("Host", &self.host);
        field("Time", &self.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        if !self.stderr_tail.is_empty() {
            text.push_str("\n**Last stderr lines**\n\n```\n");
            for line in &self.stderr_tail {
                text.push_str(line);
                text.push('\n');
            }
            text.push_str("```\n");
        }
        text
    }
}

/// Request body for a channel.
pub fn payload(channel: ChannelKind, alert: &Alert) -> serde_json::Value {
    match channel {
        ChannelKind::DingTalk => serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "title": alert.title,
                "text": alert.markdown(),
            }
        }),
        ChannelKind::WeCom => serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "content": alert.markdown(),
            }
        }),
        ChannelKind::Webhook => serde_json::json!({
            "title": alert.title,
            "text": alert.markdown(),
            "task_id": alert.task_id,
            "task_name": alert.task_name,
            "execution_id": alert.execution_id,
            "status": alert.status,
            "exit_code": alert.exit_code,
            "error_message": alert.error_message,
            "host": alert.host,
            "stderr_tail": alert.stderr_tail,
            "timestamp": alert.timestamp.to_rfc3339(),
        }),
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}

/// Receives failure alerts from the execution engine.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify_failure(
        &self,
        channel: ChannelKind,
        task: &Task,
        exec: &Execution,
    ) -> DeliveryResult;
}

/// Webhook notifier backed by saved settings.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    settings: Settings,
    history: ExecutionStore,
}

impl Notifier {
    pub fn new(settings: Settings, history: ExecutionStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| ScriptGuardError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            history,
        })
    }

    /// Alert for a failed or timed-out execution.
    pub async fn notify(&self, channel: ChannelKind, task: &Task, exec: &Execution) -> DeliveryResult {
        let Some(url) = self.settings.webhook(channel) else {
            tracing::warn!(
                "⚠️ Task '{}' alerts via {} but no webhook is configured",
                task.name,
                channel
            );
            return DeliveryResult::NotConfigured { channel };
        };
        let tail = if self.settings.notify_include_output() {
            self.history
                .tail_stderr(&exec.id, STDERR_TAIL_LINES)
                .unwrap_or_else(|e| {
                    tracing::warn!("⚠️ Could not read stderr for alert: {e}");
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        let alert = Alert::for_execution(task, exec, tail);
        self.send(channel, &url, &alert).await
    }

    /// Send a test alert, to `webhook_url` if given, else the saved URL.
    pub async fn test(&self, channel: ChannelKind, webhook_url: Option<&str>) -> Result<DeliveryResult> {
        let url = match webhook_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => {
                validate_webhook_url(SettingKey::webhook_for(channel).as_str(), url)?;
                url.to_string()
            }
            None => match self.settings.webhook(channel) {
                Some(url) => url,
                None => return Ok(DeliveryResult::NotConfigured { channel }),
            },
        };
        Ok(self.send(channel, &url, &Alert::test_message()).await)
    }

    pub async fn send(&self, channel: ChannelKind, url: &str, alert: &Alert) -> DeliveryResult {
        let body = payload(channel, alert);
        let result = match self.client.post(url).json(&body).send().await {
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                classify(channel, status.as_u16(), status.is_success(), text)
            }
            Err(e) => DeliveryResult::TransportError {
                message: e.to_string(),
            },
        };
        match &result {
            DeliveryResult::Delivered { .. } => {
                tracing::info!("✅ {} alert delivered: {}", channel, alert.title)
            }
            other => tracing::warn!("⚠️ {} alert not delivered: {:?}", channel, other),
        }
        result
    }
}

#[async_trait]
impl FailureNotifier for Notifier {
    async fn notify_failure(
        &self,
        channel: ChannelKind,
        task: &Task,
        exec: &Execution,
    ) -> DeliveryResult {
        self.notify(channel, task, exec).await
    }
}

/// Robot APIs answer 200 with `errcode != 0` on failure.
fn classify(channel: ChannelKind, status: u16, success: bool, body: String) -> DeliveryResult {
    if !success {
        return DeliveryResult::Rejected { status, body };
    }
    if matches!(channel, ChannelKind::DingTalk | ChannelKind::WeCom) {
        let errcode = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("errcode").and_then(|c| c.as_i64()));
        if let Some(code) = errcode
            && code != 0
        {
            return DeliveryResult::Rejected { status, body };
        }
    }
    DeliveryResult::Delivered { status }
}
