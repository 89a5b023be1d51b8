//! API route handlers for the gateway.

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use futures::{Stream, StreamExt};
use scriptguard_core::error::ScriptGuardError;
use scriptguard_core::types::{ChannelKind, TaskDraft};
use scriptguard_scheduler::{EngineEvent, ExecutionQuery, LogQuery, SettingValue};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::server::AppState;

/// A service error rendered as `{"ok": false, "error": ...}`.
pub struct ApiError(ScriptGuardError);

impl From<ScriptGuardError> for ApiError {
    fn from(e: ScriptGuardError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScriptGuardError::Validation(_) => StatusCode::BAD_REQUEST,
            ScriptGuardError::NotFound { .. } => StatusCode::NOT_FOUND,
            ScriptGuardError::EnvironmentUnavailable(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({"ok": false, "error": self.0.to_string()})),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gate = state.scriptguard.gate_stats();
    Json(serde_json::json!({
        "status": "ok",
        "service": "scriptguard-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "running": gate.running,
        "queued": gate.queued,
    }))
}

// ─── Environments ─────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct EnvironmentParams {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn get_environments(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EnvironmentParams>,
) -> Json<serde_json::Value> {
    let envs = state.scriptguard.get_environments(params.refresh).await;
    Json(serde_json::json!({"ok": true, "count": envs.len(), "environments": envs}))
}

// ─── Tasks ────────────────────────────────────────────────

pub async fn get_tasks(State(state): State<Arc<AppState>>) -> ApiResult {
    let tasks = state.scriptguard.get_tasks()?;
    Ok(Json(serde_json::json!({"ok": true, "count": tasks.len(), "tasks": tasks})))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<TaskDraft>,
) -> ApiResult {
    let task = state.scriptguard.create_task(draft).await?;
    Ok(Json(serde_json::json!({"ok": true, "task": task})))
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<TaskDraft>,
) -> ApiResult {
    let task = state.scriptguard.update_task(&id, draft).await?;
    Ok(Json(serde_json::json!({"ok": true, "task": task})))
}

pub async fn delete_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.scriptguard.delete_task(&id).await?;
    Ok(Json(serde_json::json!({"ok": true, "id": id})))
}

/// Queue a manual run; answers with the Pending execution.
pub async fn execute_task_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let execution = state.scriptguard.execute_task_now(&id).await?;
    Ok(Json(serde_json::json!({"ok": true, "execution": execution})))
}

pub async fn get_scheduled(State(state): State<Arc<AppState>>) -> ApiResult {
    let entries = state.scriptguard.scheduled().await?;
    Ok(Json(serde_json::json!({"ok": true, "count": entries.len(), "scheduled": entries})))
}

// ─── History ──────────────────────────────────────────────

pub async fn get_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult {
    let executions = state.scriptguard.get_executions(&query)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "count": executions.len(),
        "executions": executions,
    })))
}

pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let cancelled = state.scriptguard.cancel_execution(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "cancelled": cancelled})))
}

/// Apply retention now and compact the database.
pub async fn cleanup_database(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.scriptguard.cleanup_database()?;
    Ok(Json(serde_json::json!({"ok": true, "removed": report})))
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> ApiResult {
    let logs = state.scriptguard.get_logs(&query)?;
    Ok(Json(serde_json::json!({"ok": true, "count": logs.len(), "logs": logs})))
}

/// Live execution status and log lines as Server-Sent Events.
pub async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.scriptguard.subscribe()).filter_map(|msg| async move {
        match msg {
            Ok(event) => {
                let name = match &event {
                    EngineEvent::Status(_) => "status",
                    EngineEvent::Log(_) => "log",
                };
                Event::default().event(name).json_data(&event).ok().map(Ok)
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!("⚠️ Event subscriber lagged, skipped {skipped} event(s)");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ─── Config ───────────────────────────────────────────────

pub async fn get_all_config(State(state): State<Arc<AppState>>) -> ApiResult {
    let config = state.scriptguard.get_all_config()?;
    Ok(Json(serde_json::json!({"ok": true, "config": config})))
}

pub async fn get_config(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> ApiResult {
    let value = state.scriptguard.get_config(&key)?;
    Ok(Json(serde_json::json!({"ok": true, "key": key, "value": value})))
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub value: SettingValue,
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<ConfigUpdate>,
) -> ApiResult {
    let value = state.scriptguard.update_config(&key, body.value)?;
    Ok(Json(serde_json::json!({"ok": true, "key": key, "value": value})))
}

// ─── Notifications ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NotificationTest {
    pub channel: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Send a test message. `ok` reflects whether the endpoint accepted it.
pub async fn test_notification(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NotificationTest>,
) -> ApiResult {
    let channel: ChannelKind = body.channel.parse()?;
    let url = body.webhook_url.as_deref().filter(|u| !u.trim().is_empty());
    let result = state.scriptguard.test_notification(channel, url).await?;
    Ok(Json(serde_json::json!({"ok": result.is_delivered(), "result": result})))
}
