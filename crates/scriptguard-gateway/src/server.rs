//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post, put},
};
use scriptguard_core::config::GatewayConfig;
use scriptguard_scheduler::ScriptGuard;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub scriptguard: Arc<ScriptGuard>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(scriptguard: Arc<ScriptGuard>) -> Self {
        Self {
            scriptguard,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/environments", get(routes::get_environments))
        .route(
            "/api/v1/tasks",
            get(routes::get_tasks).post(routes::create_task),
        )
        .route(
            "/api/v1/tasks/{id}",
            put(routes::update_task).delete(routes::delete_task),
        )
        .route("/api/v1/tasks/{id}/run", post(routes::execute_task_now))
        .route("/api/v1/scheduled", get(routes::get_scheduled))
        .route("/api/v1/executions", get(routes::get_executions))
        .route(
            "/api/v1/executions/{id}/cancel",
            post(routes::cancel_execution),
        )
        .route("/api/v1/logs", get(routes::get_logs))
        .route(
            "/api/v1/maintenance/cleanup",
            post(routes::cleanup_database),
        )
        .route("/api/v1/config", get(routes::get_all_config))
        .route(
            "/api/v1/config/{key}",
            get(routes::get_config).put(routes::update_config),
        )
        .route(
            "/api/v1/notifications/test",
            post(routes::test_notification),
        )
        .route("/api/v1/events", get(routes::events))
        .route("/health", get(routes::health_check));

    api.layer(
        CorsLayer::new()
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers(Any)
            .allow_origin(Any)
            .max_age(std::time::Duration::from_secs(3600)),
    )
    .layer(TraceLayer::new_for_http())
    .with_state(Arc::new(state))
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    config: &GatewayConfig,
    scriptguard: Arc<ScriptGuard>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(AppState::new(scriptguard));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
