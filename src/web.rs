//! HTTP status endpoints. Read-only: nothing here changes the supervisor.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Environment;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{SupervisorHandle, SupervisorSnapshot};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `/healthz` waits for the bot client.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct WebState {
    pub supervisor: SupervisorHandle,
    pub environment: Environment,
    pub probe_timeout: Duration,
}

impl WebState {
    pub fn new(supervisor: SupervisorHandle, environment: Environment) -> Self {
        Self {
            supervisor,
            environment,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub uptime: u64,
    pub bot_running: bool,
    pub polling_task_running: bool,
    pub updater_running: bool,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub supervisor: SupervisorSnapshot,
    pub environment: &'static str,
    pub timestamp: String,
    pub version: &'static str,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

pub fn create_router(state: WebState) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/status", get(status));
    if state.environment.is_development() {
        router = router.route("/docs", get(docs));
    }
    router.with_state(state)
}

/// Bind the status server's socket. Done before the bot starts so a bad
/// address fails startup instead of leaving the bot without health checks.
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: WebState,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

async fn root() -> &'static str {
    "ID bot is running"
}

async fn healthz(State(state): State<WebState>) -> impl IntoResponse {
    let supervisor = &state.supervisor;
    match supervisor.probe(state.probe_timeout).await {
        Ok(me) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                bot_username: Some(me.username),
                error: None,
                timestamp: now(),
                version: VERSION,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    bot_username: supervisor.identity().map(|me| me.username),
                    error: Some(e.to_string()),
                    timestamp: now(),
                    version: VERSION,
                }),
            )
        }
    }
}

async fn metrics(State(state): State<WebState>) -> Json<MetricsResponse> {
    let snapshot = state.supervisor.snapshot();
    Json(MetricsResponse {
        uptime: snapshot.uptime_secs,
        bot_running: snapshot.bot_running,
        polling_task_running: snapshot.polling_task_running,
        updater_running: snapshot.updater_running,
        version: VERSION,
    })
}

async fn status(State(state): State<WebState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        supervisor: state.supervisor.snapshot(),
        environment: state.environment.as_str(),
        timestamp: now(),
        version: VERSION,
    })
}

async fn docs() -> Json<serde_json::Value> {
    Json(json!({
        "routes": [
            { "method": "GET", "path": "/", "description": "Liveness text" },
            { "method": "GET", "path": "/healthz", "description": "Bot client health probe" },
            { "method": "GET", "path": "/metrics", "description": "Polling task counters" },
            { "method": "GET", "path": "/status", "description": "Supervisor snapshot" },
            { "method": "GET", "path": "/docs", "description": "This list" }
        ],
        "version": VERSION,
    }))
}
