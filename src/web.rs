//! Administrative HTTP interface.
//!
//! Lets an operator front-end trigger maintenance tasks, toggle their
//! schedules, poll bulk operation progress and inspect catalog state.

use std::collections::BTreeMap;
use std::future::Future;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::manager::MaintenanceOrchestrator;
use crate::registry::TaskStatus;

/// Liveness response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Body of `PUT /tasks/{name}/enabled`.
#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    /// Whether the schedule should be armed.
    pub enabled: bool,
}

/// Response to a task or bulk-operation request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Task or operation the request was about.
    pub name: String,
    /// What happened.
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by admin handlers.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Busy(_) | SyncError::DuplicateTask(_) => StatusCode::CONFLICT,
            SyncError::InvalidSchedule { .. } | SyncError::Configuration(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Admin request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Admin web service over a maintenance orchestrator.
pub struct AdminWebService {
    orchestrator: MaintenanceOrchestrator,
}

impl AdminWebService {
    /// Create the service.
    pub fn new(orchestrator: MaintenanceOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Create the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(liveness))
            .route("/health/catalog", get(catalog_health))
            .route("/tasks", get(list_tasks))
            .route("/tasks/:name/run", post(run_task))
            .route("/tasks/:name/enabled", put(set_task_enabled))
            .route("/progress", get(bulk_progress))
            .route("/progress/stop", post(stop_bulk))
            .route("/stats", get(catalog_stats))
            .route("/archives/:book_id", get(find_archive))
            .with_state(self.orchestrator.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }

    /// Serve on `bind_address` until `shutdown` resolves.
    pub async fn serve<F>(&self, bind_address: &str, shutdown: F) -> SyncResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(bind_address)
            .await
            .map_err(|e| {
                SyncError::Configuration(format!("Failed to bind to {}: {}", bind_address, e))
            })?;

        info!("Admin interface listening on {}", bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

async fn liveness() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

async fn catalog_health(State(orchestrator): State<MaintenanceOrchestrator>) -> Response {
    let report = orchestrator.health_check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn list_tasks(
    State(orchestrator): State<MaintenanceOrchestrator>,
) -> Json<BTreeMap<String, TaskStatus>> {
    Json(orchestrator.status().await)
}

async fn run_task(
    State(orchestrator): State<MaintenanceOrchestrator>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match orchestrator.run_detached(&name).await? {
        Some(_handle) => {
            debug!(task = %name, "Task started from admin interface");
            Ok((
                StatusCode::ACCEPTED,
                Json(ActionResponse {
                    name,
                    message: "started".to_string(),
                }),
            )
                .into_response())
        }
        None => Ok((
            StatusCode::CONFLICT,
            Json(ActionResponse {
                name,
                message: "already running".to_string(),
            }),
        )
            .into_response()),
    }
}

async fn set_task_enabled(
    State(orchestrator): State<MaintenanceOrchestrator>,
    Path(name): Path<String>,
    Json(request): Json<EnabledRequest>,
) -> Result<Json<TaskStatus>, ApiError> {
    orchestrator.set_enabled(&name, request.enabled).await?;
    orchestrator
        .status()
        .await
        .remove(&name)
        .map(Json)
        .ok_or_else(|| ApiError(SyncError::TaskNotFound(name)))
}

async fn bulk_progress(State(orchestrator): State<MaintenanceOrchestrator>) -> impl IntoResponse {
    Json(orchestrator.bulk_progress().await)
}

async fn stop_bulk(State(orchestrator): State<MaintenanceOrchestrator>) -> Response {
    let progress = orchestrator.bulk_progress().await;
    let name = progress.operation.unwrap_or_default();
    if orchestrator.stop_bulk().await {
        (
            StatusCode::ACCEPTED,
            Json(ActionResponse {
                name,
                message: "stop requested".to_string(),
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(ActionResponse {
                name,
                message: "no bulk operation running".to_string(),
            }),
        )
            .into_response()
    }
}

async fn catalog_stats(
    State(orchestrator): State<MaintenanceOrchestrator>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(orchestrator.stats().await?))
}

async fn find_archive(
    State(orchestrator): State<MaintenanceOrchestrator>,
    Path(book_id): Path<i64>,
) -> Result<Response, ApiError> {
    Ok(match orchestrator.find_archive(book_id).await? {
        Some(mapping) => Json(mapping).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}
