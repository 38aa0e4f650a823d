//! Admin HTTP surface.
//!
//! Every endpoint returns the same envelope: `{ success, data }` on
//! success, `{ success: false, error, errorCode }` on failure. Errors map
//! to status codes through [`ForgeError`](crate::error::ForgeError).

mod handlers;

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backup::BackupEngine;
use crate::jobs::{JobQueue, TaskScheduler};
use crate::store::DocumentStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub scheduler: Arc<TaskScheduler>,
    pub backup: Arc<BackupEngine>,
    pub store: Arc<dyn DocumentStore>,
}

/// Build the admin router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/jobs/stats", get(handlers::queue_stats))
        .route("/jobs/history", get(handlers::job_history))
        .route("/jobs/trigger", post(handlers::trigger_job))
        .route("/jobs/send-custom-email", post(handlers::send_custom_email))
        .route("/jobs/test-email", post(handlers::send_test_email))
        .route("/jobs/preview-count", post(handlers::preview_recipient_count))
        .route(
            "/jobs/scheduler",
            get(handlers::scheduler_status).post(handlers::scheduler_control),
        )
        .route("/jobs/scheduler/tasks", post(handlers::add_custom_task))
        .route("/jobs/scheduler/start-all", post(handlers::start_all_tasks))
        .route("/jobs/scheduler/stop-all", post(handlers::stop_all_tasks))
        .route("/jobs/scheduler/:name", delete(handlers::remove_task))
        .route("/jobs/scheduler/:name/start", post(handlers::start_task))
        .route("/jobs/scheduler/:name/stop", post(handlers::stop_task))
        .route("/jobs/backup/create", post(handlers::create_backup))
        .route("/jobs/backup/list", get(handlers::list_backups))
        .route("/jobs/backup/status", get(handlers::backup_status))
        .route("/jobs/backup/:name", delete(handlers::delete_backup))
        .route("/jobs/backup/:name/restore", post(handlers::restore_backup))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success_shape() {
        let response = ApiResponse::success(42);
        assert!(response.success);
        assert_eq!(response.data, Some(42));
        assert!(response.error.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["success"], true);
    }
}
