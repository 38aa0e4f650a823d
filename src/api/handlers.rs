//! Admin endpoint handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backup::{BackupOptions, RestoreOptions};
use crate::error::{ForgeError, Result};
use crate::jobs::{JobType, SubmitOptions};
use crate::store::UserFilter;

use super::{ApiResponse, AppState};

/// Stats are "needing attention" well before the queue counts as
/// unhealthy, so operators see trouble building up.
const ATTENTION_FAILED_MIN: u64 = 10;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Stats
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    let queue_health = state.queue.health().await;
    let attention = if queue_health.stats.failed >= ATTENTION_FAILED_MIN {
        "needs_attention"
    } else {
        "healthy"
    };
    let tasks = state.scheduler.task_statuses();
    let running = tasks.iter().filter(|t| t.running).count();

    Ok(Json(ApiResponse::success(json!({
        "status": if queue_health.healthy { "ok" } else { "degraded" },
        "queue": queue_health,
        "queueHealth": attention,
        "scheduler": {
            "tasks": tasks.len(),
            "running": running,
        },
        "backupInProgress": state.backup.in_progress(),
        "storeConnected": state.store.is_connected().await,
    }))))
}

pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    let stats = state.queue.stats().await;
    let attention = if stats.failed >= ATTENTION_FAILED_MIN {
        "needs_attention"
    } else {
        "healthy"
    };
    Ok(Json(ApiResponse::success(json!({
        "stats": stats,
        "totalProcessed": stats.completed + stats.failed,
        "queueHealth": attention,
        "durable": state.queue.is_durable(),
    }))))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn job_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Value>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let history = state.queue.history(limit).await;
    Ok(Json(ApiResponse::success(json!({
        "history": history,
        "durable": state.queue.is_durable(),
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Submission
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub job_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Manually trigger a job. Manual triggers jump the queue.
pub async fn trigger_job(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<ApiResponse<Value>>> {
    let job_type: JobType = request
        .job_type
        .as_deref()
        .ok_or_else(|| ForgeError::missing_field("jobType"))?
        .parse()?;

    let handle = state
        .queue
        .submit(job_type, request.data, SubmitOptions::high_priority())
        .await?;

    Ok(Json(ApiResponse::success(json!({
        "jobId": handle.id,
        "jobType": job_type,
        "durable": state.queue.is_durable(),
    }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEmailRequest {
    pub subject: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub template_data: Option<Value>,
    #[serde(default)]
    pub user_filter: UserFilter,
}

pub async fn send_custom_email(
    State(state): State<AppState>,
    Json(request): Json<CustomEmailRequest>,
) -> Result<Json<ApiResponse<Value>>> {
    let subject = request
        .subject
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ForgeError::missing_field("subject"))?;
    let content = request
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ForgeError::missing_field("content"))?;

    let payload = json!({
        "subject": subject,
        "content": content,
        "templateData": request.template_data,
        "userFilter": request.user_filter,
    });
    let handle = state
        .queue
        .submit(JobType::CustomReminder, payload, SubmitOptions::default())
        .await?;

    Ok(Json(ApiResponse::success(json!({
        "jobId": handle.id,
        "durable": state.queue.is_durable(),
    }))))
}

#[derive(Debug, Deserialize)]
pub struct TestEmailRequest {
    pub email: Option<String>,
}

/// Queue a test email targeted at a single recipient. Runs through the
/// normal custom-reminder pipeline so it exercises the same path real
/// notifications take.
pub async fn send_test_email(
    State(state): State<AppState>,
    Json(request): Json<TestEmailRequest>,
) -> Result<Json<ApiResponse<Value>>> {
    let recipient = request
        .email
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ForgeError::missing_field("email"))?;

    let payload = json!({
        "subject": "Test email",
        "content": "This is a test email from the background-work service.",
        "userFilter": { "email": recipient },
    });
    let handle = state
        .queue
        .submit(JobType::CustomReminder, payload, SubmitOptions::high_priority())
        .await?;

    Ok(Json(ApiResponse::success(json!({
        "jobId": handle.id,
        "recipient": recipient,
    }))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewCountRequest {
    pub user_filter: UserFilter,
}

/// Count the users a notification would reach, without sending anything.
pub async fn preview_recipient_count(
    State(state): State<AppState>,
    Json(request): Json<PreviewCountRequest>,
) -> Result<Json<ApiResponse<Value>>> {
    let count = state.store.count_users(&request.user_filter).await?;
    Ok(Json(ApiResponse::success(json!({ "count": count }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn scheduler_status(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    Ok(Json(ApiResponse::success(json!({
        "tasks": state.scheduler.task_statuses(),
    }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerControlRequest {
    pub action: Option<String>,
    pub task_name: Option<String>,
}

/// Dispatch a scheduler action: `start_all`, `stop_all`, `start_task`,
/// `stop_task` or `status`. Per-task actions on unknown names are logged
/// and ignored.
pub async fn scheduler_control(
    State(state): State<AppState>,
    Json(request): Json<SchedulerControlRequest>,
) -> Result<Json<ApiResponse<Value>>> {
    let action = request
        .action
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ForgeError::missing_field("action"))?;

    match action.as_str() {
        "start_all" => state.scheduler.start_all(),
        "stop_all" => state.scheduler.stop_all(),
        "start_task" => {
            let name = request
                .task_name
                .ok_or_else(|| ForgeError::missing_field("taskName"))?;
            state.scheduler.start(&name);
        }
        "stop_task" => {
            let name = request
                .task_name
                .ok_or_else(|| ForgeError::missing_field("taskName"))?;
            state.scheduler.stop(&name);
        }
        "status" => {}
        other => {
            return Err(ForgeError::validation(format!(
                "Unknown scheduler action '{}'",
                other
            )))
        }
    }

    Ok(Json(ApiResponse::success(json!({
        "action": action,
        "tasks": state.scheduler.task_statuses(),
    }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomTaskRequest {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub job_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Register a custom cron task that submits a job on each firing. A task
/// with the same name is replaced. The new task starts immediately.
pub async fn add_custom_task(
    State(state): State<AppState>,
    Json(request): Json<CustomTaskRequest>,
) -> Result<Json<ApiResponse<Value>>> {
    let name = request
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ForgeError::missing_field("name"))?;
    let cron = request
        .cron
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ForgeError::missing_field("cron"))?;
    let job_type: JobType = request
        .job_type
        .as_deref()
        .ok_or_else(|| ForgeError::missing_field("jobType"))?
        .parse()?;

    let queue = state.queue.clone();
    let payload = request.payload;
    let task_name = name.clone();
    state.scheduler.register(
        name.clone(),
        &cron,
        std::sync::Arc::new(move || {
            let queue = queue.clone();
            let payload = payload.clone();
            let task_name = task_name.clone();
            Box::pin(async move {
                match queue
                    .submit(job_type, payload, SubmitOptions::default())
                    .await
                {
                    Ok(handle) => {
                        tracing::info!(task = %task_name, job_id = %handle.id, "Custom task submitted job")
                    }
                    Err(e) => {
                        tracing::error!(task = %task_name, error = %e, "Custom task submission failed")
                    }
                }
            })
        }),
    )?;
    state.scheduler.start(&name);

    Ok(Json(ApiResponse::success(json!({
        "task": name,
        "cron": cron,
        "jobType": job_type,
        "running": true,
    }))))
}

pub async fn remove_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>> {
    state.scheduler.remove(&name)?;
    Ok(Json(ApiResponse::success(json!({ "removed": name }))))
}

pub async fn start_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>> {
    let known = state.scheduler.start(&name);
    Ok(Json(ApiResponse::success(json!({ "task": name, "running": known }))))
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>> {
    state.scheduler.stop(&name);
    Ok(Json(ApiResponse::success(json!({ "task": name, "running": false }))))
}

pub async fn start_all_tasks(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    state.scheduler.start_all();
    Ok(Json(ApiResponse::success(json!({
        "tasks": state.scheduler.task_statuses(),
    }))))
}

pub async fn stop_all_tasks(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    state.scheduler.stop_all();
    Ok(Json(ApiResponse::success(json!({
        "tasks": state.scheduler.task_statuses(),
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backups
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn create_backup(
    State(state): State<AppState>,
    body: Option<Json<BackupOptions>>,
) -> Result<Json<ApiResponse<Value>>> {
    let options = body.map(|Json(options)| options).unwrap_or_default();
    let report = state.backup.create(options).await?;
    Ok(Json(ApiResponse::success(json!({ "backup": report }))))
}

pub async fn list_backups(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    let backups = state.backup.list().await?;
    Ok(Json(ApiResponse::success(json!({
        "count": backups.len(),
        "backups": backups,
    }))))
}

pub async fn backup_status(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>> {
    let status = state.backup.status().await?;
    let schedule = state
        .scheduler
        .task_statuses()
        .into_iter()
        .find(|t| t.name == "database-backup");
    Ok(Json(ApiResponse::success(json!({
        "status": status,
        "schedule": schedule,
    }))))
}

pub async fn delete_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>> {
    state.backup.delete(&name).await?;
    Ok(Json(ApiResponse::success(json!({ "deleted": name }))))
}

pub async fn restore_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<RestoreOptions>>,
) -> Result<Json<ApiResponse<Value>>> {
    let options = body.map(|Json(options)| options).unwrap_or_default();
    let report = state.backup.restore(&name, options).await?;
    Ok(Json(ApiResponse::success(json!({ "restore": report }))))
}
