//! Cron scheduler for recurring background tasks.
//!
//! Each registered task gets its own timer loop that fires on a cron
//! schedule in the configured timezone. Tasks are registered stopped;
//! stopping a running task gates future ticks without interrupting an
//! execution already in flight.

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::SchedulerConfig;
use crate::error::{ErrorCode, ForgeError, Result};

use super::job::{JobType, SubmitOptions};
use super::queue::JobQueue;

/// What a task does when its schedule fires.
pub type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Point-in-time state of one scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub name: String,
    pub expression: String,
    pub running: bool,
}

#[derive(Debug)]
struct TaskHandle {
    expression: String,
    enabled: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

/// Named, individually start/stoppable cron tasks.
#[derive(Debug)]
pub struct TaskScheduler {
    tasks: DashMap<String, TaskHandle>,
    timezone: Tz,
}

impl TaskScheduler {
    pub fn new(timezone: &str) -> Result<Self> {
        let timezone = Tz::from_str(timezone).map_err(|_| {
            ForgeError::new(
                ErrorCode::ConfigurationError,
                format!("Unknown timezone '{}'", timezone),
            )
        })?;
        Ok(Self {
            tasks: DashMap::new(),
            timezone,
        })
    }

    /// Register a task under a unique name. Replaces any existing task
    /// with the same name, stopping its timer first. The new task starts
    /// stopped.
    pub fn register(
        &self,
        name: impl Into<String>,
        expression: &str,
        action: TaskAction,
    ) -> Result<()> {
        let name = name.into();
        let schedule = Schedule::from_str(expression).map_err(|e| {
            ForgeError::with_internal(
                ErrorCode::InvalidCronExpression,
                format!("Invalid cron expression '{}'", expression),
                e.to_string(),
            )
        })?;

        if let Some((_, previous)) = self.tasks.remove(&name) {
            tracing::info!(task = %name, "Replacing scheduled task");
            let _ = previous.shutdown.send(true);
        }

        let enabled = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.spawn_timer(
            name.clone(),
            schedule,
            enabled.clone(),
            shutdown_rx,
            action,
        );

        self.tasks.insert(
            name,
            TaskHandle {
                expression: expression.to_string(),
                enabled,
                shutdown: shutdown_tx,
            },
        );
        Ok(())
    }

    fn spawn_timer(
        &self,
        name: String,
        schedule: Schedule,
        enabled: Arc<AtomicBool>,
        mut shutdown_rx: watch::Receiver<bool>,
        action: TaskAction,
    ) {
        let timezone = self.timezone;
        tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&timezone);
                let Some(next) = schedule.after(&now).next() else {
                    tracing::warn!(task = %name, "Schedule has no future fire times; timer exiting");
                    return;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // A dropped sender also means the task is gone.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::debug!(task = %name, "Task timer stopped");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {
                        if enabled.load(Ordering::SeqCst) {
                            tracing::info!(task = %name, "Scheduled task firing");
                            action().await;
                        }
                    }
                }
            }
        });
    }

    /// Start a task by name. Unknown names are logged and ignored; returns
    /// whether the task exists.
    pub fn start(&self, name: &str) -> bool {
        match self.tasks.get(name) {
            Some(task) => {
                task.enabled.store(true, Ordering::SeqCst);
                tracing::info!(task = %name, "Task started");
                true
            }
            None => {
                tracing::warn!(task = %name, "Start requested for unknown task");
                false
            }
        }
    }

    /// Stop a task by name. Only future ticks are affected. Unknown names
    /// are logged and ignored; returns whether the task exists.
    pub fn stop(&self, name: &str) -> bool {
        match self.tasks.get(name) {
            Some(task) => {
                task.enabled.store(false, Ordering::SeqCst);
                tracing::info!(task = %name, "Task stopped");
                true
            }
            None => {
                tracing::warn!(task = %name, "Stop requested for unknown task");
                false
            }
        }
    }

    /// Remove a task entirely, cancelling its timer.
    pub fn remove(&self, name: &str) -> Result<()> {
        match self.tasks.remove(name) {
            Some((_, task)) => {
                let _ = task.shutdown.send(true);
                tracing::info!(task = %name, "Task removed");
                Ok(())
            }
            None => Err(ForgeError::task_not_found(name)),
        }
    }

    /// Start every registered task.
    pub fn start_all(&self) {
        for task in self.tasks.iter() {
            task.enabled.store(true, Ordering::SeqCst);
        }
        tracing::info!(tasks = self.tasks.len(), "All scheduled tasks started");
    }

    /// Stop every registered task.
    pub fn stop_all(&self) {
        for task in self.tasks.iter() {
            task.enabled.store(false, Ordering::SeqCst);
        }
        tracing::info!(tasks = self.tasks.len(), "All scheduled tasks stopped");
    }

    /// Status of every registered task, sorted by name.
    pub fn task_statuses(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .tasks
            .iter()
            .map(|entry| TaskStatus {
                name: entry.key().clone(),
                expression: entry.value().expression.clone(),
                running: entry.value().enabled.load(Ordering::SeqCst),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Tear down all task timers. Used on shutdown.
    pub fn shutdown(&self) {
        for task in self.tasks.iter() {
            let _ = task.shutdown.send(true);
        }
        self.tasks.clear();
    }

    /// Register the service's standing tasks, all initially stopped.
    pub fn register_builtin(&self, queue: Arc<JobQueue>, config: &SchedulerConfig) -> Result<()> {
        let q = queue.clone();
        self.register(
            "daily-reminders",
            &config.daily_reminder_cron,
            Arc::new(move || {
                let q = q.clone();
                Box::pin(async move {
                    submit_scheduled(&q, JobType::DailyReminder, json!({})).await;
                })
            }),
        )?;

        let q = queue.clone();
        self.register(
            "weekly-summaries",
            &config.weekly_summary_cron,
            Arc::new(move || {
                let q = q.clone();
                Box::pin(async move {
                    submit_scheduled(&q, JobType::WeeklySummary, json!({})).await;
                })
            }),
        )?;

        let q = queue.clone();
        self.register(
            "queue-health-check",
            &config.health_check_cron,
            Arc::new(move || {
                let q = q.clone();
                Box::pin(async move {
                    let health = q.health().await;
                    if health.healthy {
                        tracing::debug!(
                            waiting = health.stats.waiting,
                            failed = health.stats.failed,
                            "Queue health check passed"
                        );
                    } else {
                        for warning in &health.warnings {
                            tracing::warn!(durable = health.durable, "{}", warning);
                        }
                    }
                })
            }),
        )?;

        let q = queue.clone();
        self.register(
            "history-cleanup",
            &config.cleanup_cron,
            Arc::new(move || {
                let q = q.clone();
                Box::pin(async move {
                    if let Err(e) = q.cleanup_history().await {
                        tracing::warn!(error = %e, "History cleanup failed");
                    }
                })
            }),
        )?;

        self.register(
            "database-backup",
            &config.backup_cron,
            Arc::new(move || {
                let q = queue.clone();
                Box::pin(async move {
                    submit_scheduled(&q, JobType::DatabaseBackup, json!({})).await;
                })
            }),
        )?;

        Ok(())
    }
}

async fn submit_scheduled(queue: &JobQueue, job_type: JobType, payload: serde_json::Value) {
    match queue.submit(job_type, payload, SubmitOptions::default()).await {
        Ok(handle) => {
            tracing::info!(job_id = %handle.id, job_type = %job_type, "Scheduled job submitted")
        }
        Err(e) => {
            tracing::error!(job_type = %job_type, error = %e, "Scheduled job submission failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn noop_action() -> TaskAction {
        Arc::new(|| Box::pin(async {}))
    }

    #[tokio::test]
    async fn test_register_and_toggle() {
        let scheduler = TaskScheduler::new("UTC").unwrap();
        scheduler
            .register("nightly", "0 0 3 * * *", noop_action())
            .unwrap();

        let statuses = scheduler.task_statuses();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].running);

        assert!(scheduler.start("nightly"));
        assert!(scheduler.task_statuses()[0].running);

        assert!(scheduler.stop("nightly"));
        assert!(!scheduler.task_statuses()[0].running);
    }

    #[tokio::test]
    async fn test_remove_task() {
        let scheduler = TaskScheduler::new("UTC").unwrap();
        scheduler
            .register("gone", "0 0 3 * * *", noop_action())
            .unwrap();
        scheduler.remove("gone").unwrap();
        assert!(scheduler.task_statuses().is_empty());
        assert_eq!(
            scheduler.remove("gone").unwrap_err().code(),
            ErrorCode::TaskNotFound
        );
    }

    #[tokio::test]
    async fn test_unknown_task_start_stop_is_silent() {
        let scheduler = TaskScheduler::new("UTC").unwrap();
        scheduler
            .register("real", "0 0 3 * * *", noop_action())
            .unwrap();

        // Start/stop on a name that was never registered only logs.
        assert!(!scheduler.start("ghost"));
        assert!(!scheduler.stop("ghost"));
        let statuses = scheduler.task_statuses();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].running);
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let scheduler = TaskScheduler::new("UTC").unwrap();
        let err = scheduler
            .register("bad", "not a cron line", noop_action())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronExpression);
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let err = TaskScheduler::new("Mars/Olympus").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[tokio::test]
    async fn test_replacing_task_keeps_single_entry() {
        let scheduler = TaskScheduler::new("America/New_York").unwrap();
        scheduler
            .register("report", "0 0 8 * * *", noop_action())
            .unwrap();
        scheduler
            .register("report", "0 30 8 * * *", noop_action())
            .unwrap();

        let statuses = scheduler.task_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].expression, "0 30 8 * * *");
        // Replacement resets to stopped.
        assert!(!statuses[0].running);
    }

    #[tokio::test]
    async fn test_every_second_task_fires() {
        let scheduler = TaskScheduler::new("UTC").unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        scheduler
            .register(
                "tick",
                "* * * * * *",
                Arc::new(move || {
                    let c = c.clone();
                    Box::pin(async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .unwrap();
        assert!(scheduler.start("tick"));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown();
    }
}
