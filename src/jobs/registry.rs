//! Job handler registry.
//!
//! Maps each [`JobType`] to the code that executes it. Both the durable
//! worker and the fallback executor resolve handlers through the registry,
//! so a job behaves identically on either path.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::BackupEngine;
use crate::config::MailerConfig;
use crate::mailer::BulkMailer;
use crate::store::DocumentStore;

use super::handlers::{BackupHandler, CustomReminderHandler, DailyReminderHandler, WeeklySummaryHandler};
use super::job::{HandlerError, JobType};

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job with its payload. The returned value is recorded on the
    /// job's history entry.
    async fn run(&self, payload: &Value) -> Result<Value, HandlerError>;
}

/// The set of registered job handlers.
pub struct JobHandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// An empty registry. Mostly useful in tests.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The standard registry: one handler per job type.
    pub fn builtin(
        store: Arc<dyn DocumentStore>,
        mailer: Arc<dyn BulkMailer>,
        backup: Arc<BackupEngine>,
        mailer_config: &MailerConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            JobType::DailyReminder,
            Arc::new(DailyReminderHandler::new(
                store.clone(),
                mailer.clone(),
                mailer_config.batch_size,
                Duration::from_millis(mailer_config.batch_delay_ms),
            )),
        );
        registry.register(
            JobType::WeeklySummary,
            Arc::new(WeeklySummaryHandler::new(
                store.clone(),
                mailer.clone(),
                Duration::from_millis(3000),
            )),
        );
        registry.register(
            JobType::CustomReminder,
            Arc::new(CustomReminderHandler::new(
                store,
                mailer,
                mailer_config.batch_size,
                Duration::from_millis(mailer_config.batch_delay_ms),
            )),
        );
        registry.register(JobType::DatabaseBackup, Arc::new(BackupHandler::new(backup)));
        registry
    }

    /// Register or replace the handler for a job type.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    /// Check whether a handler exists for a job type.
    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Execute the handler for a job type.
    pub async fn run(&self, job_type: JobType, payload: &Value) -> Result<Value, HandlerError> {
        match self.handlers.get(&job_type) {
            Some(handler) => handler.run(payload).await,
            None => Err(HandlerError::fatal(format!(
                "No handler registered for job type '{}'",
                job_type
            ))),
        }
    }
}

impl Default for JobHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(&self, payload: &Value) -> Result<Value, HandlerError> {
            Ok(payload.clone())
        }
    }

    #[tokio::test]
    async fn test_registered_handler_runs() {
        let mut registry = JobHandlerRegistry::new();
        registry.register(JobType::DailyReminder, Arc::new(EchoHandler));

        assert!(registry.contains(JobType::DailyReminder));
        let result = registry
            .run(JobType::DailyReminder, &json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_missing_handler_is_fatal() {
        let registry = JobHandlerRegistry::new();
        let err = registry
            .run(JobType::WeeklySummary, &json!({}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }
}
