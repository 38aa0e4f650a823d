//! Built-in job handlers.
//!
//! Three notification jobs (daily reminder, weekly summary, custom
//! reminder) and the database backup job. Notification handlers resolve a
//! user cohort through the store, render one email per user, and hand the
//! batch to the mailer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::backup::{BackupEngine, BackupOptions};
use crate::mailer::{send_bulk, BulkMailer, BulkSendReport, OutboundEmail};
use crate::store::{DocumentStore, UserFilter, UserRecord};

use super::job::HandlerError;
use super::registry::JobHandler;

/// Weekly summaries carry larger rendered content, so they go out in
/// smaller batches with a longer pause.
const WEEKLY_BATCH_SIZE: usize = 5;

/// Only users seen within this window get a weekly summary.
const WEEKLY_ACTIVE_DAYS: i64 = 7;

fn report_json(report: &BulkSendReport, total_users: u64) -> Value {
    json!({
        "sent": report.sent,
        "failed": report.failed,
        "totalUsers": total_users,
        "failedRecipients": report.failed_recipients,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Daily Reminder
// ═══════════════════════════════════════════════════════════════════════════════

pub struct DailyReminderHandler {
    store: Arc<dyn DocumentStore>,
    mailer: Arc<dyn BulkMailer>,
    batch_size: usize,
    batch_delay: Duration,
}

impl DailyReminderHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        mailer: Arc<dyn BulkMailer>,
        batch_size: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            batch_size,
            batch_delay,
        }
    }
}

#[async_trait]
impl JobHandler for DailyReminderHandler {
    async fn run(&self, _payload: &Value) -> Result<Value, HandlerError> {
        let users = self
            .store
            .find_users(&UserFilter::default())
            .await
            .map_err(HandlerError::from)?;
        let total = users.len() as u64;
        tracing::info!(users = total, "Sending daily reminders");

        let emails = users
            .iter()
            .map(|user| OutboundEmail {
                to: user.email.clone(),
                subject: "Your daily reminder".to_string(),
                content: format!(
                    "Hi {}, here is your daily reminder to check in on your tasks.",
                    user.first_name
                ),
                template_data: json!({ "firstName": user.first_name }),
            })
            .collect();

        let report = send_bulk(&*self.mailer, emails, self.batch_size, self.batch_delay).await;
        tracing::info!(sent = report.sent, failed = report.failed, "Daily reminders done");
        Ok(report_json(&report, total))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Weekly Summary
// ═══════════════════════════════════════════════════════════════════════════════

pub struct WeeklySummaryHandler {
    store: Arc<dyn DocumentStore>,
    mailer: Arc<dyn BulkMailer>,
    batch_delay: Duration,
}

impl WeeklySummaryHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        mailer: Arc<dyn BulkMailer>,
        batch_delay: Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            batch_delay,
        }
    }
}

#[async_trait]
impl JobHandler for WeeklySummaryHandler {
    async fn run(&self, _payload: &Value) -> Result<Value, HandlerError> {
        let filter = UserFilter {
            last_login_within_days: Some(WEEKLY_ACTIVE_DAYS),
            ..Default::default()
        };
        let users = self
            .store
            .find_users(&filter)
            .await
            .map_err(HandlerError::from)?;
        let total = users.len() as u64;
        tracing::info!(users = total, "Sending weekly summaries");

        let emails = users
            .iter()
            .map(|user| OutboundEmail {
                to: user.email.clone(),
                subject: "Your weekly summary".to_string(),
                content: format!(
                    "Hi {}, here is a recap of your activity over the past week.",
                    user.first_name
                ),
                template_data: json!({
                    "firstName": user.first_name,
                    "lastName": user.last_name,
                }),
            })
            .collect();

        let report = send_bulk(&*self.mailer, emails, WEEKLY_BATCH_SIZE, self.batch_delay).await;
        tracing::info!(sent = report.sent, failed = report.failed, "Weekly summaries done");
        Ok(report_json(&report, total))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Custom Reminder
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomReminderPayload {
    subject: Option<String>,
    content: Option<String>,
    #[serde(default)]
    template_data: Option<Value>,
    #[serde(default)]
    user_filter: UserFilter,
}

pub struct CustomReminderHandler {
    store: Arc<dyn DocumentStore>,
    mailer: Arc<dyn BulkMailer>,
    batch_size: usize,
    batch_delay: Duration,
}

impl CustomReminderHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        mailer: Arc<dyn BulkMailer>,
        batch_size: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            batch_size,
            batch_delay,
        }
    }
}

#[async_trait]
impl JobHandler for CustomReminderHandler {
    async fn run(&self, payload: &Value) -> Result<Value, HandlerError> {
        let payload: CustomReminderPayload = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::fatal(format!("Invalid custom reminder payload: {}", e)))?;

        let subject = payload
            .subject
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| HandlerError::fatal("Custom reminder requires a subject"))?;
        let content = payload
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| HandlerError::fatal("Custom reminder requires content"))?;
        let base_data = payload.template_data.unwrap_or_else(|| json!({}));

        let users = self
            .store
            .find_users(&payload.user_filter)
            .await
            .map_err(HandlerError::from)?;
        let total = users.len() as u64;
        tracing::info!(users = total, subject = %subject, "Sending custom reminders");

        let emails = users
            .iter()
            .map(|user: &UserRecord| {
                let mut template_data = base_data.clone();
                if let Some(data) = template_data.as_object_mut() {
                    data.insert("firstName".to_string(), json!(user.first_name));
                }
                OutboundEmail {
                    to: user.email.clone(),
                    subject: subject.clone(),
                    content: content.clone(),
                    template_data,
                }
            })
            .collect();

        let report = send_bulk(&*self.mailer, emails, self.batch_size, self.batch_delay).await;
        tracing::info!(sent = report.sent, failed = report.failed, "Custom reminders done");
        Ok(report_json(&report, total))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Backup
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BackupHandler {
    engine: Arc<BackupEngine>,
}

impl BackupHandler {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for BackupHandler {
    async fn run(&self, payload: &Value) -> Result<Value, HandlerError> {
        let options: BackupOptions = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::fatal(format!("Invalid backup payload: {}", e)))?;

        let report = self
            .engine
            .create(options)
            .await
            .map_err(HandlerError::from)?;

        serde_json::to_value(&report)
            .map_err(|e| HandlerError::fatal(format!("Failed to serialize backup report: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MailError;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingMailer {
        sent: Mutex<Vec<OutboundEmail>>,
    }

    impl RecordingMailer {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BulkMailer for RecordingMailer {
        async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new("testdb"));
        store.put_collection(
            "users",
            vec![
                json!({
                    "_id": "u1",
                    "email": "ann@example.com",
                    "first_name": "Ann",
                    "last_name": "Lee",
                    "active": true,
                    "email_verified": true,
                    "deleted": false,
                }),
                json!({
                    "_id": "u2",
                    "email": "gone@example.com",
                    "first_name": "Gone",
                    "last_name": "User",
                    "active": false,
                    "email_verified": true,
                    "deleted": false,
                }),
            ],
        );
        store
    }

    #[tokio::test]
    async fn test_daily_reminder_targets_active_users() {
        let store = seeded_store();
        let mailer = Arc::new(RecordingMailer::new());
        let handler = DailyReminderHandler::new(
            store,
            mailer.clone(),
            10,
            Duration::from_millis(1),
        );

        let result = handler.run(&json!({})).await.unwrap();
        assert_eq!(result["sent"], 1);
        assert_eq!(result["totalUsers"], 1);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ann@example.com");
    }

    #[tokio::test]
    async fn test_custom_reminder_requires_subject_and_content() {
        let store = seeded_store();
        let mailer = Arc::new(RecordingMailer::new());
        let handler = CustomReminderHandler::new(store, mailer, 10, Duration::from_millis(1));

        let err = handler.run(&json!({"content": "hi"})).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("subject"));

        let err = handler.run(&json!({"subject": "hi"})).await.unwrap_err();
        assert!(err.message.contains("content"));
    }

    #[tokio::test]
    async fn test_custom_reminder_uses_payload_content() {
        let store = seeded_store();
        let mailer = Arc::new(RecordingMailer::new());
        let handler = CustomReminderHandler::new(
            store,
            mailer.clone(),
            10,
            Duration::from_millis(1),
        );

        let result = handler
            .run(&json!({
                "subject": "Heads up",
                "content": "Maintenance tonight",
                "templateData": {"window": "22:00-23:00"},
            }))
            .await
            .unwrap();
        assert_eq!(result["sent"], 1);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Heads up");
        assert_eq!(sent[0].content, "Maintenance tonight");
        // Caller-supplied template data is carried through, enriched with
        // the per-user fields.
        assert_eq!(sent[0].template_data["window"], "22:00-23:00");
        assert_eq!(sent[0].template_data["firstName"], "Ann");
    }

    #[tokio::test]
    async fn test_weekly_summary_requires_recent_login() {
        let store = Arc::new(MemoryStore::new("testdb"));
        store.put_collection(
            "users",
            vec![json!({
                "_id": "u1",
                "email": "quiet@example.com",
                "first_name": "Quiet",
                "last_name": "User",
                "active": true,
                "email_verified": true,
                "deleted": false,
            })],
        );
        let mailer = Arc::new(RecordingMailer::new());
        let handler = WeeklySummaryHandler::new(store, mailer.clone(), Duration::from_millis(1));

        // No last_login_at at all means outside the window.
        let result = handler.run(&json!({})).await.unwrap();
        assert_eq!(result["totalUsers"], 0);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }
}
