//! Bulk-send boundary for notification delivery.
//!
//! Handlers only depend on the [`BulkMailer`] trait plus the [`send_bulk`]
//! helper, which batches sends and enforces an inter-batch delay to respect
//! downstream provider rate limits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// One email ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub content: String,
    /// Provider template variables (first name, action URL, ...)
    #[serde(default)]
    pub template_data: Value,
}

/// Delivery failure for a single recipient.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct MailError {
    pub message: String,
}

impl MailError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Capability to deliver a single email.
#[async_trait]
pub trait BulkMailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<(), MailError>;
}

/// Aggregate outcome of a bulk send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSendReport {
    pub sent: u64,
    pub failed: u64,
    pub total: u64,
    pub failed_recipients: Vec<String>,
}

/// Send a list of emails in batches with a delay between batches.
///
/// Individual failures never abort the run; they are counted and the
/// recipients recorded for debugging.
pub async fn send_bulk(
    mailer: &dyn BulkMailer,
    emails: Vec<OutboundEmail>,
    batch_size: usize,
    batch_delay: Duration,
) -> BulkSendReport {
    let mut report = BulkSendReport {
        total: emails.len() as u64,
        ..Default::default()
    };
    let batch_size = batch_size.max(1);
    let batch_count = emails.len().div_ceil(batch_size);

    for (index, batch) in emails.chunks(batch_size).enumerate() {
        let results =
            futures::future::join_all(batch.iter().map(|email| mailer.send(email))).await;

        for (email, result) in batch.iter().zip(results) {
            match result {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    tracing::warn!(recipient = %email.to, error = %err, "Email delivery failed");
                    report.failed += 1;
                    report.failed_recipients.push(email.to.clone());
                }
            }
        }

        if index + 1 < batch_count {
            tokio::time::sleep(batch_delay).await;
        }
    }

    report
}

/// Mailer that logs instead of delivering. Default when no provider is
/// configured.
pub struct LogMailer;

#[async_trait]
impl BulkMailer for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<(), MailError> {
        tracing::info!(recipient = %email.to, subject = %email.subject, "Email (log only)");
        Ok(())
    }
}
