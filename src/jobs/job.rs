//! Job domain types.
//!
//! - **JobType**: the fixed set of background job kinds
//! - **JobStatus**: forward-only lifecycle states
//! - **JobRecord**: one unit of background work and its outcome
//! - **RetryPolicy**: durable-mode retry behavior with exponential backoff

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::error::ForgeError;

/// Prefix for ids synthesized by the fallback executor, so operators can
/// tell at a glance which path ran a job.
pub const FALLBACK_ID_PREFIX: &str = "mem_";

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The fixed set of job kinds this service executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DailyReminder,
    WeeklySummary,
    CustomReminder,
    DatabaseBackup,
}

impl JobType {
    /// All valid job types, for validation messages.
    pub const ALL: [JobType; 4] = [
        Self::DailyReminder,
        Self::WeeklySummary,
        Self::CustomReminder,
        Self::DatabaseBackup,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DailyReminder => "daily_reminder",
            Self::WeeklySummary => "weekly_summary",
            Self::CustomReminder => "custom_reminder",
            Self::DatabaseBackup => "database_backup",
        }
    }

    /// The valid type names, for error messages.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.as_str()).collect()
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_reminder" => Ok(Self::DailyReminder),
            "weekly_summary" => Ok(Self::WeeklySummary),
            "custom_reminder" => Ok(Self::CustomReminder),
            "database_backup" => Ok(Self::DatabaseBackup),
            other => Err(ForgeError::unknown_job_type(other, &Self::names())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job. Transitions only move forward; `Queued` is only valid
/// in durable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the durable broker
    Queued,
    /// Currently executing
    Active,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    /// Check if the job reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Priority and Submit Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for submissions. High-priority jobs jump the durable
/// queue; manual triggers use this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    #[default]
    Normal,
    High,
}

/// Options accepted by `JobQueue::submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: JobPriority,
}

impl SubmitOptions {
    pub fn high_priority() -> Self {
        Self {
            priority: JobPriority::High,
        }
    }
}

/// Handle returned to submitters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// One unit of background work and its recorded outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Broker-assigned or `mem_`-prefixed fallback id
    pub id: String,
    /// Job kind
    pub job_type: JobType,
    /// Handler-specific payload
    pub payload: Value,
    /// Current status
    pub status: JobStatus,
    /// Submission priority
    #[serde(default)]
    pub priority: JobPriority,
    /// Execution attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// When the job was submitted
    pub submitted_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Handler result, present iff completed
    pub result: Option<Value>,
    /// Error message, present iff failed
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, job_type: JobType, payload: Value, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            job_type,
            payload,
            status,
            priority: JobPriority::Normal,
            attempts: 0,
            submitted_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Check if this job ran on the fallback path.
    pub fn is_fallback(&self) -> bool {
        self.id.starts_with(FALLBACK_ID_PREFIX)
    }

    /// Mark as executing.
    pub fn mark_active(&mut self) {
        debug_assert!(!self.status.is_terminal());
        self.status = JobStatus::Active;
        self.attempts += 1;
    }

    /// Mark as completed with the handler result.
    pub fn mark_completed(&mut self, result: Value) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    /// Mark as failed with the handler error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a job handler. Caught per-job and recorded on the
/// `JobRecord`; never crashes the worker loop.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Whether the durable broker should retry this job
    pub retryable: bool,
}

impl HandlerError {
    /// A transient failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<ForgeError> for HandlerError {
    fn from(err: ForgeError) -> Self {
        Self {
            message: err.user_message().to_string(),
            retryable: err.is_retryable(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable-mode retry behavior: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, first execution included
    pub max_attempts: u32,
    /// Delay before the first retry (seconds); doubles each retry
    pub initial_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 5,
        }
    }
}

impl RetryPolicy {
    /// Check if another attempt is allowed after `attempts` executions.
    pub fn should_retry(&self, attempts: u32, error: &HandlerError) -> bool {
        error.retryable && attempts < self.max_attempts
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let secs = self.initial_delay_secs.saturating_mul(1u64 << retry.min(16));
        Duration::from_secs(secs)
    }
}

/// Queue statistics, derived on demand from the active backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
