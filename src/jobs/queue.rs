//! Job queue with a durable Redis broker and a transparent in-process
//! fallback.
//!
//! [`JobQueue`] is the only surface callers see. When the broker is
//! reachable, jobs go through Redis lists and survive restarts; when it is
//! not, submissions degrade to the [`FallbackExecutor`], which runs jobs
//! sequentially in-process. Degradation and recovery are logged but never
//! surfaced to submitters as errors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::{ErrorCode, ForgeError, Result};

use super::job::{
    JobHandle, JobPriority, JobRecord, JobStatus, JobType, QueueStats, RetryPolicy,
    SubmitOptions, FALLBACK_ID_PREFIX,
};
use super::registry::JobHandlerRegistry;

/// Durable history caps: completed entries beyond this are trimmed away.
pub const COMPLETED_HISTORY_CAP: usize = 50;
/// Failed entries are kept longer for debugging.
pub const FAILED_HISTORY_CAP: usize = 100;
/// Fallback ring capacity, completed and failed combined.
pub const FALLBACK_HISTORY_CAP: usize = 100;

/// Above these, the queue is considered degraded.
pub const HEALTHY_FAILED_MAX: u64 = 50;
pub const HEALTHY_WAITING_MAX: u64 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// The durable queue backend. One Redis list per concern, all under a
/// configurable key prefix.
pub struct RedisBroker {
    client: redis::Client,
    key_prefix: String,
}

impl RedisBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            ForgeError::with_internal(
                ErrorCode::BrokerUnavailable,
                "Invalid broker URL",
                e.to_string(),
            )
        })?;
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ForgeError::with_internal(
                    ErrorCode::BrokerUnavailable,
                    "Failed to get broker connection",
                    e.to_string(),
                )
            })
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| {
                ForgeError::with_internal(
                    ErrorCode::BrokerUnavailable,
                    "Broker ping failed",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    /// Enqueue a new job, assigning it a broker id. High-priority jobs go
    /// to the head of the list.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: Value,
        priority: JobPriority,
    ) -> Result<JobRecord> {
        let mut conn = self.get_conn().await?;
        let id: i64 = redis::cmd("INCR")
            .arg(self.key("id"))
            .query_async(&mut conn)
            .await
            .map_err(ForgeError::from)?;

        let record = JobRecord::new(id.to_string(), job_type, payload, JobStatus::Queued)
            .with_priority(priority);
        self.push_queued(&mut conn, &record).await?;

        tracing::debug!(job_id = %record.id, job_type = %job_type, ?priority, "Job enqueued");
        Ok(record)
    }

    /// Put a previously dequeued job back on the queue, keeping its id and
    /// attempt count. Used for retries.
    pub async fn requeue(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.get_conn().await?;
        self.push_queued(&mut conn, record).await
    }

    async fn push_queued(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        record: &JobRecord,
    ) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        let cmd = match record.priority {
            JobPriority::High => "LPUSH",
            JobPriority::Normal => "RPUSH",
        };
        redis::cmd(cmd)
            .arg(self.key("queue"))
            .arg(&serialized)
            .query_async::<_, i64>(conn)
            .await
            .map_err(ForgeError::from)?;
        Ok(())
    }

    /// Block for up to 5 seconds waiting for the next job.
    pub async fn dequeue(&self) -> Result<Option<JobRecord>> {
        let mut conn = self.get_conn().await?;
        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.key("queue"))
            .arg(5_u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                ForgeError::with_internal(
                    ErrorCode::BrokerUnavailable,
                    "Failed to dequeue job",
                    e.to_string(),
                )
            })?;

        match result {
            Some((_key, value)) => {
                let record: JobRecord = serde_json::from_str(&value)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Track a job entering execution.
    pub async fn mark_active(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("INCR")
            .arg(self.key("active"))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        Ok(())
    }

    /// Undo [`mark_active`](Self::mark_active) for a job that is going back
    /// on the queue instead of finishing.
    pub async fn mark_inactive(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("DECR")
            .arg(self.key("active"))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        Ok(())
    }

    /// Record a terminal outcome: decrement the active counter and push the
    /// record onto the matching history list, trimming to its cap.
    pub async fn record_finished(&self, record: &JobRecord) -> Result<()> {
        let (list, cap) = match record.status {
            JobStatus::Completed => ("completed", COMPLETED_HISTORY_CAP),
            JobStatus::Failed => ("failed", FAILED_HISTORY_CAP),
            _ => {
                return Err(ForgeError::internal(format!(
                    "record_finished called with non-terminal status {}",
                    record.status
                )))
            }
        };
        let serialized = serde_json::to_string(record)?;

        let mut conn = self.get_conn().await?;
        redis::cmd("DECR")
            .arg(self.key("active"))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        redis::cmd("LPUSH")
            .arg(self.key(list))
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        redis::cmd("LTRIM")
            .arg(self.key(list))
            .arg(0)
            .arg(cap as i64 - 1)
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.get_conn().await?;
        let waiting: u64 = redis::cmd("LLEN")
            .arg(self.key("queue"))
            .query_async(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        let active: Option<i64> = redis::cmd("GET")
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        let completed: u64 = redis::cmd("LLEN")
            .arg(self.key("completed"))
            .query_async(&mut conn)
            .await
            .map_err(ForgeError::from)?;
        let failed: u64 = redis::cmd("LLEN")
            .arg(self.key("failed"))
            .query_async(&mut conn)
            .await
            .map_err(ForgeError::from)?;

        Ok(QueueStats {
            waiting,
            active: active.unwrap_or(0).max(0) as u64,
            completed,
            failed,
        })
    }

    /// Most recent terminal jobs across both history lists, merged into
    /// one newest-first sequence of at most `limit` records.
    pub async fn history(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let mut conn = self.get_conn().await?;
        let mut records = self.read_history(&mut conn, "completed", limit).await?;
        records.extend(self.read_history(&mut conn, "failed", limit).await?);
        records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn read_history(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        list: &str,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key(list))
            .arg(0)
            .arg(limit.max(1) as i64 - 1)
            .query_async(conn)
            .await
            .map_err(ForgeError::from)?;

        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str(&entry) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable history entry")
                }
            }
        }
        Ok(records)
    }

    /// Re-apply the history caps. Run periodically so lists cannot grow
    /// past their bounds even if a trim was missed.
    pub async fn trim_history(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        for (list, cap) in [
            ("completed", COMPLETED_HISTORY_CAP),
            ("failed", FAILED_HISTORY_CAP),
        ] {
            redis::cmd("LTRIM")
                .arg(self.key(list))
                .arg(0)
                .arg(cap as i64 - 1)
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(ForgeError::from)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fallback Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process executor used when the broker is unavailable.
///
/// Jobs run sequentially in submission order on a single drain task. No
/// retries, no persistence; outcomes land in a bounded ring.
pub struct FallbackExecutor {
    tx: mpsc::UnboundedSender<JobRecord>,
    history: Arc<Mutex<VecDeque<JobRecord>>>,
    waiting: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
}

impl FallbackExecutor {
    /// Create the executor and spawn its drain loop.
    pub fn start(registry: Arc<JobHandlerRegistry>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobRecord>();
        let history: Arc<Mutex<VecDeque<JobRecord>>> = Arc::new(Mutex::new(VecDeque::new()));
        let waiting = Arc::new(AtomicU64::new(0));
        let active = Arc::new(AtomicU64::new(0));

        let executor = Arc::new(Self {
            tx,
            history: history.clone(),
            waiting: waiting.clone(),
            active: active.clone(),
        });

        tokio::spawn(async move {
            while let Some(mut record) = rx.recv().await {
                waiting.fetch_sub(1, Ordering::SeqCst);
                active.fetch_add(1, Ordering::SeqCst);
                record.mark_active();

                tracing::info!(job_id = %record.id, job_type = %record.job_type, "Running fallback job");
                match registry.run(record.job_type, &record.payload).await {
                    Ok(result) => record.mark_completed(result),
                    Err(err) => {
                        tracing::error!(job_id = %record.id, error = %err, "Fallback job failed");
                        record.mark_failed(err.message);
                    }
                }

                active.fetch_sub(1, Ordering::SeqCst);
                let mut ring = history.lock();
                if ring.len() >= FALLBACK_HISTORY_CAP {
                    ring.pop_front();
                }
                ring.push_back(record);
            }
        });

        executor
    }

    /// Queue a job for sequential execution.
    pub fn submit(&self, job_type: JobType, payload: Value, priority: JobPriority) -> JobHandle {
        let id = format!("{}{}", FALLBACK_ID_PREFIX, uuid::Uuid::new_v4().simple());
        let record =
            JobRecord::new(id.clone(), job_type, payload, JobStatus::Queued).with_priority(priority);

        self.waiting.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the process; a send can only fail
        // during shutdown.
        if self.tx.send(record).is_err() {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(job_id = %id, "Fallback executor is shut down; job dropped");
        }
        JobHandle { id }
    }

    pub fn stats(&self) -> QueueStats {
        let ring = self.history.lock();
        let completed = ring
            .iter()
            .filter(|r| r.status == JobStatus::Completed)
            .count() as u64;
        let failed = ring.iter().filter(|r| r.status == JobStatus::Failed).count() as u64;
        QueueStats {
            waiting: self.waiting.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            completed,
            failed,
        }
    }

    /// Newest first, like the durable history. The ring only ever holds
    /// terminal records.
    pub fn history(&self, limit: usize) -> Vec<JobRecord> {
        let ring = self.history.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Facade
// ═══════════════════════════════════════════════════════════════════════════════

/// A point-in-time health verdict for the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub healthy: bool,
    pub durable: bool,
    pub stats: QueueStats,
    pub warnings: Vec<String>,
}

impl QueueHealth {
    pub fn evaluate(stats: QueueStats, durable: bool) -> Self {
        let mut warnings = Vec::new();
        if stats.failed > HEALTHY_FAILED_MAX {
            warnings.push(format!(
                "High failure count: {} failed jobs",
                stats.failed
            ));
        }
        if stats.waiting > HEALTHY_WAITING_MAX {
            warnings.push(format!("Queue backlog: {} waiting jobs", stats.waiting));
        }
        Self {
            healthy: warnings.is_empty(),
            durable,
            stats,
            warnings,
        }
    }
}

/// The queue facade the rest of the service uses.
pub struct JobQueue {
    broker: Option<Arc<RedisBroker>>,
    fallback: Arc<FallbackExecutor>,
    registry: Arc<JobHandlerRegistry>,
    durable: AtomicBool,
    retry: RetryPolicy,
}

impl JobQueue {
    /// Build the queue. The broker client is constructed eagerly but not
    /// probed; call [`initialize`](Self::initialize) to pick the mode.
    pub fn new(config: &BrokerConfig, registry: Arc<JobHandlerRegistry>) -> Self {
        let broker = match RedisBroker::new(config) {
            Ok(broker) => Some(Arc::new(broker)),
            Err(e) => {
                tracing::warn!(error = %e, "Broker client unavailable; fallback mode only");
                None
            }
        };
        Self {
            broker,
            fallback: FallbackExecutor::start(registry.clone()),
            registry,
            durable: AtomicBool::new(false),
            retry: RetryPolicy::default(),
        }
    }

    /// Probe the broker and settle on durable or fallback mode. Never
    /// fails; an unreachable broker just means fallback.
    pub async fn initialize(&self, connect_timeout: Duration) {
        let Some(broker) = &self.broker else {
            tracing::warn!("No broker configured; jobs run in-process");
            return;
        };

        match tokio::time::timeout(connect_timeout, broker.ping()).await {
            Ok(Ok(())) => {
                self.durable.store(true, Ordering::SeqCst);
                tracing::info!("Durable job queue connected");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Broker unreachable; jobs run in-process");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = connect_timeout.as_secs(),
                    "Broker connect timed out; jobs run in-process"
                );
            }
        }
    }

    /// Whether the durable path is currently in use.
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_durable(&self, durable: bool) {
        self.durable.store(durable, Ordering::SeqCst);
    }

    pub(crate) fn broker(&self) -> Option<&Arc<RedisBroker>> {
        self.broker.as_ref()
    }

    pub(crate) fn registry(&self) -> &Arc<JobHandlerRegistry> {
        &self.registry
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Submit a job. Unknown job types are rejected; broker failures are
    /// not — the job silently degrades to the fallback path.
    pub async fn submit(
        &self,
        job_type: JobType,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobHandle> {
        if !self.registry.contains(job_type) {
            return Err(ForgeError::unknown_job_type(
                job_type.as_str(),
                &JobType::names(),
            ));
        }

        if self.is_durable() {
            if let Some(broker) = &self.broker {
                match broker.enqueue(job_type, payload.clone(), options.priority).await {
                    Ok(record) => return Ok(JobHandle { id: record.id }),
                    Err(e) => {
                        tracing::warn!(error = %e, "Broker enqueue failed; degrading to fallback");
                        self.set_durable(false);
                    }
                }
            }
        }

        Ok(self.fallback.submit(job_type, payload, options.priority))
    }

    /// Current queue depth counters from whichever path is active. A
    /// broker error degrades and falls through to fallback stats.
    pub async fn stats(&self) -> QueueStats {
        if self.is_durable() {
            if let Some(broker) = &self.broker {
                match broker.stats().await {
                    Ok(stats) => return stats,
                    Err(e) => {
                        tracing::warn!(error = %e, "Broker stats failed; degrading to fallback");
                        self.set_durable(false);
                    }
                }
            }
        }
        self.fallback.stats()
    }

    /// Recent terminal jobs, newest first, at most `limit`. Never errors.
    pub async fn history(&self, limit: usize) -> Vec<JobRecord> {
        if self.is_durable() {
            if let Some(broker) = &self.broker {
                match broker.history(limit).await {
                    Ok(history) => return history,
                    Err(e) => {
                        tracing::warn!(error = %e, "Broker history failed; degrading to fallback");
                        self.set_durable(false);
                    }
                }
            }
        }
        self.fallback.history(limit)
    }

    /// Health verdict derived from current stats.
    pub async fn health(&self) -> QueueHealth {
        let stats = self.stats().await;
        QueueHealth::evaluate(stats, self.is_durable())
    }

    /// Re-apply history caps on the durable lists. The fallback ring is
    /// self-limiting.
    pub async fn cleanup_history(&self) -> Result<()> {
        if self.is_durable() {
            if let Some(broker) = &self.broker {
                broker.trim_history().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::JobHandler;
    use async_trait::async_trait;
    use serde_json::json;

    struct FlakyHandler;

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn run(&self, payload: &Value) -> std::result::Result<Value, super::super::job::HandlerError> {
            if payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                Err(super::super::job::HandlerError::fatal("boom"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn test_registry() -> Arc<JobHandlerRegistry> {
        let mut registry = JobHandlerRegistry::new();
        registry.register(JobType::DailyReminder, Arc::new(FlakyHandler));
        Arc::new(registry)
    }

    async fn settle(executor: &FallbackExecutor) {
        for _ in 0..100 {
            let stats = executor.stats();
            if stats.waiting == 0 && stats.active == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fallback executor did not settle");
    }

    #[tokio::test]
    async fn test_fallback_runs_jobs_in_order() {
        let executor = FallbackExecutor::start(test_registry());

        let first = executor.submit(JobType::DailyReminder, json!({"n": 1}), JobPriority::Normal);
        let second = executor.submit(JobType::DailyReminder, json!({"n": 2}), JobPriority::Normal);
        assert!(first.id.starts_with(FALLBACK_ID_PREFIX));

        settle(&executor).await;
        let history = executor.history(10);
        assert_eq!(history.len(), 2);
        // Newest first.
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
    }

    #[tokio::test]
    async fn test_fallback_records_failures() {
        let executor = FallbackExecutor::start(test_registry());
        executor.submit(JobType::DailyReminder, json!({"fail": true}), JobPriority::Normal);

        settle(&executor).await;
        let history = executor.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Failed);
        assert_eq!(history[0].error.as_deref(), Some("boom"));

        let stats = executor.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_fallback_history_ring_is_bounded() {
        let executor = FallbackExecutor::start(test_registry());
        for n in 0..FALLBACK_HISTORY_CAP + 20 {
            executor.submit(JobType::DailyReminder, json!({"n": n}), JobPriority::Normal);
        }
        settle(&executor).await;
        let stats = executor.stats();
        assert_eq!(stats.completed, FALLBACK_HISTORY_CAP as u64);
    }

    #[tokio::test]
    async fn test_queue_rejects_unknown_job_type() {
        let config = BrokerConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let queue = JobQueue::new(&config, test_registry());
        let err = queue
            .submit(JobType::WeeklySummary, json!({}), SubmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJobType);
    }

    #[tokio::test]
    async fn test_queue_submits_via_fallback_when_not_durable() {
        let config = BrokerConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let queue = JobQueue::new(&config, test_registry());
        assert!(!queue.is_durable());

        let handle = queue
            .submit(JobType::DailyReminder, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        assert!(handle.id.starts_with(FALLBACK_ID_PREFIX));

        settle(&queue.fallback).await;
        let history = queue.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_history_merges_outcomes_newest_first() {
        let executor = FallbackExecutor::start(test_registry());
        executor.submit(JobType::DailyReminder, json!({"n": 1}), JobPriority::Normal);
        executor.submit(JobType::DailyReminder, json!({"fail": true}), JobPriority::Normal);
        let third = executor.submit(JobType::DailyReminder, json!({"n": 3}), JobPriority::Normal);

        settle(&executor).await;
        // Completions and failures come back as one sequence, newest
        // first, cut to the limit.
        let history = executor.history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, third.id);
        assert_eq!(history[1].status, JobStatus::Failed);
    }

    #[test]
    fn test_health_thresholds() {
        let healthy = QueueHealth::evaluate(
            QueueStats {
                waiting: HEALTHY_WAITING_MAX,
                failed: HEALTHY_FAILED_MAX,
                ..Default::default()
            },
            true,
        );
        assert!(healthy.healthy);

        let degraded = QueueHealth::evaluate(
            QueueStats {
                waiting: HEALTHY_WAITING_MAX + 1,
                failed: HEALTHY_FAILED_MAX + 1,
                ..Default::default()
            },
            true,
        );
        assert!(!degraded.healthy);
        assert_eq!(degraded.warnings.len(), 2);
    }
}
