//! Durable worker loop.
//!
//! Pulls jobs off the broker with bounded concurrency, runs them through
//! the handler registry, and records outcomes. A broker error flips the
//! queue into fallback mode; the loop then probes the broker until it
//! comes back and flips durable mode on again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use crate::config::BrokerConfig;

use super::job::{JobRecord, JobStatus};
use super::queue::{JobQueue, RedisBroker};
use super::registry::JobHandlerRegistry;

/// Handle for stopping a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
}

impl WorkerHandle {
    /// Signal the worker to stop after in-flight jobs finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The durable job worker.
pub struct JobWorker {
    queue: Arc<JobQueue>,
    concurrency: usize,
    reconnect_interval: Duration,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>, config: &BrokerConfig) -> Self {
        Self {
            queue,
            concurrency: config.worker_concurrency.max(1),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs.max(1)),
        }
    }

    /// Start the worker, returning a handle for shutdown.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let queue = self.queue;
        let concurrency = self.concurrency;
        let reconnect_interval = self.reconnect_interval;

        tokio::spawn(async move {
            let Some(broker) = queue.broker().cloned() else {
                tracing::warn!("No broker; durable worker not started");
                return;
            };
            let semaphore = Arc::new(Semaphore::new(concurrency));
            tracing::info!(concurrency, "Durable job worker started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if !queue.is_durable() {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                        _ = tokio::time::sleep(reconnect_interval) => {}
                    }
                    match broker.ping().await {
                        Ok(()) => {
                            queue.set_durable(true);
                            tracing::info!("Broker reachable again; durable mode restored");
                        }
                        Err(_) => continue,
                    }
                }

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    dequeued = broker.dequeue() => match dequeued {
                        Ok(Some(record)) => {
                            // Acquire outside the task so dequeue pace is
                            // bounded by execution capacity.
                            let permit = match semaphore.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let queue = queue.clone();
                            let broker = broker.clone();
                            tokio::spawn(async move {
                                execute(queue.registry(), &broker, &queue, record).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {} // BLPOP timeout, poll again
                        Err(e) => {
                            tracing::warn!(error = %e, "Broker dequeue failed; degrading to fallback");
                            queue.set_durable(false);
                        }
                    }
                }
            }

            tracing::info!("Durable job worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
        }
    }
}

/// Run one job and record its outcome. Handler failures never propagate;
/// they either schedule a retry or land in failed history.
async fn execute(
    registry: &Arc<JobHandlerRegistry>,
    broker: &Arc<RedisBroker>,
    queue: &Arc<JobQueue>,
    mut record: JobRecord,
) {
    record.mark_active();
    if let Err(e) = broker.mark_active().await {
        tracing::warn!(job_id = %record.id, error = %e, "Failed to mark job active");
    }
    tracing::info!(
        job_id = %record.id,
        job_type = %record.job_type,
        attempt = record.attempts,
        "Running job"
    );

    match registry.run(record.job_type, &record.payload).await {
        Ok(result) => {
            record.mark_completed(result);
            tracing::info!(job_id = %record.id, job_type = %record.job_type, "Job completed");
        }
        Err(err) => {
            let policy = queue.retry_policy();
            if policy.should_retry(record.attempts, &err) {
                let delay = policy.delay_for_retry(record.attempts - 1);
                tracing::warn!(
                    job_id = %record.id,
                    attempt = record.attempts,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "Job failed; retry scheduled"
                );
                if let Err(e) = broker.mark_inactive().await {
                    tracing::warn!(error = %e, "Failed to release active slot");
                }
                schedule_retry(broker.clone(), record, delay);
                return;
            }
            tracing::error!(
                job_id = %record.id,
                job_type = %record.job_type,
                attempts = record.attempts,
                error = %err,
                "Job failed permanently"
            );
            record.mark_failed(err.message);
        }
    }

    debug_assert!(record.status.is_terminal());
    if let Err(e) = broker.record_finished(&record).await {
        tracing::warn!(job_id = %record.id, error = %e, "Failed to record job outcome");
    }
}

/// Put the job back on the queue after a backoff delay. The record keeps
/// its id and attempt count so the retry budget carries across attempts.
fn schedule_retry(broker: Arc<RedisBroker>, mut record: JobRecord, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        record.status = JobStatus::Queued;
        if let Err(e) = broker.requeue(&record).await {
            tracing::error!(job_id = %record.id, error = %e, "Retry requeue failed; job lost");
        }
    });
}
