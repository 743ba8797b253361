//! Worker pool draining a single queue

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};

use super::queue::JobQueue;
use super::types::{FailOutcome, Job};
use crate::config::QueueConfig;
use crate::error::{QueueError, Result, SyndicastError};

/// Processes one job. Errors classified as permanent skip the retry budget.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
}

impl WorkerOptions {
    /// Lease held on claimed jobs. Outlives the timeout so a slow job is
    /// settled by this worker before anyone else can reclaim it.
    pub fn lease(&self) -> Duration {
        self.job_timeout + Duration::from_secs(30)
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            job_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&QueueConfig> for WorkerOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            job_timeout: config.job_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Snapshot of what a pool has done since it started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Claims jobs from a queue and runs them with bounded concurrency.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            queue,
            handler,
            options: WorkerOptions {
                concurrency,
                ..options
            },
            permits: Arc::new(Semaphore::new(concurrency)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }

    /// Run until `shutdown` flips to true, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let queue_name = self.queue.name();
        tracing::info!(
            queue = %queue_name,
            concurrency = self.options.concurrency,
            "Worker pool started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.claim(self.options.lease()).await {
                Ok(Some(job)) => {
                    let task = self.task();
                    tokio::spawn(async move {
                        task.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(queue = %queue_name, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!(queue = %queue_name, "Worker pool stopping, draining in-flight jobs");
        self.wait_idle().await;
        tracing::info!(queue = %queue_name, stats = ?self.stats(), "Worker pool stopped");
        Ok(())
    }

    /// Process jobs until nothing is runnable and nothing is in flight.
    ///
    /// Delayed jobs whose `run_at` is still in the future are left queued.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let idle_before_claim = self.permits.available_permits() == self.options.concurrency;

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            match self.queue.claim(self.options.lease()).await? {
                Some(job) => {
                    let task = self.task();
                    tokio::spawn(async move {
                        task.process(job).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    if idle_before_claim {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        self.wait_idle().await;
        Ok(())
    }

    async fn wait_idle(&self) {
        let all = u32::try_from(self.options.concurrency).unwrap_or(u32::MAX);
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    fn task(&self) -> WorkerTask {
        WorkerTask {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            job_timeout: self.options.job_timeout,
            counters: self.counters.clone(),
        }
    }
}

struct WorkerTask {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    job_timeout: Duration,
    counters: Arc<Counters>,
}

impl WorkerTask {
    async fn process(self, job: Job) {
        let queue_name = self.queue.name();
        tracing::debug!(
            job_id = %job.id,
            queue = %queue_name,
            attempt = job.attempts_made,
            "Processing job"
        );

        let (error, retryable) =
            match tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await {
                Ok(Ok(())) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    match self.queue.complete(&job).await {
                        Ok(()) => {
                            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(job_id = %job.id, queue = %queue_name, "Job completed");
                        }
                        Err(e) => {
                            tracing::warn!(
                                job_id = %job.id,
                                queue = %queue_name,
                                error = %e,
                                "Job succeeded but could not be marked completed"
                            );
                        }
                    }
                    return;
                }
                Ok(Err(e)) => (e.to_string(), !e.is_permanent()),
                Err(_) => (
                    format!(
                        "job timed out after {}",
                        humantime::format_duration(self.job_timeout)
                    ),
                    true,
                ),
            };

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        match self.queue.fail(&job, &error, retryable).await {
            Ok(FailOutcome::Retrying { run_at }) => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job_id = %job.id,
                    queue = %queue_name,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    retry_at = run_at,
                    error = %error,
                    "Job failed, retry scheduled"
                );
            }
            Ok(FailOutcome::Failed) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    job_id = %job.id,
                    queue = %queue_name,
                    attempt = job.attempts_made,
                    permanent = !retryable,
                    error = %error,
                    "Job failed"
                );
            }
            Err(SyndicastError::Queue(QueueError::LeaseLost { .. })) => {
                tracing::warn!(
                    job_id = %job.id,
                    queue = %queue_name,
                    attempt = job.attempts_made,
                    error = %error,
                    "Job was reclaimed by another worker, dropping this attempt's failure"
                );
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    queue = %queue_name,
                    error = %e,
                    "Could not record job failure"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PlatformError, SyndicastError};
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::types::{
        JobPayload, JobState, PublishJob, QueueName, QueueOptions, RetentionPolicy, RetryPolicy,
    };
    use crate::types::Platform;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedHandler {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_first: usize,
        permanent: bool,
        delay: Duration,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &Job) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            self.seen.lock().unwrap().push(job.id.clone());

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if call < self.fail_first {
                if self.permanent {
                    return Err(SyndicastError::not_found("post item", "gone"));
                }
                return Err(PlatformError::Network {
                    platform: Platform::X,
                    message: "connection reset".to_string(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn queue(attempts: u32) -> Arc<InMemoryJobQueue> {
        Arc::new(InMemoryJobQueue::new(
            QueueName::Publish,
            QueueOptions {
                retry: RetryPolicy::exponential(attempts, Duration::ZERO, Duration::ZERO),
                retention: RetentionPolicy::default(),
            },
        ))
    }

    fn payload(i: usize) -> JobPayload {
        PublishJob {
            post_item_id: format!("item-{}", i),
            brand_id: "brand-1".to_string(),
        }
        .into()
    }

    fn options(concurrency: usize) -> WorkerOptions {
        WorkerOptions {
            concurrency,
            job_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_drain_processes_every_job() {
        let queue = queue(3);
        for i in 0..8 {
            queue.enqueue(payload(i)).await.unwrap();
        }
        let handler = Arc::new(ScriptedHandler::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), options(3));

        pool.drain().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
        let stats = pool.stats();
        assert_eq!(stats.processed, 8);
        assert_eq!(stats.succeeded, 8);
        assert_eq!(queue.stats().await.unwrap().completed, 8);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = queue(3);
        for i in 0..10 {
            queue.enqueue(payload(i)).await.unwrap();
        }
        let handler = Arc::new(ScriptedHandler {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let pool = WorkerPool::new(queue.clone(), handler.clone(), options(2));

        pool.drain().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
        assert!(handler.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let queue = queue(3);
        let job = queue.enqueue(payload(0)).await.unwrap();
        let handler = Arc::new(ScriptedHandler {
            fail_first: 2,
            ..Default::default()
        });
        let pool = WorkerPool::new(queue.clone(), handler.clone(), options(1));

        pool.drain().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let stats = pool.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.succeeded, 1);
        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let queue = queue(3);
        let job = queue.enqueue(payload(0)).await.unwrap();
        let handler = Arc::new(ScriptedHandler {
            fail_first: 1,
            permanent: true,
            ..Default::default()
        });
        let pool = WorkerPool::new(queue.clone(), handler.clone(), options(1));

        pool.drain().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().failed, 1);
        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.last_error.unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable_failure() {
        let queue = queue(1);
        let job = queue.enqueue(payload(0)).await.unwrap();
        let handler = Arc::new(ScriptedHandler {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let pool = WorkerPool::new(
            queue.clone(),
            handler,
            WorkerOptions {
                job_timeout: Duration::from_millis(20),
                ..options(1)
            },
        );

        pool.drain().await.unwrap();

        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = queue(3);
        for i in 0..3 {
            queue.enqueue(payload(i)).await.unwrap();
        }
        let handler = Arc::new(ScriptedHandler::default());
        let pool = Arc::new(WorkerPool::new(queue.clone(), handler.clone(), options(2)));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(rx).await })
        };

        for _ in 0..100 {
            if pool.stats().processed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        assert_eq!(pool.stats().succeeded, 3);
    }
}
