//! Queue engine abstraction and the in-process implementation

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{FailOutcome, Job, JobPayload, JobState, QueueName, QueueOptions, QueueStats};
use crate::error::{QueueError, Result};

/// Error recorded on jobs whose lease expired on their final attempt
pub const LEASE_EXPIRED: &str = "lease expired before the job finished";

/// A durable, named job queue.
///
/// Engines guarantee that a claimed job is delivered to exactly one worker
/// until its lease expires. Delivery is at-least-once: a worker that dies
/// mid-job leaves the job to be reclaimed after `locked_until`.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> QueueName;

    fn options(&self) -> &QueueOptions;

    /// Enqueue a job runnable at the given epoch milliseconds
    async fn enqueue_at(&self, payload: JobPayload, run_at: i64) -> Result<Job>;

    /// Claim the next runnable job, holding it for `lease`
    async fn claim(&self, lease: Duration) -> Result<Option<Job>>;

    /// Mark a claimed job completed.
    ///
    /// Only the attempt that still holds the lease settles the job: once the
    /// job has been reclaimed, the earlier attempt gets [`QueueError::LeaseLost`].
    async fn complete(&self, job: &Job) -> Result<()>;

    /// Record a failed attempt of a claimed job
    ///
    /// Retryable failures with attempts left go back to waiting behind the
    /// retry policy's backoff. Everything else fails the job.
    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<FailOutcome>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Most recent jobs first, optionally filtered by state
    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Move every failed job back to waiting with a fresh attempt budget
    async fn retry_failed(&self) -> Result<usize>;

    async fn enqueue(&self, payload: JobPayload) -> Result<Job> {
        self.enqueue_at(payload, now_ms()).await
    }

    async fn enqueue_delayed(&self, payload: JobPayload, delay: Duration) -> Result<Job> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.enqueue_at(payload, now_ms().saturating_add(delay_ms))
            .await
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Reject payloads routed to the wrong queue
pub(crate) fn ensure_queue(expected: QueueName, payload: &JobPayload) -> Result<()> {
    let actual = payload.queue();
    if actual != expected {
        return Err(QueueError::WrongQueue {
            expected: expected.as_str(),
            actual: actual.as_str(),
        }
        .into());
    }
    Ok(())
}

pub(crate) fn invalid_state(job: &Job, expected: &'static str) -> QueueError {
    QueueError::InvalidState {
        job_id: job.id.clone(),
        state: job.state.as_str().to_string(),
        expected,
    }
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, (u64, Job)>,
    next_seq: u64,
}

/// The stored job, if `claimed` still holds its lease
fn leased<'a>(jobs: &'a mut HashMap<String, (u64, Job)>, claimed: &Job) -> Result<&'a mut Job> {
    let (_, job) = jobs
        .get_mut(&claimed.id)
        .ok_or_else(|| QueueError::JobNotFound(claimed.id.clone()))?;
    if job.state != JobState::Active {
        return Err(invalid_state(job, "active").into());
    }
    if job.attempts_made != claimed.attempts_made {
        return Err(lease_lost(claimed).into());
    }
    Ok(job)
}

pub(crate) fn lease_lost(claimed: &Job) -> QueueError {
    QueueError::LeaseLost {
        job_id: claimed.id.clone(),
        attempt: claimed.attempts_made,
    }
}

/// Queue engine kept entirely in memory.
///
/// Used by tests and single-process deployments that accept losing queued
/// work on restart.
pub struct InMemoryJobQueue {
    name: QueueName,
    options: QueueOptions,
    state: Mutex<MemoryState>,
}

impl InMemoryJobQueue {
    pub fn new(name: QueueName, options: QueueOptions) -> Self {
        Self {
            name,
            options,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(&self, state: &mut MemoryState, now: i64) {
        let retention = &self.options.retention;
        let max_age_ms = duration_ms(retention.completed_max_age);
        state.jobs.retain(|_, (_, job)| {
            !(job.state == JobState::Completed
                && job.finished_at.unwrap_or(now) < now.saturating_sub(max_age_ms))
        });

        for (job_state, keep) in [
            (JobState::Completed, retention.keep_completed),
            (JobState::Failed, retention.keep_failed),
        ] {
            let mut finished: Vec<(i64, u64, String)> = state
                .jobs
                .values()
                .filter(|(_, job)| job.state == job_state)
                .map(|(seq, job)| (job.finished_at.unwrap_or(0), *seq, job.id.clone()))
                .collect();
            if finished.len() <= keep {
                continue;
            }
            finished.sort_unstable_by(|a, b| b.cmp(a));
            for (_, _, id) in finished.into_iter().skip(keep) {
                state.jobs.remove(&id);
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn enqueue_at(&self, payload: JobPayload, run_at: i64) -> Result<Job> {
        ensure_queue(self.name, &payload)?;
        let job = Job::new(payload, self.options.retry.max_attempts, run_at);

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id.clone(), (seq, job.clone()));
        Ok(job)
    }

    async fn claim(&self, lease: Duration) -> Result<Option<Job>> {
        let now = now_ms();
        let mut state = self.lock();

        let mut reaped = false;
        for (_, job) in state.jobs.values_mut() {
            if job.state == JobState::Active
                && job.locked_until.is_some_and(|until| until <= now)
                && job.attempts_made >= job.max_attempts
            {
                job.state = JobState::Failed;
                job.locked_until = None;
                job.last_error = Some(LEASE_EXPIRED.to_string());
                job.finished_at = Some(now);
                reaped = true;
            }
        }
        if reaped {
            self.prune(&mut state, now);
        }

        let next = state
            .jobs
            .values()
            .filter(|(_, job)| match job.state {
                JobState::Waiting => job.run_at <= now,
                JobState::Active => job.locked_until.is_some_and(|until| until <= now),
                _ => false,
            })
            .min_by_key(|(seq, job)| (job.run_at, *seq))
            .map(|(_, job)| job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some((_, job)) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.locked_until = Some(now.saturating_add(duration_ms(lease)));
        Ok(Some(job.clone()))
    }

    async fn complete(&self, claimed: &Job) -> Result<()> {
        let now = now_ms();
        let mut state = self.lock();
        let job = leased(&mut state.jobs, claimed)?;
        job.state = JobState::Completed;
        job.locked_until = None;
        job.finished_at = Some(now);
        self.prune(&mut state, now);
        Ok(())
    }

    async fn fail(&self, claimed: &Job, error: &str, retryable: bool) -> Result<FailOutcome> {
        let now = now_ms();
        let mut state = self.lock();
        let job = leased(&mut state.jobs, claimed)?;

        job.locked_until = None;
        job.last_error = Some(error.to_string());

        let outcome = if retryable && job.attempts_made < job.max_attempts {
            let delay = self.options.retry.delay_for_attempt(job.attempts_made);
            job.state = JobState::Waiting;
            job.run_at = now.saturating_add(duration_ms(delay));
            FailOutcome::Retrying { run_at: job.run_at }
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            FailOutcome::Failed
        };

        if outcome == FailOutcome::Failed {
            self.prune(&mut state, now);
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(job_id).map(|(_, job)| job.clone()))
    }

    async fn list(&self, state_filter: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs: Vec<&(u64, Job)> = state
            .jobs
            .values()
            .filter(|(_, job)| state_filter.map_or(true, |s| job.state == s))
            .collect();
        jobs.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Ok(jobs
            .into_iter()
            .take(limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = now_ms();
        let state = self.lock();
        let mut stats = QueueStats::default();
        for (_, job) in state.jobs.values() {
            match job.state {
                JobState::Waiting if job.run_at > now => stats.delayed += 1,
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn retry_failed(&self) -> Result<usize> {
        let now = now_ms();
        let mut state = self.lock();
        let mut count = 0;
        for (_, job) in state.jobs.values_mut() {
            if job.state == JobState::Failed {
                job.state = JobState::Waiting;
                job.attempts_made = 0;
                job.run_at = now;
                job.finished_at = None;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{MetricsJob, PublishJob, RetentionPolicy, RetryPolicy};
    use crate::error::SyndicastError;

    fn publish_payload(item: &str) -> JobPayload {
        PublishJob {
            post_item_id: item.to_string(),
            brand_id: "brand-1".to_string(),
        }
        .into()
    }

    fn queue_with(retry: RetryPolicy) -> InMemoryJobQueue {
        InMemoryJobQueue::new(
            QueueName::Publish,
            QueueOptions {
                retry,
                retention: RetentionPolicy::default(),
            },
        )
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_claim_is_fifo() {
        let queue = queue_with(RetryPolicy::default());
        let first = queue.enqueue(publish_payload("a")).await.unwrap();
        let second = queue.enqueue(publish_payload("b")).await.unwrap();

        let claimed = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);

        let claimed = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(queue.claim(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_queue_rejected() {
        let queue = queue_with(RetryPolicy::default());
        let result = queue
            .enqueue(MetricsJob::for_item("item-1", "brand-1").into())
            .await;
        assert!(matches!(
            result,
            Err(crate::error::SyndicastError::Queue(QueueError::WrongQueue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable() {
        let queue = queue_with(RetryPolicy::default());
        queue
            .enqueue_delayed(publish_payload("a"), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(queue.claim(LEASE).await.unwrap().is_none());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let queue = queue_with(RetryPolicy::exponential(
            3,
            Duration::from_secs(5),
            Duration::from_secs(60),
        ));
        queue.enqueue(publish_payload("a")).await.unwrap();
        let job = queue.claim(LEASE).await.unwrap().unwrap();

        let before = now_ms();
        let outcome = queue.fail(&job, "rate limited", true).await.unwrap();
        match outcome {
            FailOutcome::Retrying { run_at } => assert!(run_at >= before + 5_000),
            FailOutcome::Failed => panic!("Expected a retry"),
        }

        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.last_error.as_deref(), Some("rate limited"));
        assert!(queue.claim(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_fails_job() {
        let queue = queue_with(RetryPolicy::exponential(2, Duration::ZERO, Duration::ZERO));
        queue.enqueue(publish_payload("a")).await.unwrap();

        let job = queue.claim(LEASE).await.unwrap().unwrap();
        let outcome = queue.fail(&job, "boom", true).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));

        let retried = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(retried.attempts_made, 2);
        let outcome = queue.fail(&retried, "boom", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry() {
        let queue = queue_with(RetryPolicy::default());
        queue.enqueue(publish_payload("a")).await.unwrap();
        let job = queue.claim(LEASE).await.unwrap().unwrap();

        let outcome = queue.fail(&job, "not found", false).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_requires_active() {
        let queue = queue_with(RetryPolicy::default());
        let job = queue.enqueue(publish_payload("a")).await.unwrap();
        assert!(queue.complete(&job).await.is_err());

        let mut missing = job.clone();
        missing.id = "missing".to_string();
        assert!(matches!(
            queue.complete(&missing).await,
            Err(SyndicastError::Queue(QueueError::JobNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_reclaimed_job_ignores_stale_attempt() {
        let queue = queue_with(RetryPolicy::default());
        queue.enqueue(publish_payload("a")).await.unwrap();
        let stale = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        let current = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(current.id, stale.id);

        assert!(matches!(
            queue.complete(&stale).await,
            Err(SyndicastError::Queue(QueueError::LeaseLost { attempt: 1, .. }))
        ));
        assert!(matches!(
            queue.fail(&stale, "timeout", true).await,
            Err(SyndicastError::Queue(QueueError::LeaseLost { .. }))
        ));
        let stored = queue.get(&current.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert_eq!(stored.last_error, None);

        queue.complete(&current).await.unwrap();
        let stored = queue.get(&current.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let queue = queue_with(RetryPolicy::default());
        let job = queue.enqueue(publish_payload("a")).await.unwrap();
        queue.claim(Duration::ZERO).await.unwrap().unwrap();

        let reclaimed = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_budget() {
        let queue = queue_with(RetryPolicy::default());
        queue.enqueue(publish_payload("a")).await.unwrap();
        let job = queue.claim(LEASE).await.unwrap().unwrap();
        queue.fail(&job, "fatal", false).await.unwrap();

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts_made, 0);
        assert!(queue.claim(LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest_completed() {
        let queue = InMemoryJobQueue::new(
            QueueName::Publish,
            QueueOptions {
                retry: RetryPolicy::default(),
                retention: RetentionPolicy {
                    keep_completed: 2,
                    completed_max_age: Duration::from_secs(3600),
                    keep_failed: 10,
                },
            },
        );

        let mut ids = Vec::new();
        for i in 0..4 {
            queue.enqueue(publish_payload(&format!("item-{}", i))).await.unwrap();
            let job = queue.claim(LEASE).await.unwrap().unwrap();
            queue.complete(&job).await.unwrap();
            ids.push(job.id);
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert!(queue.get(&ids[3]).await.unwrap().is_some());
        assert!(queue.get(&ids[0]).await.unwrap().is_none());
    }
}
