//! Job payloads, lifecycle states and queue policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Platform;

/// Named queues. Each runs its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "publish")]
    Publish,
    #[serde(rename = "metrics")]
    Metrics,
    #[serde(rename = "inbox-poll")]
    InboxPoll,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Publish, QueueName::Metrics, QueueName::InboxPoll];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Publish => "publish",
            QueueName::Metrics => "metrics",
            QueueName::InboxPoll => "inbox-poll",
        }
    }

    /// Section name under `[queues]` in the config file
    pub fn config_key(&self) -> &'static str {
        match self {
            QueueName::Publish => "publish",
            QueueName::Metrics => "metrics",
            QueueName::InboxPoll => "inbox_poll",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(QueueName::Publish),
            "metrics" => Ok(QueueName::Metrics),
            "inbox-poll" | "inbox_poll" | "inbox" => Ok(QueueName::InboxPoll),
            _ => Err(format!(
                "Invalid queue: '{}'. Valid options: publish, metrics, inbox-poll",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishJob {
    pub post_item_id: String,
    pub brand_id: String,
}

/// Exactly one of `post_item_id` / `social_account_id` is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_account_id: Option<String>,
    pub brand_id: String,
}

impl MetricsJob {
    pub fn for_item(post_item_id: impl Into<String>, brand_id: impl Into<String>) -> Self {
        Self {
            post_item_id: Some(post_item_id.into()),
            social_account_id: None,
            brand_id: brand_id.into(),
        }
    }

    pub fn for_account(social_account_id: impl Into<String>, brand_id: impl Into<String>) -> Self {
        Self {
            post_item_id: None,
            social_account_id: Some(social_account_id.into()),
            brand_id: brand_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPollJob {
    pub social_account_id: String,
    pub brand_id: String,
    pub platform: Platform,
}

/// Typed job payload. Carries ids only; handlers re-fetch the entities.
///
/// Serialized without a tag, so the shape alone does not identify the
/// variant: decode with the queue the job belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobPayload {
    Publish(PublishJob),
    InboxPoll(InboxPollJob),
    Metrics(MetricsJob),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Publish(_) => QueueName::Publish,
            JobPayload::Metrics(_) => QueueName::Metrics,
            JobPayload::InboxPoll(_) => QueueName::InboxPoll,
        }
    }

    pub fn brand_id(&self) -> &str {
        match self {
            JobPayload::Publish(p) => &p.brand_id,
            JobPayload::Metrics(p) => &p.brand_id,
            JobPayload::InboxPoll(p) => &p.brand_id,
        }
    }

    /// Decode a stored payload for the queue it was enqueued on
    pub fn decode(queue: QueueName, raw: &str) -> Result<Self, serde_json::Error> {
        Self::from_value(queue, serde_json::from_str(raw)?)
    }

    pub fn from_value(queue: QueueName, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match queue {
            QueueName::Publish => JobPayload::Publish(serde_json::from_value(value)?),
            QueueName::Metrics => JobPayload::Metrics(serde_json::from_value(value)?),
            QueueName::InboxPoll => JobPayload::InboxPoll(serde_json::from_value(value)?),
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            JobPayload::Publish(p) => serde_json::to_string(p),
            JobPayload::Metrics(p) => serde_json::to_string(p),
            JobPayload::InboxPoll(p) => serde_json::to_string(p),
        }
    }
}

impl From<PublishJob> for JobPayload {
    fn from(job: PublishJob) -> Self {
        JobPayload::Publish(job)
    }
}

impl From<MetricsJob> for JobPayload {
    fn from(job: MetricsJob) -> Self {
        JobPayload::Metrics(job)
    }
}

impl From<InboxPollJob> for JobPayload {
    fn from(job: InboxPollJob) -> Self {
        JobPayload::InboxPoll(job)
    }
}

/// Job lifecycle inside the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued (or backing off), waiting for `run_at`
    Waiting,
    /// Claimed by a worker until `locked_until`
    Active,
    Completed,
    /// Attempts exhausted or permanent failure
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: '{}'", s)),
        }
    }
}

/// A unit of work as seen by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawJob")]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub state: JobState,
    /// Attempts started so far, including the current one
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Epoch milliseconds
    pub run_at: i64,
    pub locked_until: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Wire form of [`Job`] with the payload left untyped until `queue` is known
#[derive(Deserialize)]
struct RawJob {
    id: String,
    queue: QueueName,
    payload: serde_json::Value,
    state: JobState,
    attempts_made: u32,
    max_attempts: u32,
    run_at: i64,
    locked_until: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    finished_at: Option<i64>,
}

impl TryFrom<RawJob> for Job {
    type Error = serde_json::Error;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: JobPayload::from_value(raw.queue, raw.payload)?,
            id: raw.id,
            queue: raw.queue,
            state: raw.state,
            attempts_made: raw.attempts_made,
            max_attempts: raw.max_attempts,
            run_at: raw.run_at,
            locked_until: raw.locked_until,
            last_error: raw.last_error,
            created_at: raw.created_at,
            finished_at: raw.finished_at,
        })
    }
}

impl Job {
    pub fn new(payload: JobPayload, max_attempts: u32, run_at: i64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            queue: payload.queue(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts,
            run_at,
            locked_until: None,
            last_error: None,
            created_at: now,
            finished_at: None,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt (1-indexed): `base * 2^(attempt-1)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow((attempt - 1).min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Check if more attempts are allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Bounds on how many finished jobs the queue keeps around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub completed_max_age: Duration,
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            completed_max_age: Duration::from_secs(24 * 3600),
            keep_failed: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
}

/// What the engine did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Redelivery scheduled at the given epoch milliseconds
    Retrying { run_at: i64 },
    /// Job abandoned
    Failed,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
