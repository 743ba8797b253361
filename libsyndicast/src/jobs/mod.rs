//! Named job queues and the workers that drain them
//!
//! A queue engine ([`JobQueue`]) owns job state: waiting, active under a
//! lease, completed or failed. Failed attempts are retried with exponential
//! backoff until the attempt budget runs out. [`WorkerPool`] claims jobs
//! with bounded concurrency and hands them to a [`JobHandler`].

pub mod queue;
pub mod sqlite;
pub mod types;
pub mod worker;

use std::sync::Arc;

pub use queue::{InMemoryJobQueue, JobQueue};
pub use sqlite::SqliteJobQueue;
pub use types::{
    FailOutcome, InboxPollJob, Job, JobPayload, JobState, MetricsJob, PublishJob, QueueName,
    QueueOptions, QueueStats, RetentionPolicy, RetryPolicy,
};
pub use worker::{JobHandler, WorkerOptions, WorkerPool, WorkerStats};

use crate::config::QueuesConfig;
use crate::db::Database;
use crate::error::Result;

/// One durable queue per [`QueueName`], sharing a database.
#[derive(Clone)]
pub struct Queues {
    pub publish: Arc<dyn JobQueue>,
    pub metrics: Arc<dyn JobQueue>,
    pub inbox_poll: Arc<dyn JobQueue>,
}

impl Queues {
    pub fn sqlite(db: &Database, config: &QueuesConfig) -> Self {
        let make = |name: QueueName| -> Arc<dyn JobQueue> {
            Arc::new(SqliteJobQueue::new(
                db,
                name,
                config.for_queue(name).to_options(),
            ))
        };
        Self {
            publish: make(QueueName::Publish),
            metrics: make(QueueName::Metrics),
            inbox_poll: make(QueueName::InboxPoll),
        }
    }

    pub fn in_memory(config: &QueuesConfig) -> Self {
        let make = |name: QueueName| -> Arc<dyn JobQueue> {
            Arc::new(InMemoryJobQueue::new(name, config.for_queue(name).to_options()))
        };
        Self {
            publish: make(QueueName::Publish),
            metrics: make(QueueName::Metrics),
            inbox_poll: make(QueueName::InboxPoll),
        }
    }

    pub fn get(&self, name: QueueName) -> &Arc<dyn JobQueue> {
        match name {
            QueueName::Publish => &self.publish,
            QueueName::Metrics => &self.metrics,
            QueueName::InboxPoll => &self.inbox_poll,
        }
    }

    /// Route a payload to its queue
    pub async fn submit(&self, payload: JobPayload) -> Result<Job> {
        self.get(payload.queue()).enqueue(payload).await
    }
}
