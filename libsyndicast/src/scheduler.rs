//! Periodic enqueueing of metrics and inbox-poll jobs
//!
//! Each round enqueues one account-mode metrics job per active account and
//! one inbox-poll job per active account whose adapter can read an inbox.
//! Jobs within a round are spread over a random delay of up to
//! `jitter_secs`.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::jobs::{InboxPollJob, JobPayload, MetricsJob, Queues};
use crate::platforms::AdapterRegistry;

pub struct Scheduler {
    db: Database,
    queues: Queues,
    adapters: AdapterRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Database, queues: Queues, adapters: AdapterRegistry, config: SchedulerConfig) -> Self {
        Self {
            db,
            queues,
            adapters,
            config,
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.jitter_secs.saturating_mul(1000);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    async fn submit(&self, payload: JobPayload) -> Result<()> {
        let queue = self.queues.get(payload.queue());
        let delay = self.jitter();
        let job = if delay.is_zero() {
            queue.enqueue(payload).await?
        } else {
            queue.enqueue_delayed(payload, delay).await?
        };
        tracing::debug!(job_id = %job.id, queue = %job.queue, "Scheduled job");
        Ok(())
    }

    /// Enqueue an account-mode metrics job for every active account
    pub async fn enqueue_metrics(&self) -> Result<usize> {
        let accounts = self.db.list_active_accounts(None).await?;
        for account in &accounts {
            self.submit(MetricsJob::for_account(&account.id, &account.brand_id).into())
                .await?;
        }
        tracing::info!(jobs = accounts.len(), "Metrics round scheduled");
        Ok(accounts.len())
    }

    /// Enqueue an inbox poll for every active account with inbox support
    pub async fn enqueue_inbox_polls(&self) -> Result<usize> {
        let accounts = self.db.list_active_accounts(None).await?;
        let mut scheduled = 0;
        for account in accounts
            .iter()
            .filter(|a| self.adapters.get(a.platform).supports_inbox())
        {
            self.submit(
                InboxPollJob {
                    social_account_id: account.id.clone(),
                    brand_id: account.brand_id.clone(),
                    platform: account.platform,
                }
                .into(),
            )
            .await?;
            scheduled += 1;
        }
        tracing::info!(jobs = scheduled, "Inbox round scheduled");
        Ok(scheduled)
    }

    /// Run both schedules until `shutdown` flips to true.
    ///
    /// The first round of each fires immediately. A failed round is logged
    /// and retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut metrics_tick =
            tokio::time::interval(Duration::from_secs(self.config.metrics_interval_secs.max(1)));
        let mut inbox_tick =
            tokio::time::interval(Duration::from_secs(self.config.inbox_interval_secs.max(1)));
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        inbox_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            metrics_every = %humantime::format_duration(metrics_tick.period()),
            inbox_every = %humantime::format_duration(inbox_tick.period()),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = metrics_tick.tick() => {
                    if let Err(e) = self.enqueue_metrics().await {
                        tracing::error!(error = %e, "Failed to schedule metrics round");
                    }
                }
                _ = inbox_tick.tick() => {
                    if let Err(e) = self.enqueue_inbox_polls().await {
                        tracing::error!(error = %e, "Failed to schedule inbox round");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueuesConfig;
    use crate::jobs::JobState;
    use crate::types::{Platform, SocialAccount};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database, Queues) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let queues = Queues::in_memory(&QueuesConfig::default());
        (temp_dir, db, queues)
    }

    fn no_jitter() -> SchedulerConfig {
        SchedulerConfig {
            jitter_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_inbox_round_skips_platforms_without_inbox() {
        let (_dir, db, queues) = setup().await;
        for platform in [Platform::Instagram, Platform::TikTok] {
            db.create_account(&SocialAccount::new("brand-1", platform, "ext", "blob".to_string()))
                .await
                .unwrap();
        }
        let inactive = SocialAccount::new("brand-1", Platform::X, "ext-x", "blob".to_string());
        db.create_account(&inactive).await.unwrap();
        db.deactivate_account(&inactive.id).await.unwrap();

        let scheduler = Scheduler::new(
            db,
            queues.clone(),
            AdapterRegistry::from_config(&Default::default()).unwrap(),
            no_jitter(),
        );

        assert_eq!(scheduler.enqueue_inbox_polls().await.unwrap(), 1);
        assert_eq!(scheduler.enqueue_metrics().await.unwrap(), 2);

        let polls = queues.inbox_poll.list(Some(JobState::Waiting), 10).await.unwrap();
        match &polls[0].payload {
            JobPayload::InboxPoll(job) => assert_eq!(job.platform, Platform::Instagram),
            other => panic!("Expected inbox poll payload, got {:?}", other),
        }
        assert_eq!(queues.metrics.stats().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_jitter_delays_jobs() {
        let (_dir, db, queues) = setup().await;
        db.create_account(&SocialAccount::new("brand-1", Platform::Facebook, "ext", "blob".to_string()))
            .await
            .unwrap();

        let scheduler = Scheduler::new(
            db,
            queues.clone(),
            AdapterRegistry::stubs(),
            SchedulerConfig {
                jitter_secs: 3600,
                ..Default::default()
            },
        );
        scheduler.enqueue_metrics().await.unwrap();

        let jobs = queues.metrics.list(None, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].run_at >= jobs[0].created_at);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, db, queues) = setup().await;
        let scheduler = Scheduler::new(db, queues, AdapterRegistry::stubs(), no_jitter());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
