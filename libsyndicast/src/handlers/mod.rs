//! Business handlers run by the worker pools
//!
//! Handlers hold no retry logic: they persist what happened on the domain
//! entities, notify, and return the error so the queue engine can decide
//! whether to redeliver.

pub mod inbox;
pub mod metrics;
pub mod publish;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::db::Database;
use crate::error::{Result, VaultError};
use crate::jobs::{Job, JobHandler, JobPayload};
use crate::platforms::AdapterRegistry;
use crate::rate_limiter::RateLimiters;
use crate::realtime::{Envelope, Notifier};
use crate::types::SocialAccount;
use crate::vault::CredentialVault;

pub use inbox::{poll_inbox, send_reply, InboxOutcome};
pub use metrics::{refresh_metrics, MetricsOutcome};
pub use publish::{publish_item, PublishOutcome};

/// Default number of recent items refreshed by an account-level metrics job
pub const DEFAULT_METRICS_BATCH: u32 = 20;

/// Default bound on a single platform publish call
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(90);

/// Publish deadline for a given job timeout.
///
/// Leaves a fifth of the job's time to persist the failure before the
/// worker gives up on the job.
pub fn publish_deadline(job_timeout: Duration) -> Duration {
    job_timeout.saturating_sub(job_timeout / 5)
}

/// Everything a handler needs, shared by every worker
pub struct WorkerContext {
    pub db: Database,
    pub vault: Arc<CredentialVault>,
    pub adapters: AdapterRegistry,
    pub limiters: RateLimiters,
    pub notifier: Arc<dyn Notifier>,
    /// Upper bound on items per account-level metrics job
    pub metrics_batch_size: u32,
    /// Upper bound on the adapter's publish call
    pub publish_timeout: Duration,
}

impl WorkerContext {
    pub fn new(
        db: Database,
        vault: Arc<CredentialVault>,
        adapters: AdapterRegistry,
        limiters: RateLimiters,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            vault,
            adapters,
            limiters,
            notifier,
            metrics_batch_size: DEFAULT_METRICS_BATCH,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_metrics_batch_size(mut self, batch_size: u32) -> Self {
        self.metrics_batch_size = batch_size.max(1);
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Decrypt an account's access token off the async runtime
    pub async fn access_token(&self, account: &SocialAccount) -> Result<SecretString> {
        let vault = Arc::clone(&self.vault);
        let blob = account.encrypted_access_token.clone();
        tokio::task::spawn_blocking(move || vault.decrypt(&blob))
            .await
            .map_err(|e| VaultError::Malformed(format!("decryption task failed: {}", e)))?
    }

    pub(crate) async fn notify(&self, brand_id: &str, envelope: Envelope) {
        self.notifier.notify(brand_id, envelope).await;
    }
}

/// Rate limiter key for calls made on behalf of an account
pub(crate) fn account_key(account: &SocialAccount) -> String {
    format!("{}:{}", account.platform, account.id)
}

/// Routes each job to the handler for its payload
pub struct PipelineHandler {
    ctx: Arc<WorkerContext>,
}

impl PipelineHandler {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }
}

#[async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        match &job.payload {
            JobPayload::Publish(payload) => {
                publish_item(&self.ctx, payload).await?;
            }
            JobPayload::Metrics(payload) => {
                let outcome = refresh_metrics(&self.ctx, payload).await?;
                tracing::debug!(
                    job_id = %job.id,
                    updated = outcome.updated,
                    failed = outcome.failed,
                    "Metrics job finished"
                );
            }
            JobPayload::InboxPoll(payload) => {
                let outcome = poll_inbox(&self.ctx, payload).await?;
                tracing::debug!(
                    job_id = %job.id,
                    fetched = outcome.fetched,
                    inserted = outcome.inserted,
                    "Inbox poll finished"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_deadline_leaves_room_to_record_failure() {
        assert_eq!(publish_deadline(Duration::from_secs(120)), Duration::from_secs(96));
        assert_eq!(publish_deadline(Duration::from_millis(250)), Duration::from_millis(200));
        assert_eq!(publish_deadline(Duration::ZERO), Duration::ZERO);
    }
}
