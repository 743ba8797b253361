//! Placeholder adapter for platforms without an integration yet

use async_trait::async_trait;

use super::{not_implemented, AccountInfo, MetricsSnapshot, PlatformAdapter, PublishRequest, PublishResult};
use crate::error::Result;
use crate::types::Platform;

/// Fails every call with `NotImplemented`, which handlers treat as permanent
pub struct StubAdapter {
    platform: Platform,
}

impl StubAdapter {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl PlatformAdapter for StubAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn get_account(&self, _token: &str) -> Result<AccountInfo> {
        Err(not_implemented(self.platform, "get_account"))
    }

    async fn publish(&self, _token: &str, _request: &PublishRequest) -> Result<PublishResult> {
        Err(not_implemented(self.platform, "publish"))
    }

    async fn delete(&self, _token: &str, _external_post_id: &str) -> Result<()> {
        Err(not_implemented(self.platform, "delete"))
    }

    async fn fetch_metrics(&self, _token: &str, _external_post_id: &str) -> Result<MetricsSnapshot> {
        Err(not_implemented(self.platform, "fetch_metrics"))
    }
}
