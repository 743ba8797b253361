//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use std::sync::Arc;

use libsyndicast::config::RateLimitsConfig;
use libsyndicast::platforms::mock::MockAdapter;
use libsyndicast::rate_limiter::{MemoryCounterStore, RateLimitPolicy, RateLimiters};
use libsyndicast::realtime::{BrandReceiver, Envelope, EventBus, EventType};
use libsyndicast::{
    AdapterRegistry, CredentialVault, Database, Platform, Post, PostItem, SocialAccount,
    WorkerContext,
};
use secrecy::SecretString;
use tempfile::TempDir;

pub const BRAND: &str = "brand-1";
pub const TOKEN: &str = "mock-access-token";

pub struct Harness {
    _dir: TempDir,
    pub db: Database,
    pub vault: Arc<CredentialVault>,
    pub events: EventBus,
}

impl Harness {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pipeline.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let vault = CredentialVault::new(SecretString::from("pipeline-master-key".to_string())).unwrap();
        Self {
            _dir: temp_dir,
            db,
            vault: Arc::new(vault),
            events: EventBus::default(),
        }
    }

    pub fn context(&self, adapters: Vec<Arc<MockAdapter>>) -> Arc<WorkerContext> {
        self.context_with_limits(adapters, generous_limits())
    }

    pub fn context_with_limits(
        &self,
        adapters: Vec<Arc<MockAdapter>>,
        limits: RateLimitsConfig,
    ) -> Arc<WorkerContext> {
        Arc::new(self.build_context(adapters, limits))
    }

    /// An unshared context, for tests that tune it with the `with_*` builders
    pub fn build_context(&self, adapters: Vec<Arc<MockAdapter>>, limits: RateLimitsConfig) -> WorkerContext {
        let registry = adapters
            .into_iter()
            .fold(AdapterRegistry::stubs(), |registry, adapter| registry.with_adapter(adapter));
        WorkerContext::new(
            self.db.clone(),
            Arc::clone(&self.vault),
            registry,
            RateLimiters::new(&limits, Arc::new(MemoryCounterStore::new())),
            Arc::new(self.events.clone()),
        )
    }

    pub fn subscribe(&self) -> BrandReceiver {
        self.events.subscribe_brand(BRAND)
    }

    pub async fn account(&self, platform: Platform, external_id: &str) -> SocialAccount {
        let account = SocialAccount::new(BRAND, platform, external_id, self.vault.encrypt(TOKEN).unwrap());
        self.db.create_account(&account).await.unwrap();
        account
    }

    pub async fn post(&self) -> Post {
        let post = Post::new(BRAND);
        self.db.create_post(&post).await.unwrap();
        post
    }

    pub async fn item(&self, post: &Post, account: &SocialAccount, content: &str) -> PostItem {
        let mut item = PostItem::new(post, account, content);
        item.media_urls = vec!["https://cdn.example/photo.jpg".to_string()];
        self.db.create_post_item(&item).await.unwrap();
        item
    }

    /// An item already published with the given external id
    pub async fn published_item(&self, post: &Post, account: &SocialAccount, external_id: &str) -> PostItem {
        let item = self.item(post, account, "published earlier").await;
        self.db
            .mark_item_published(&item.id, external_id, 1_700_000_000, &Default::default())
            .await
            .unwrap();
        item
    }
}

pub fn generous_limits() -> RateLimitsConfig {
    RateLimitsConfig {
        redis_url: None,
        api: RateLimitPolicy::new(1_000, 60_000),
        publish: RateLimitPolicy::new(1_000, 60_000),
        ai: RateLimitPolicy::new(1_000, 60_000),
    }
}

pub fn of_type(envelopes: &[Envelope], event_type: EventType) -> Vec<&Envelope> {
    envelopes
        .iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}
