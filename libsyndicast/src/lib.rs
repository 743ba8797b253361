//! Syndicast - asynchronous social media publishing pipeline
//!
//! This library provides the job queues, worker pools and platform adapters
//! that publish content to social platforms, refresh engagement metrics and
//! poll inboxes, along with the credential vault, rate limiting and realtime
//! fan-out those workers depend on.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod logging;
pub mod platforms;
pub mod rate_limiter;
pub mod realtime;
pub mod scheduler;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{Result, SyndicastError};
pub use handlers::{PipelineHandler, WorkerContext};
pub use jobs::{JobPayload, JobQueue, QueueName, Queues, WorkerPool};
pub use platforms::{AdapterRegistry, PlatformAdapter};
pub use types::{Platform, Post, PostItem, PostItemStatus, PostStatus, SocialAccount};
pub use vault::CredentialVault;
