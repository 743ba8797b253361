//! Error types for Syndicast

use thiserror::Error;

use crate::types::Platform;

pub type Result<T> = std::result::Result<T, SyndicastError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Vault(#[from] VaultError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Rate limit exceeded for {key} (resets at {reset_at_ms})")]
    RateLimited { key: String, reset_at_ms: i64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicastError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        SyndicastError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether retrying the same job can never succeed.
    ///
    /// Permanent failures skip the queue's backoff and fail the job at once.
    pub fn is_permanent(&self) -> bool {
        match self {
            SyndicastError::NotFound { .. }
            | SyndicastError::InvalidPayload(_)
            | SyndicastError::InvalidInput(_)
            | SyndicastError::Config(_)
            | SyndicastError::Vault(_) => true,
            SyndicastError::Platform(e) => !e.is_transient(),
            SyndicastError::RateLimited { .. }
            | SyndicastError::Database(_)
            | SyndicastError::Queue(_) => false,
        }
    }

    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::InvalidInput(_)
            | SyndicastError::InvalidPayload(_)
            | SyndicastError::NotFound { .. } => 3,
            SyndicastError::Config(_) | SyndicastError::Vault(_) => 2,
            SyndicastError::Platform(PlatformError::Authentication { .. }) => 2,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt column {column}: {message}")]
    Decode { column: &'static str, message: String },
}

/// Errors raised by platform adapters.
///
/// Every variant names the platform so handlers can persist a readable
/// failure reason without consulting the logs.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("{platform} authentication failed: {message}")]
    Authentication { platform: Platform, message: String },

    #[error("{platform} rejected the content: {message}")]
    Validation { platform: Platform, message: String },

    #[error("{platform} API returned {status}: {message}")]
    Api {
        platform: Platform,
        status: u16,
        message: String,
    },

    #[error("{platform} network error: {message}")]
    Network { platform: Platform, message: String },

    #[error("{platform} request timed out: {message}")]
    Timeout { platform: Platform, message: String },

    #[error("{platform} rate limit exceeded: {message}")]
    RateLimit {
        platform: Platform,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("{platform} has no object {external_id}")]
    NotFound {
        platform: Platform,
        external_id: String,
    },

    #[error("{platform} does not implement {capability}")]
    NotImplemented {
        platform: Platform,
        capability: &'static str,
    },
}

impl PlatformError {
    pub fn platform(&self) -> Platform {
        match self {
            PlatformError::Authentication { platform, .. }
            | PlatformError::Validation { platform, .. }
            | PlatformError::Api { platform, .. }
            | PlatformError::Network { platform, .. }
            | PlatformError::Timeout { platform, .. }
            | PlatformError::RateLimit { platform, .. }
            | PlatformError::NotFound { platform, .. }
            | PlatformError::NotImplemented { platform, .. } => *platform,
        }
    }

    /// Check if an error is transient and should be retried
    ///
    /// Transient errors include network issues, timeouts, rate limiting and
    /// server-side failures. Everything else needs a human to intervene.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network { .. }
            | PlatformError::Timeout { .. }
            | PlatformError::RateLimit { .. } => true,
            PlatformError::Api { status, .. } => *status >= 500,
            PlatformError::Authentication { .. }
            | PlatformError::Validation { .. }
            | PlatformError::NotFound { .. }
            | PlatformError::NotImplemented { .. } => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Master key is not configured")]
    MissingMasterKey,

    #[error("Credential blob is malformed: {0}")]
    Malformed(String),

    #[error("Credential blob failed authentication")]
    Tampered,

    #[error("Encryption failed")]
    Encryption,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {state}, expected {expected}")]
    InvalidState {
        job_id: String,
        state: String,
        expected: &'static str,
    },

    #[error("Job {job_id} was reclaimed after attempt {attempt}")]
    LeaseLost { job_id: String, attempt: u32 },

    #[error("Payload for queue {expected} enqueued on {actual}")]
    WrongQueue {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Failed to encode payload: {0}")]
    Encode(String),
}
