//! Error types for plan generation, quota enforcement and persistence.

use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// A read or checkpoint write could not reach the store. The operation may be retried.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record at {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised by the generative text service client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    #[error("Provider authentication failed: {0}")]
    AuthFailed(String),

    #[error("Provider rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Provider model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Typed failure of a single generation step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// The service answered but the answer did not match the expected shape.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The service was unreachable, timed out, or refused the request.
    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Rate limited by service: {0}")]
    RateLimited(String),
}

impl From<ProviderError> for StepFailure {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimit(msg) => StepFailure::RateLimited(msg),
            ProviderError::InvalidResponse(msg) => StepFailure::Validation(msg),
            other => StepFailure::Transport(other.to_string()),
        }
    }
}

/// Quota ledger errors
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(
        "Daily token quota exceeded for {identity}: used {used}, requested {requested}, cap {cap}"
    )]
    Exceeded {
        identity: String,
        used: u64,
        requested: u64,
        cap: u64,
    },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Quota store error: {0}")]
    Store(#[from] StorageError),
}

/// Top-level error for pipeline, relay and CLI operations
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Job {0} is already running")]
    JobBusy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Quota(#[from] QuotaError),

    #[error("Step failed: {0}")]
    Step(#[from] StepFailure),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ApiError {
    /// True when the caller ran out of daily quota. Recoverable: wait for the window to reset.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, ApiError::Quota(QuotaError::Exceeded { .. }))
    }

    /// True when a checkpoint could not be persisted. The job stays resumable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            ApiError::StorageError(_) | ApiError::Quota(QuotaError::Store(_))
        )
    }
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}
