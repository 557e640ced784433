//! Error types for the inbox sorter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid pattern for rule {rule}: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Stable classification of remote failures, recorded on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimited,
    Unavailable,
    Timeout,
    NotFound,
    Conflict,
    Unauthorized,
    BadRequest,
    InvalidResponse,
    Ambiguous,
    Internal,
}

impl ErrorCode {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "bad_request",
            Self::InvalidResponse => "invalid_response",
            Self::Ambiguous => "ambiguous",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Mailbox store errors, modelled on the HTTP status taxonomy of the remote API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Map an HTTP status and body onto the store taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            429 => Self::RateLimited { retry_after },
            408 | 504 => Self::Timeout(message),
            500 | 502 | 503 => Self::Unavailable(message),
            401 | 403 => Self::Unauthorized(message),
            _ => Self::Rejected { status, message },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Rejected { .. } => ErrorCode::BadRequest,
            Self::InvalidResponse(_) => ErrorCode::InvalidResponse,
        }
    }

    /// Transient failures are eligible for retry with backoff.
    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout(error.to_string());
        }
        if let Some(status) = error.status() {
            return Self::from_status(status.as_u16(), error.to_string(), None);
        }
        if error.is_connect() || error.is_request() {
            return Self::Unavailable(error.to_string());
        }
        if error.is_decode() {
            return Self::InvalidResponse(error.to_string());
        }
        Self::Unavailable(error.to_string())
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },
}

/// Folder resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Folder path is empty")]
    EmptyPath,

    #[error("Folder not found: {path}")]
    NotFound { path: String },

    #[error("Folder name {name:?} is ambiguous: {candidates} folders match at depth {depth}")]
    Ambiguous {
        name: String,
        candidates: usize,
        depth: usize,
    },

    #[error("Folder {name:?} could not be created under {parent}: {reason}")]
    CreateFailed {
        name: String,
        parent: String,
        reason: String,
    },

    #[error("Store error while resolving folders: {0}")]
    Store(#[from] StoreError),
}

impl ResolveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyPath | Self::NotFound { .. } | Self::CreateFailed { .. } => {
                ErrorCode::NotFound
            }
            Self::Ambiguous { .. } => ErrorCode::Ambiguous,
            Self::Store(e) => e.code(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Email {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Source folder could not be selected: {0}")]
    Source(#[from] ResolveError),

    #[error("Fetching candidate emails failed: {0}")]
    Fetch(#[source] StoreError),
}
