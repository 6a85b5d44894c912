//! Typed errors for the summarization pipeline.
//!
//! [`CompletionError`] describes a single failed call to the summarization
//! service. [`PageError`] describes why a page ended without a summary.
//! Everything outside the pipeline uses [`anyhow`].

use std::time::Duration;

use thiserror::Error;

use crate::retry::IsRateLimited;

/// A failed call to the summarization service.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The service is throttling us. The only kind of error we retry.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// How long the service asked us to wait, if it said.
        retry_after: Option<Duration>,
    },

    /// Bad or missing credentials.
    #[error("authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// The service rejected the request itself.
    #[error("request rejected (HTTP {status}): {message}")]
    BadRequest { status: u16, message: String },

    /// Any other error response, including exhausted quotas.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// We couldn't talk to the service.
    #[error("network error: {0}")]
    Network(String),

    /// The service didn't answer within our timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// We couldn't build a valid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The service answered, but not with anything we understand.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl IsRateLimited for CompletionError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, CompletionError::RateLimited { .. })
    }
}

/// Why a page has no summary.
///
/// `page` is always the 0-based page index. Messages use 1-based page
/// numbers, like a PDF viewer.
#[derive(Debug, Error)]
pub enum PageError {
    /// We were rate limited on every attempt.
    #[error(
        "page {}: still rate limited after {attempts} attempts ({:.0}s spent waiting): {last_error}",
        .page + 1,
        .waited.as_secs_f64()
    )]
    RetryExhausted {
        page: usize,
        attempts: u32,
        waited: Duration,
        #[source]
        last_error: CompletionError,
    },

    /// A failure that retrying can't fix.
    #[error("page {}: {source}", .page + 1)]
    Permanent {
        page: usize,
        attempts: u32,
        #[source]
        source: CompletionError,
    },

    /// We were asked to stop.
    #[error("page {}: cancelled after {attempts} attempts", .page + 1)]
    Cancelled { page: usize, attempts: u32 },

    /// We couldn't even build the request.
    #[error("page {}: could not build request: {detail}", .page + 1)]
    InvalidRequest { page: usize, detail: String },
}

impl PageError {
    /// The 0-based index of the page which failed.
    pub fn page(&self) -> usize {
        match self {
            PageError::RetryExhausted { page, .. }
            | PageError::Permanent { page, .. }
            | PageError::Cancelled { page, .. }
            | PageError::InvalidRequest { page, .. } => *page,
        }
    }

    /// A short name for the kind of failure.
    pub fn kind(&self) -> &'static str {
        match self {
            PageError::RetryExhausted { .. } => "retry exhausted",
            PageError::Permanent { .. } => "permanent error",
            PageError::Cancelled { .. } => "cancelled",
            PageError::InvalidRequest { .. } => "invalid request",
        }
    }
}
