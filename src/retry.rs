//! Retrying rate-limited summary requests.
//!
//! Drivers classify each attempt with [`keen_retry::RetryResult`]:
//! `Transient` means "the service is throttling us, try again later", and
//! `Fatal` means retrying can't help. [`summarize_page`] turns a stream of
//! attempts into a single result, sleeping `1s, 2s, 4s, ...` between
//! rate-limited attempts, and never making more than
//! [`RetryPolicy::max_retries`] attempts.

use std::time::Duration;

use keen_retry::RetryResult;
use reqwest::StatusCode;
use tokio::time;

use crate::{
    async_utils::CancelToken,
    config::DEFAULT_MAX_RETRIES,
    drivers::{Driver, TokenUsage},
    error::{CompletionError, PageError},
    prelude::*,
    prompt::SummaryRequest,
};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Is this error the service telling us to slow down?
///
/// Only rate limiting is retried. Network failures, timeouts, overloaded
/// backends and bad requests all fail the page immediately.
pub trait IsRateLimited {
    /// Is this error a rate limit?
    fn is_rate_limited(&self) -> bool;
}

impl IsRateLimited for StatusCode {
    fn is_rate_limited(&self) -> bool {
        *self == StatusCode::TOO_MANY_REQUESTS
    }
}

/// Convert a [`Result`] into a [`RetryResult`].
pub trait IntoRetryResult<T, E> {
    /// Rate limits become `Transient`, everything else `Fatal`.
    fn into_retry_result(self) -> RetryResult<(), (), T, E>;

    /// All errors are `Fatal`.
    fn into_fatal(self) -> RetryResult<(), (), T, E>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: IsRateLimited,
{
    fn into_retry_result(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if error.is_rate_limited() => {
                debug!("Rate limited");
                RetryResult::Transient { input: (), error }
            }
            Err(error) => retry_result_fatal(error),
        }
    }

    fn into_fatal(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) => retry_result_fatal(error),
        }
    }
}

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_with_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_with_retry_result;

/// How we retry rate-limited requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The most attempts we'll make for one page. At least 1.
    pub max_retries: u32,

    /// The first backoff delay. Each later delay doubles.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// How long to wait after failed attempt number `attempt` (counting
    /// from 0).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.checked_pow(attempt).unwrap_or(u32::MAX))
    }

    /// The longest we could possibly wait on a single page.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_retries.saturating_sub(1))
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// A successfully summarized page.
#[derive(Clone, Debug)]
pub struct PageSummary {
    /// The 0-based page index.
    pub page_index: usize,

    /// The summary, with surrounding whitespace trimmed.
    pub text: String,

    /// How many requests we made, including the successful one.
    pub attempts: u32,

    /// Every backoff delay we waited, in order.
    pub waits: Vec<Duration>,

    /// Tokens used by the successful request.
    pub token_usage: Option<TokenUsage>,
}

impl PageSummary {
    /// Total time spent in backoff.
    pub fn waited(&self) -> Duration {
        self.waits.iter().sum()
    }
}

/// Summarize one page, retrying while we're rate limited.
///
/// Attempts stop at the first success, the first non-rate-limit error, or
/// after `policy.max_retries` attempts. We don't sleep after the last
/// attempt. `cancel` is checked before every attempt and interrupts
/// backoff sleeps.
#[instrument(level = "debug", skip_all, fields(page = request.page_index + 1))]
pub async fn summarize_page(
    driver: &dyn Driver,
    request: &SummaryRequest,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<PageSummary, PageError> {
    let page = request.page_index;
    let mut attempts = 0u32;
    let mut waits: Vec<Duration> = vec![];

    loop {
        if cancel.is_cancelled() {
            return Err(PageError::Cancelled { page, attempts });
        }

        let result = driver.complete(request).await;
        attempts += 1;
        let error = match result {
            RetryResult::Ok { output, .. } => {
                if attempts > 1 {
                    info!(attempts, "Page {} succeeded after retrying", page + 1);
                }
                return Ok(PageSummary {
                    page_index: page,
                    text: output.text.trim().to_owned(),
                    attempts,
                    waits,
                    token_usage: output.token_usage,
                });
            }
            RetryResult::Fatal { error, .. } => {
                error!("Page {} FAILED with error {error}", page + 1);
                return Err(PageError::Permanent {
                    page,
                    attempts,
                    source: error,
                });
            }
            RetryResult::Transient { error, .. } => error,
        };

        if attempts >= policy.max_retries {
            let waited = waits.iter().sum();
            error!(
                "Page {} FAILED after exhausting all {attempts} attempts with error {error}",
                page + 1
            );
            return Err(PageError::RetryExhausted {
                page,
                attempts,
                waited,
                last_error: error,
            });
        }

        let delay = policy.backoff(attempts - 1);
        if let CompletionError::RateLimited {
            retry_after: Some(retry_after),
            ..
        } = &error
        {
            debug!(?retry_after, "Server suggested a retry delay");
        }
        warn!(
            "Page {}: rate limited on attempt {attempts}/{}, retrying after {delay:?}",
            page + 1,
            policy.max_retries
        );
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(PageError::Cancelled { page, attempts });
            }
        }
        waits.push(delay);
    }
}
