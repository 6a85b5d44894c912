//! Summarizing a whole document, one page at a time.
//!
//! Each page goes through [`summarize_page`], which owns all retrying. We
//! run up to `jobs` pages at once through an ordered buffer, so summaries
//! always come back in page order, and `summaries[i]` is always the summary
//! of page `i`.

use std::{pin::pin, time::Duration};

use futures::{StreamExt as _, stream};
use indicatif::ProgressBar;

use crate::{
    async_utils::CancelToken,
    config::{FailurePolicy, SummaryConfig},
    drivers::{Driver, TokenUsage},
    error::PageError,
    prelude::*,
    prompt::{PromptTemplate, SummaryRequest},
    retry::{PageSummary, summarize_page},
    source::Document,
};

/// A page we couldn't summarize, under [`FailurePolicy::Continue`].
#[derive(Debug)]
pub struct PageFailure {
    /// The 0-based page index.
    pub page: usize,
    /// What went wrong.
    pub error: PageError,
}

/// Counters for one run.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    /// Pages we got a summary for.
    pub summarized: usize,
    /// Blank pages we didn't send.
    pub skipped: usize,
    /// Pages which failed.
    pub failed: usize,
    /// Requests made for successful pages, including retries.
    pub attempts: u64,
    /// Time spent in backoff for successful pages.
    pub total_backoff: Duration,
    /// Tokens used by successful pages.
    pub token_usage: TokenUsage,
}

/// The output of [`summarize_document`].
#[derive(Debug)]
pub struct SummaryResult {
    /// One summary per page, in page order. Failed and skipped pages have
    /// empty summaries.
    pub summaries: Vec<String>,
    /// Pages which failed, in page order.
    pub failures: Vec<PageFailure>,
    /// Counters for this run.
    pub stats: RunStats,
}

impl SummaryResult {
    /// What portion of pages failed?
    pub fn failure_rate(&self) -> f32 {
        if self.summaries.is_empty() {
            0.0
        } else {
            self.failures.len() as f32 / self.summaries.len() as f32
        }
    }

    /// Fail if more pages failed than we're allowed.
    pub fn check_failure_rate(&self, allowed_failure_rate: f32) -> Result<()> {
        let failure_rate = self.failure_rate();
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of pages could not be summarized, but only {:.2}% were allowed",
                self.failures.len(),
                self.summaries.len(),
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}

/// What happened to a single page.
enum PageOutcome {
    Summarized(PageSummary),
    Skipped,
    Failed(PageError),
}

/// Summarize every page of `document`.
///
/// Under [`FailurePolicy::FailFast`], the first failed page (in page order)
/// is returned as our error, and any requests still in flight are dropped.
/// Cancellation always ends the run, whatever the failure policy.
#[instrument(level = "debug", skip_all, fields(pages = document.len(), jobs = config.jobs))]
pub async fn summarize_document(
    document: &Document,
    template: &PromptTemplate,
    driver: &dyn Driver,
    config: &SummaryConfig,
    cancel: &CancelToken,
    progress: &ProgressBar,
) -> Result<SummaryResult, PageError> {
    let outcomes = stream::iter(document.pages().iter().enumerate())
        .map(|(page_index, text)| {
            summarize_one(page_index, text, template, driver, config, cancel)
        })
        .buffered(config.jobs.max(1));
    let mut outcomes = pin!(progress.clone().wrap_stream(outcomes));

    let mut summaries = Vec::with_capacity(document.len());
    let mut failures = vec![];
    let mut stats = RunStats::default();
    while let Some(outcome) = outcomes.next().await {
        match outcome {
            PageOutcome::Summarized(summary) => {
                debug_assert_eq!(summary.page_index, summaries.len());
                stats.summarized += 1;
                stats.attempts += u64::from(summary.attempts);
                stats.total_backoff += summary.waited();
                if let Some(token_usage) = summary.token_usage {
                    stats.token_usage += token_usage;
                }
                summaries.push(summary.text);
            }
            PageOutcome::Skipped => {
                stats.skipped += 1;
                summaries.push(String::new());
            }
            PageOutcome::Failed(error @ PageError::Cancelled { .. }) => {
                return Err(error);
            }
            PageOutcome::Failed(error) => match config.failure_policy {
                FailurePolicy::FailFast => return Err(error),
                FailurePolicy::Continue => {
                    warn!("Leaving page {} empty: {error}", error.page() + 1);
                    stats.failed += 1;
                    failures.push(PageFailure {
                        page: error.page(),
                        error,
                    });
                    summaries.push(String::new());
                }
            },
        }
    }

    Ok(SummaryResult {
        summaries,
        failures,
        stats,
    })
}

/// Summarize a single page, without any early returns.
async fn summarize_one(
    page_index: usize,
    text: &str,
    template: &PromptTemplate,
    driver: &dyn Driver,
    config: &SummaryConfig,
    cancel: &CancelToken,
) -> PageOutcome {
    if config.skip_blank_pages && text.trim().is_empty() {
        debug!("Skipping blank page {}", page_index + 1);
        return PageOutcome::Skipped;
    }
    let request = match SummaryRequest::build(page_index, text, template, config) {
        Ok(request) => request,
        Err(err) => {
            return PageOutcome::Failed(PageError::InvalidRequest {
                page: page_index,
                detail: format!("{err:#}"),
            });
        }
    };
    match summarize_page(driver, &request, &config.retry_policy, cancel).await {
        Ok(summary) => PageOutcome::Summarized(summary),
        Err(err) => PageOutcome::Failed(err),
    }
}
