//! Summarization drivers.
//!
//! A driver makes exactly one request per call to [`Driver::complete`], and
//! tells us whether a failure was a rate limit (`Transient`) or something
//! retrying can't fix (`Fatal`). Retrying itself lives in [`crate::retry`],
//! so drivers must never retry on their own.

use std::{fmt, ops::AddAssign, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, future::BoxFuture};
use keen_retry::RetryResult;
use leaky_bucket::RateLimiter;
use tokio::time;

use crate::{
    error::CompletionError, prelude::*, prompt::SummaryRequest, rate_limit::RateLimit,
};

pub mod echo;
pub mod openai;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// OpenAI driver (also for LiteLLM, Ollama, etc). Uses the
    /// `/completions` endpoint.
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Offline driver which "summarizes" a page by echoing the prompt.
    /// Useful for testing the rest of the pipeline without an API key.
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver, applying any rate limit.
    pub fn create_driver(&self, llm_opts: &LlmOpts) -> Result<Box<dyn Driver>> {
        let driver: Box<dyn Driver> = match self {
            DriverType::OpenAI => Box::new(openai::OpenAiDriver::new(llm_opts)?),
            DriverType::Echo => Box::new(echo::EchoDriver::new()),
        };
        match &llm_opts.rate_limit {
            Some(rate_limit) => Ok(Box::new(RateLimitedDriver::new(driver, rate_limit))),
            None => Ok(driver),
        }
    }
}

/// Options controlling how we talk to the summarization service.
#[derive(Args, Clone, Debug)]
pub struct LlmOpts {
    /// The driver to use. This defaults to `openai`, which works with OpenAI,
    /// LiteLLM and Ollama-based models.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// A timeout, in seconds, for a single summary request. Timeouts are not
    /// retried. Note that even if a request times out, you'll probably still
    /// be charged.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for API requests, of the form "10/s" or "2000/m". This is
    /// applied separately from `--jobs`, and retries count against it.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,
}

impl LlmOpts {
    /// Our per-request timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Apply an optional timeout to a request future.
///
/// `'fut` is the lifetime of any data borrowed by `future`. We box our output
/// because the two branches have different future types.
pub fn apply_timeout<'fut, T>(
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, CompletionError>> + Send + 'fut,
) -> BoxFuture<'fut, Result<T, CompletionError>>
where
    T: Send + 'fut,
{
    match timeout {
        Some(timeout) => time::timeout(timeout, future)
            // Merge `Result<Result<T, _>, Elapsed>` into one level.
            .map(move |result| match result {
                Ok(inner) => inner,
                Err(_) => Err(CompletionError::Timeout(timeout)),
            })
            .boxed(),
        None => future.boxed(),
    }
}

/// The result of a single completion attempt.
pub type CompletionResult = RetryResult<(), (), Completion, CompletionError>;

/// Interface trait for summarization drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Make one completion request. Rate limits must be reported as
    /// `Transient`, and everything else as `Fatal`.
    async fn complete(&self, request: &SummaryRequest) -> CompletionResult;
}

/// A completion returned by the service.
#[derive(Clone, Debug)]
pub struct Completion {
    /// The generated text, as returned.
    pub text: String,

    /// Token usage, if the service reported it.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Wraps another driver, and waits for the rate limiter before every
/// request, including retries.
pub struct RateLimitedDriver {
    inner: Box<dyn Driver>,
    rate_limit: RateLimit,
    limiter: RateLimiter,
}

impl RateLimitedDriver {
    /// Rate limit `inner`.
    pub fn new(inner: Box<dyn Driver>, rate_limit: &RateLimit) -> Self {
        Self {
            inner,
            rate_limit: rate_limit.clone(),
            limiter: rate_limit.to_rate_limiter(),
        }
    }
}

impl fmt::Debug for RateLimitedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedDriver")
            .field("inner", &self.inner)
            .field("rate_limit", &self.rate_limit.to_string())
            .finish()
    }
}

#[async_trait]
impl Driver for RateLimitedDriver {
    async fn complete(&self, request: &SummaryRequest) -> CompletionResult {
        self.limiter.acquire_one().await;
        self.inner.complete(request).await
    }
}

/// Drivers for unit tests.
#[cfg(test)]
pub mod testing {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;
    use crate::retry::{retry_result_fatal, retry_result_ok};

    /// One scripted response.
    #[derive(Clone, Debug)]
    pub enum Step {
        /// Reply with this text.
        Reply(&'static str),
        /// Reply with "Summary of page N".
        Summary,
        /// Wait, then reply with "Summary of page N".
        SlowSummary(Duration),
        /// HTTP 429.
        RateLimited,
        /// HTTP 401.
        AuthFailure,
        /// Connection reset.
        NetworkFailure,
    }

    /// A driver which plays back scripted responses.
    ///
    /// Per-page scripts run first, then the shared script, then `fallback`
    /// forever.
    #[derive(Debug)]
    pub struct ScriptedDriver {
        shared: Mutex<VecDeque<Step>>,
        per_page: Mutex<HashMap<usize, VecDeque<Step>>>,
        fallback: Step,
        calls: AtomicUsize,
    }

    impl ScriptedDriver {
        /// Play `steps` in order, then always summarize.
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                shared: Mutex::new(steps.into()),
                per_page: Mutex::new(HashMap::new()),
                fallback: Step::Summary,
                calls: AtomicUsize::new(0),
            }
        }

        /// Always do the same thing.
        pub fn always(step: Step) -> Self {
            Self {
                fallback: step,
                ..Self::new(vec![])
            }
        }

        /// Script the responses for a single page.
        pub fn with_page(self, page_index: usize, steps: Vec<Step>) -> Self {
            self.per_page
                .lock()
                .unwrap()
                .insert(page_index, steps.into());
            self
        }

        /// How many requests have we seen?
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self, page_index: usize) -> Step {
            if let Some(step) = self
                .per_page
                .lock()
                .unwrap()
                .get_mut(&page_index)
                .and_then(|steps| steps.pop_front())
            {
                return step;
            }
            self.shared
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn reply(text: String) -> CompletionResult {
        retry_result_ok(Completion {
            text,
            token_usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
        })
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn complete(&self, request: &SummaryRequest) -> CompletionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let page = request.page_index;
            match self.next_step(page) {
                Step::Reply(text) => reply(text.to_owned()),
                Step::Summary => reply(format!("Summary of page {}", page + 1)),
                Step::SlowSummary(delay) => {
                    time::sleep(delay).await;
                    reply(format!("Summary of page {}", page + 1))
                }
                Step::RateLimited => RetryResult::Transient {
                    input: (),
                    error: CompletionError::RateLimited {
                        message: "Rate limit reached for requests".to_owned(),
                        retry_after: None,
                    },
                },
                Step::AuthFailure => retry_result_fatal(CompletionError::Auth {
                    status: 401,
                    message: "Incorrect API key provided".to_owned(),
                }),
                Step::NetworkFailure => retry_result_fatal(CompletionError::Network(
                    "connection reset by peer".to_owned(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::{
        testing::{ScriptedDriver, Step},
        *,
    };
    use crate::{config::SummaryConfig, prompt::PromptTemplate};

    fn request(page_index: usize) -> SummaryRequest {
        SummaryRequest::build(
            page_index,
            "text",
            &PromptTemplate::default(),
            &SummaryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_token_usage_add_assign() {
        let mut usage = TokenUsage::default();
        assert!(usage.is_zero());
        usage += TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 4,
        };
        usage += TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 1,
        };
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_timeout() {
        let slow = async {
            time::sleep(Duration::from_secs(10)).await;
            Ok::<_, CompletionError>(())
        };
        let err = apply_timeout(Some(Duration::from_secs(2)), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Timeout(d) if d == Duration::from_secs(2)));

        let fast = async { Ok::<_, CompletionError>(7) };
        assert_eq!(apply_timeout(None, fast).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_driver_spaces_requests() {
        let rate_limit = "2/s".parse::<RateLimit>().unwrap();
        let driver =
            RateLimitedDriver::new(Box::new(ScriptedDriver::always(Step::Summary)), &rate_limit);

        let start = Instant::now();
        for page in 0..4 {
            let result = driver.complete(&request(page)).await;
            assert!(matches!(result, RetryResult::Ok { .. }));
        }
        // Two requests from the initial bucket, then one every 500ms.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
