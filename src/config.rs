//! Summarization settings.
//!
//! [`PipelineOpts`] is what the user types. [`SummaryConfig`] is the
//! validated version we pass by reference through the pipeline.

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::{prelude::*, retry::RetryPolicy};

/// Default model. This is a completion (not chat) model, with a 4097 token
/// context window.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo-instruct";

/// Default context window shared by the prompt and the completion.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 4097;

/// Default lower bound on `max_tokens`.
pub const DEFAULT_MIN_BUDGET: u32 = 256;

/// Default number of attempts per page when we're being rate limited.
pub const DEFAULT_MAX_RETRIES: u32 = 6;

/// What to do when a page can't be summarized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the whole run at the first failed page.
    #[default]
    FailFast,

    /// Leave an empty summary for the failed page, and keep going.
    Continue,
}

/// Validated settings for one summarization run.
#[derive(Clone, Debug)]
pub struct SummaryConfig {
    /// The model to ask for summaries.
    pub model: String,

    /// Tokens shared by prompt and completion.
    pub context_window: u32,

    /// Smallest `max_tokens` we will ever request.
    pub min_budget: u32,

    /// How we retry rate-limited requests.
    pub retry_policy: RetryPolicy,

    /// What to do with pages that fail.
    pub failure_policy: FailurePolicy,

    /// Pages in flight at once. 1 means strictly sequential.
    pub jobs: usize,

    /// Don't call the model for pages with no visible text.
    pub skip_blank_pages: bool,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            min_budget: DEFAULT_MIN_BUDGET,
            retry_policy: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            jobs: 1,
            skip_blank_pages: false,
        }
    }
}

impl SummaryConfig {
    /// Check that our settings make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.retry_policy.max_retries == 0 {
            return Err(anyhow!("--max-retries must be at least 1"));
        }
        if self.min_budget == 0 {
            return Err(anyhow!("--min-budget must be at least 1"));
        }
        if self.context_window < self.min_budget {
            return Err(anyhow!(
                "--context-window ({}) must be at least --min-budget ({})",
                self.context_window,
                self.min_budget
            ));
        }
        if self.jobs == 0 {
            return Err(anyhow!("--jobs must be at least 1"));
        }
        Ok(())
    }
}

/// Command-line options controlling the summarization pipeline.
#[derive(Args, Clone, Debug)]
pub struct PipelineOpts {
    /// The completion model to use.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// The model's context window, in tokens. The prompt is estimated at
    /// one token per three characters, and the rest is requested for the
    /// summary.
    #[clap(long, default_value_t = DEFAULT_CONTEXT_WINDOW)]
    pub context_window: u32,

    /// Never request fewer than this many completion tokens, even for very
    /// long pages.
    #[clap(long, default_value_t = DEFAULT_MIN_BUDGET)]
    pub min_budget: u32,

    /// Maximum attempts per page when the API is rate limiting us. Waits
    /// 1s, 2s, 4s, ... between attempts.
    #[clap(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// What to do when a page fails for good.
    #[clap(long, value_enum, default_value_t = FailurePolicy::default())]
    pub on_failure: FailurePolicy,

    /// With `--on-failure continue`, what portion of pages may fail before
    /// we report the run as failed? Specified as a number between 0.0 and
    /// 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,

    /// Max number of pages to summarize at a time. Output order is always
    /// preserved.
    #[clap(short = 'j', long = "jobs", default_value = "1")]
    pub job_count: usize,

    /// Don't send pages without any visible text to the model.
    #[clap(long)]
    pub skip_blank_pages: bool,

    /// A Handlebars template for the summary prompt. The page text is
    /// available as `{{text}}`.
    #[clap(long, value_name = "FILE")]
    pub prompt_template: Option<PathBuf>,
}

impl PipelineOpts {
    /// Build a validated [`SummaryConfig`].
    pub fn to_config(&self) -> Result<SummaryConfig> {
        if !(0.0..=1.0).contains(&self.allowed_failure_rate) {
            return Err(anyhow!(
                "--allowed-failure-rate must be between 0.0 and 1.0, got {}",
                self.allowed_failure_rate
            ));
        }
        let config = SummaryConfig {
            model: self.model.clone(),
            context_window: self.context_window,
            min_budget: self.min_budget,
            retry_policy: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_secs(1),
            },
            failure_policy: self.on_failure,
            jobs: self.job_count,
            skip_blank_pages: self.skip_blank_pages,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestOpts {
        #[clap(flatten)]
        pipeline: PipelineOpts,
    }

    fn parse(args: &[&str]) -> PipelineOpts {
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        TestOpts::try_parse_from(argv).unwrap().pipeline
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).to_config().unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.context_window, 4097);
        assert_eq!(config.retry_policy.max_retries, 6);
        assert_eq!(config.retry_policy.base_delay, Duration::from_secs(1));
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.jobs, 1);
        assert!(!config.skip_blank_pages);
    }

    #[test]
    fn test_failure_policy_flag() {
        let config = parse(&["--on-failure", "continue"]).to_config().unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        let config = parse(&["--on-failure", "fail-fast"]).to_config().unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let cases: &[(&[&str], &str)] = &[
            (&["--max-retries", "0"], "--max-retries"),
            (&["--min-budget", "0"], "--min-budget"),
            (
                &["--context-window", "100", "--min-budget", "200"],
                "--context-window",
            ),
            (&["--jobs", "0"], "--jobs"),
            (&["--allowed-failure-rate", "1.5"], "--allowed-failure-rate"),
        ];
        for (args, expected) in cases {
            let err = parse(args).to_config().unwrap_err().to_string();
            assert!(
                err.contains(expected),
                "expected {expected:?} in error for {args:?}, got {err:?}"
            );
        }
    }
}
