//! Client-side request rate limits, like `10/s` or `3500/m`.
//!
//! These keep us under a provider's published limits, so we see fewer 429
//! responses in the first place. Any 429s we do see are still retried.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// How long is this period?
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period. Never zero.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a [`RateLimiter`] for this rate limit.
    ///
    /// The bucket starts full, so a short run can use its whole allowance
    /// immediately. After that, we hand out one request every
    /// `period / max_requests`, rather than refilling the whole bucket once
    /// per period, which would allow bursts of twice the limit.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        let max_requests = u32::try_from(self.max_requests).unwrap_or(u32::MAX);
        let interval = (self.per_period.to_duration() / max_requests)
            .max(Duration::from_millis(1));
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(1)
            .max(self.max_requests)
            .interval(interval)
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected a value like \"10/s\" or \"60/m\""))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least 1 request"));
            }
            Ok(Self {
                max_requests,
                per_period: per_period.parse::<RateLimitPeriod>()?,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn test_parse() {
        let rate_limit = RateLimit::from_str("10/s").unwrap();
        assert_eq!(rate_limit.max_requests, 10);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Second);

        let rate_limit = RateLimit::from_str("3500/m").unwrap();
        assert_eq!(rate_limit.max_requests, 3500);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Minute);
        assert_eq!(rate_limit.to_string(), "3500/m");
    }

    #[test]
    fn test_failed_parse() {
        for input in ["10/h", "ten/s", "10", "0/s", "/s", ""] {
            assert!(RateLimit::from_str(input).is_err(), "accepted {input:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spreads_requests_after_initial_burst() {
        let limiter = RateLimit::from_str("4/s").unwrap().to_rate_limiter();
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire_one().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));

        // The fifth request has to wait for one refill, not a whole second.
        limiter.acquire_one().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }
}
