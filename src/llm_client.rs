//! Connection settings for OpenAI-compatible APIs (usually OpenAI itself,
//! LiteLLM or Ollama).

use std::{env, time::Duration};

use async_openai::config::OpenAIConfig;
use reqwest::{StatusCode, header::HeaderMap};
use serde::Deserialize;

use crate::{error::CompletionError, prelude::*, retry::IsRateLimited as _};

/// Build an OpenAI configuration from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE`.
pub fn create_openai_config() -> Result<OpenAIConfig> {
    let api_key = env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY must be set (it may also be set in .env)")?;
    let mut config = OpenAIConfig::new().with_api_key(api_key);
    if let Ok(api_base) = env::var("OPENAI_API_BASE") {
        config = config.with_api_base(api_base);
    }
    Ok(config)
}

/// Build the HTTP client shared by all requests.
///
/// We call the API with `reqwest` directly, because `async_openai::Client`
/// retries rate limits on its own, and we need to see every one.
pub fn create_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

/// The JSON error body returned by OpenAI-compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: async_openai::error::ApiError,
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Classify an HTTP error response.
///
/// 429 is a rate limit, unless the account is out of quota, which waiting
/// won't fix.
pub fn classify_error_response(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> CompletionError {
    let api_error = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let message = match &api_error {
        Some(api_error) => api_error.message.clone(),
        None if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_owned(),
        None => body.trim().to_owned(),
    };
    let error_type = api_error.as_ref().and_then(|e| e.r#type.as_deref());
    let status_code = status.as_u16();

    match status {
        _ if status.is_rate_limited() && error_type == Some("insufficient_quota") => {
            CompletionError::Api {
                status: status_code,
                message,
            }
        }
        _ if status.is_rate_limited() => CompletionError::RateLimited {
            message,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Auth {
            status: status_code,
            message,
        },
        _ if status.is_client_error() => CompletionError::BadRequest {
            status: status_code,
            message,
        },
        _ => CompletionError::Api {
            status: status_code,
            message,
        },
    }
}

/// Turn a transport error into a [`CompletionError`].
pub fn classify_transport_error(err: reqwest::Error) -> CompletionError {
    // The top-level message is rarely the useful part.
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    CompletionError::Network(message)
}
