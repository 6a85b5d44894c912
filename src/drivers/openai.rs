//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use std::time::Duration;

use async_openai::{
    config::{Config as _, OpenAIConfig},
    types::{
        CompletionFinishReason, CreateCompletionRequest, CreateCompletionRequestArgs,
        CreateCompletionResponse,
    },
};
use reqwest::{StatusCode, header::HeaderMap};

use crate::{
    error::CompletionError,
    llm_client::{
        classify_error_response, classify_transport_error, create_http_client,
        create_openai_config, parse_retry_after,
    },
    prelude::*,
    prompt::SummaryRequest,
    retry::{IntoRetryResult as _, retry_result_fatal, retry_result_ok, try_with_retry_result},
};

use super::{Completion, CompletionResult, Driver, LlmOpts, TokenUsage, apply_timeout};

/// Calls the legacy `/completions` endpoint.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// API key, base URL and headers.
    config: OpenAIConfig,

    /// Our shared connection pool.
    http: reqwest::Client,

    /// Per-request timeout.
    timeout: Option<Duration>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver.
    pub fn new(llm_opts: &LlmOpts) -> Result<Self> {
        Ok(Self {
            config: create_openai_config()?,
            http: create_http_client()?,
            timeout: llm_opts.timeout(),
        })
    }

    /// Send one request, without any retrying, and return the raw response.
    async fn send(&self, req: &CreateCompletionRequest) -> Result<RawResponse, CompletionError> {
        let response = self
            .http
            .post(self.config.url("/completions"))
            .query(&self.config.query())
            .headers(self.config.headers())
            .json(req)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify_transport_error)?;
        Ok(RawResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// An HTTP response we haven't looked at yet.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Turn an HTTP response into a [`CompletionResult`]. Rate limits are
/// transient, and everything else that went wrong is fatal.
fn parse_response(request: &SummaryRequest, raw: &RawResponse) -> CompletionResult {
    if !raw.status.is_success() {
        let err = classify_error_response(
            raw.status,
            parse_retry_after(&raw.headers),
            &String::from_utf8_lossy(&raw.body),
        );
        return Err::<Completion, _>(err).into_retry_result();
    }

    let response = try_with_retry_result!(
        serde_json::from_slice::<CreateCompletionResponse>(&raw.body)
            .map_err(|err| {
                CompletionError::MalformedResponse(format!(
                    "{err}: {}",
                    String::from_utf8_lossy(&raw.body)
                ))
            })
            .into_fatal()
    );
    debug!(?response, "OpenAI response");

    // How many tokens did we use?
    let token_usage = response.usage.as_ref().map(|usage| TokenUsage {
        prompt_tokens: u64::from(usage.prompt_tokens),
        completion_tokens: u64::from(usage.completion_tokens),
    });

    let Some(choice) = response.choices.into_iter().next() else {
        return retry_result_fatal(CompletionError::MalformedResponse(
            "no choices in response".to_owned(),
        ));
    };
    match choice.finish_reason {
        Some(CompletionFinishReason::ContentFilter) => {
            return retry_result_fatal(CompletionError::BadRequest {
                status: 200,
                message: "content filter triggered".to_owned(),
            });
        }
        Some(CompletionFinishReason::Length) => {
            warn!(
                max_tokens = request.max_tokens,
                "Summary of page {} was cut off at the token limit",
                request.page_index + 1
            );
        }
        _ => {}
    }

    retry_result_ok(Completion {
        text: choice.text,
        token_usage,
    })
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(page = request.page_index + 1))]
    async fn complete(&self, request: &SummaryRequest) -> CompletionResult {
        let req = try_with_retry_result!(
            CreateCompletionRequestArgs::default()
                .model(request.model.clone())
                .prompt(request.prompt.clone())
                .max_tokens(request.max_tokens)
                .temperature(request.temperature)
                .top_p(request.top_p)
                .frequency_penalty(request.frequency_penalty)
                .presence_penalty(request.presence_penalty)
                .build()
                .map_err(|err| CompletionError::InvalidRequest(err.to_string()))
                .into_fatal()
        );
        trace!(?req, "Request");

        let raw = try_with_retry_result!(
            apply_timeout(self.timeout, self.send(&req))
                .await
                .into_retry_result()
        );
        parse_response(request, &raw)
    }
}

#[cfg(test)]
mod tests {
    use keen_retry::RetryResult;
    use reqwest::header::{HeaderValue, RETRY_AFTER};

    use super::*;

    fn request() -> SummaryRequest {
        SummaryRequest {
            page_index: 4,
            model: "gpt-3.5-turbo-instruct".to_owned(),
            prompt: "Summarize: text".to_owned(),
            max_tokens: 100,
            temperature: 0.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }

    fn raw(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn completion_body(choices: &str) -> String {
        format!(
            r#"{{
                "id": "cmpl-1",
                "object": "text_completion",
                "created": 1700000000,
                "model": "gpt-3.5-turbo-instruct",
                "choices": {choices},
                "usage": {{"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}}
            }}"#
        )
    }

    fn expect_fatal(result: CompletionResult) -> CompletionError {
        match result {
            RetryResult::Fatal { error, .. } => error,
            RetryResult::Transient { error, .. } => panic!("expected fatal, got {error}"),
            RetryResult::Ok { .. } => panic!("expected fatal, got a completion"),
        }
    }

    #[test]
    fn test_success() {
        let body = completion_body(
            r#"[{"text": " A short summary.", "index": 0, "logprobs": null, "finish_reason": "stop"}]"#,
        );
        match parse_response(&request(), &raw(200, &body)) {
            RetryResult::Ok { output, .. } => {
                assert_eq!(output.text, " A short summary.");
                let usage = output.token_usage.unwrap();
                assert_eq!(usage.prompt_tokens, 12);
                assert_eq!(usage.completion_tokens, 7);
            }
            RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                panic!("unexpected error: {error}")
            }
        }
    }

    #[test]
    fn test_cut_off_summary_is_still_a_success() {
        let body = completion_body(
            r#"[{"text": "A summary that", "index": 0, "logprobs": null, "finish_reason": "length"}]"#,
        );
        assert!(matches!(
            parse_response(&request(), &raw(200, &body)),
            RetryResult::Ok { .. }
        ));
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let mut response = raw(
            429,
            r#"{"error": {"message": "Rate limit reached", "type": "requests", "param": null, "code": "rate_limit_exceeded"}}"#,
        );
        response
            .headers
            .insert(RETRY_AFTER, HeaderValue::from_static("2"));
        match parse_response(&request(), &response) {
            RetryResult::Transient {
                error: CompletionError::RateLimited { retry_after, .. },
                ..
            } => assert_eq!(retry_after, Some(Duration::from_secs(2))),
            RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                panic!("unexpected error: {error}")
            }
            RetryResult::Ok { .. } => panic!("expected a rate limit"),
        }
    }

    #[test]
    fn test_quota_exhaustion_is_fatal() {
        let response = raw(
            429,
            r#"{"error": {"message": "You exceeded your current quota", "type": "insufficient_quota", "param": null, "code": "insufficient_quota"}}"#,
        );
        let err = expect_fatal(parse_response(&request(), &response));
        assert!(matches!(err, CompletionError::Api { status: 429, .. }), "got {err}");
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let response = raw(
            401,
            r#"{"error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "param": null, "code": "invalid_api_key"}}"#,
        );
        let err = expect_fatal(parse_response(&request(), &response));
        assert!(matches!(err, CompletionError::Auth { status: 401, .. }), "got {err}");
    }

    #[test]
    fn test_server_error_is_fatal() {
        let err = expect_fatal(parse_response(&request(), &raw(502, "")));
        assert!(matches!(err, CompletionError::Api { status: 502, .. }), "got {err}");
    }

    #[test]
    fn test_empty_choices_are_malformed() {
        let err = expect_fatal(parse_response(&request(), &raw(200, &completion_body("[]"))));
        assert!(matches!(err, CompletionError::MalformedResponse(_)), "got {err}");
    }

    #[test]
    fn test_unparseable_body_is_malformed() {
        let err = expect_fatal(parse_response(&request(), &raw(200, "<html>oops</html>")));
        match err {
            CompletionError::MalformedResponse(detail) => assert!(detail.contains("<html>")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_content_filter_is_fatal() {
        let body = completion_body(
            r#"[{"text": "", "index": 0, "logprobs": null, "finish_reason": "content_filter"}]"#,
        );
        let err = expect_fatal(parse_response(&request(), &raw(200, &body)));
        assert!(
            matches!(err, CompletionError::BadRequest { status: 200, .. }),
            "got {err}"
        );
    }
}
