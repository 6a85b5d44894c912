//! Echo driver for testing.
//!
//! This driver "summarizes" a page by returning the rendered prompt. It never
//! fails, and reports zero token usage.

use crate::{prelude::*, prompt::SummaryRequest, retry::retry_result_ok};

use super::{Completion, CompletionResult, Driver, TokenUsage};

/// Echo driver for testing.
#[derive(Debug)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn complete(&self, request: &SummaryRequest) -> CompletionResult {
        retry_result_ok(Completion {
            text: request.prompt.clone(),
            token_usage: Some(TokenUsage::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use keen_retry::RetryResult;

    use super::*;
    use crate::{config::SummaryConfig, prompt::PromptTemplate};

    #[tokio::test]
    async fn test_echoes_prompt() {
        let template = PromptTemplate::new("Summarize: {{text}}").unwrap();
        let request =
            SummaryRequest::build(0, "hello", &template, &SummaryConfig::default())
                .unwrap();
        match EchoDriver::new().complete(&request).await {
            RetryResult::Ok { output, .. } => {
                assert_eq!(output.text, "Summarize: hello");
                assert!(output.token_usage.unwrap().is_zero());
            }
            _ => panic!("echo driver should always succeed"),
        }
    }
}
