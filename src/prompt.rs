//! Summary prompts and the requests built from them.

use handlebars::{Handlebars, no_escape};
use serde_json::json;

use crate::{budget::request_budget, config::SummaryConfig, prelude::*};

/// The template name we register with Handlebars.
const TEMPLATE_NAME: &str = "summary";

/// Our default prompt. The audience is a lay reader.
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "Summarize the content you are given for a high school student. The text is {{text}}";

/// A compiled summary prompt.
///
/// The page text is bound to `text`. We turn off HTML escaping, because
/// the page needs to reach the model verbatim.
#[derive(Debug)]
pub struct PromptTemplate {
    handlebars: Handlebars<'static>,
}

impl PromptTemplate {
    /// Compile a template from a string.
    pub fn new(template: &str) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(no_escape);
        handlebars
            .register_template_string(TEMPLATE_NAME, template)
            .context("invalid prompt template")?;
        Ok(Self { handlebars })
    }

    /// Load and compile a template from a file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let template = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt template {:?}", path))?;
        Self::new(&template)
            .with_context(|| format!("Failed to compile prompt template {:?}", path))
    }

    /// Load the template at `path`, or our default.
    pub async fn from_optional_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path).await,
            None => Ok(Self::default()),
        }
    }

    /// Render the prompt for one page.
    pub fn render(&self, text: &str) -> Result<String> {
        self.handlebars
            .render(TEMPLATE_NAME, &json!({ "text": text }))
            .context("Error rendering prompt")
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_TEMPLATE).expect("built-in prompt should compile")
    }
}

/// One request to the summarization service.
///
/// The sampling parameters are fixed so that retries of the same page are
/// reproducible, apart from whatever nondeterminism the service adds.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryRequest {
    /// The 0-based index of the page we're summarizing.
    pub page_index: usize,

    /// The model to use.
    pub model: String,

    /// The rendered prompt, including the page text.
    pub prompt: String,

    /// The completion token budget. Always at least 1.
    pub max_tokens: u32,

    /// Sampling temperature.
    pub temperature: f32,

    /// Nucleus sampling cutoff. 1.0 disables it.
    pub top_p: f32,

    /// Frequency penalty.
    pub frequency_penalty: f32,

    /// Presence penalty.
    pub presence_penalty: f32,
}

impl SummaryRequest {
    /// Build the request for page `page_index`.
    pub fn build(
        page_index: usize,
        text: &str,
        template: &PromptTemplate,
        config: &SummaryConfig,
    ) -> Result<Self> {
        let prompt = template
            .render(text)
            .with_context(|| format!("Failed to build prompt for page {}", page_index + 1))?;
        // The template's own text shares the window with the page.
        let max_tokens = request_budget(&prompt, config.context_window, config.min_budget);
        Ok(Self {
            page_index,
            model: config.model.clone(),
            prompt,
            max_tokens,
            temperature: 0.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::estimate_tokens;

    #[test]
    fn test_default_prompt_embeds_text_verbatim() {
        let template = PromptTemplate::default();
        let text = "Tom & Jerry <b>\"quoted\"</b>";
        let prompt = template.render(text).unwrap();
        assert!(prompt.starts_with("Summarize the content you are given"));
        assert!(prompt.ends_with(text), "got {prompt:?}");
    }

    #[test]
    fn test_build_is_deterministic() {
        let template = PromptTemplate::default();
        let config = SummaryConfig::default();
        let text = "The mitochondria is the powerhouse of the cell.";
        let a = SummaryRequest::build(3, text, &template, &config).unwrap();
        let b = SummaryRequest::build(3, text, &template, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.page_index, 3);
        assert_eq!(a.temperature, 0.0);
        assert_eq!(a.top_p, 1.0);
        assert_eq!(a.frequency_penalty, 0.0);
        assert_eq!(a.presence_penalty, 0.0);
    }

    #[test]
    fn test_budget_is_based_on_rendered_prompt() {
        // 9 characters of template around the page text.
        let template = PromptTemplate::new("Summary: {{text}}").unwrap();
        let config = SummaryConfig {
            context_window: 1000,
            min_budget: 10,
            ..SummaryConfig::default()
        };
        let req = SummaryRequest::build(0, &"a".repeat(600), &template, &config).unwrap();
        assert_eq!(req.max_tokens, 1000 - 609 / 3);
        let req = SummaryRequest::build(0, &"a".repeat(6000), &template, &config).unwrap();
        assert_eq!(req.max_tokens, 10);
    }

    #[test]
    fn test_short_pages_fit_in_context_window() {
        let template = PromptTemplate::default();
        let config = SummaryConfig::default();
        for text in ["", " ", "\n\n", "Figure 1."] {
            let req = SummaryRequest::build(0, text, &template, &config).unwrap();
            let prompt_tokens = estimate_tokens(&req.prompt);
            assert!(prompt_tokens > 0);
            assert!(
                req.max_tokens + prompt_tokens <= config.context_window,
                "{text:?}: {} + {prompt_tokens} > {}",
                req.max_tokens,
                config.context_window,
            );
            assert!(req.max_tokens >= config.min_budget);
        }
    }

    #[test]
    fn test_custom_template() {
        let template = PromptTemplate::new("Explain simply:\n\n{{text}}\n\nDone.").unwrap();
        assert_eq!(
            template.render("a < b").unwrap(),
            "Explain simply:\n\na < b\n\nDone."
        );
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        assert!(PromptTemplate::new("{{#if text}}unclosed").is_err());
    }
}
