//! Per-page completion token budgets.
//!
//! Completion models share a fixed context window between the prompt and
//! the generated text. We don't ship a tokenizer, so we estimate prompt size
//! at roughly three characters per token, and give whatever is left to the
//! completion. Swapping in a real tokenizer only changes
//! [`estimate_tokens`].

/// Estimate how many tokens `text` will use.
///
/// This counts Unicode scalar values, not bytes, so non-ASCII text isn't
/// penalized by its UTF-8 encoding.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 3).unwrap_or(u32::MAX)
}

/// Compute the `max_tokens` value to request for a rendered `prompt`.
///
/// Never returns less than `min_budget`, even for prompts which would
/// overflow `context_window` on their own.
pub fn request_budget(prompt: &str, context_window: u32, min_budget: u32) -> u32 {
    context_window
        .saturating_sub(estimate_tokens(prompt))
        .max(min_budget)
}
