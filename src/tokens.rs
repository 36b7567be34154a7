//! Token counting behind a pluggable interface.
//!
//! [`TiktokenCounter`] is the production implementation; it resolves a
//! BPE from a model name and falls back to `o200k_base` for unknown
//! models. [`NullTokenCounter`] always returns 0 and exists for tests
//! where counts are irrelevant.

use tiktoken_rs::{CoreBPE, get_bpe_from_model, o200k_base};

use crate::llm::Message;

/// Pluggable token counting.
pub trait TokenCounter {
    /// Tokens for a plain text string. Empty string counts 0.
    fn count_text(&self, text: &str) -> usize;

    /// Tokens for a structured message list, including per-message and
    /// response-primer overhead. Empty list counts 0.
    fn count_messages(&self, messages: &[Message]) -> usize;

    /// Identity string recorded in compile metadata for provenance,
    /// e.g. `tiktoken:o200k_base` or `null`.
    fn source(&self) -> String;
}

/// Token counter backed by tiktoken.
pub struct TiktokenCounter {
    bpe: CoreBPE,
    encoding_name: String,
}

impl TiktokenCounter {
    /// Resolve the BPE for `model`; unknown models fall back to
    /// `o200k_base`.
    pub fn for_model(model: &str) -> Self {
        match get_bpe_from_model(model) {
            Ok(bpe) => Self {
                bpe,
                // tiktoken-rs does not expose the resolved encoding name,
                // so record the model it was resolved from.
                encoding_name: format!("model:{model}"),
            },
            Err(_) => Self::default(),
        }
    }

    /// The `o200k_base` encoding.
    pub fn o200k() -> Self {
        Self::default()
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self {
            bpe: o200k_base().expect("bundled o200k_base tables load"),
            encoding_name: "o200k_base".to_string(),
        }
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let mut total = 0;
        for message in messages {
            // 3 tokens of per-message overhead (role/content separators),
            // per the OpenAI cookbook formula.
            total += 3;
            total += self.count_text(&message.role);
            total += self.count_text(&message.content);
            if let Some(name) = &message.name {
                total += self.count_text(name) + 1;
            }
            if let Some(id) = &message.tool_call_id {
                total += self.count_text(id);
            }
        }
        total + 3 // response primer
    }

    fn source(&self) -> String {
        format!("tiktoken:{}", self.encoding_name)
    }
}

/// Token counter that always returns 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTokenCounter;

impl TokenCounter for NullTokenCounter {
    fn count_text(&self, _text: &str) -> usize {
        0
    }

    fn count_messages(&self, _messages: &[Message]) -> usize {
        0
    }

    fn source(&self) -> String {
        "null".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_counts_zero() {
        let counter = TiktokenCounter::o200k();
        assert_eq!(counter.count_text(""), 0);
        assert!(counter.count_text("hello world") > 0);
    }

    #[test]
    fn test_empty_message_list_counts_zero() {
        let counter = TiktokenCounter::o200k();
        assert_eq!(counter.count_messages(&[]), 0);
    }

    #[test]
    fn test_message_overhead_formula() {
        let counter = TiktokenCounter::o200k();
        let plain = vec![Message::new("user", "Hi")];
        let named = vec![Message::new("user", "Hi").with_name("alice")];
        let base = counter.count_messages(&plain);
        // 3 per-message + role + content + 3 primer.
        assert_eq!(
            base,
            3 + counter.count_text("user") + counter.count_text("Hi") + 3
        );
        // A name costs its tokens plus one.
        assert_eq!(
            counter.count_messages(&named),
            base + counter.count_text("alice") + 1
        );
    }

    #[test]
    fn test_null_counter() {
        let counter = NullTokenCounter;
        assert_eq!(counter.count_text("anything at all"), 0);
        assert_eq!(counter.count_messages(&[Message::new("user", "x")]), 0);
        assert_eq!(counter.source(), "null");
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let counter = TiktokenCounter::for_model("definitely-not-a-model");
        assert_eq!(counter.source(), "tiktoken:o200k_base");
    }
}
