//! Pluggable LLM client interface.
//!
//! The core does not own HTTP. Hosts inject any type implementing
//! [`LlmClient`]; the engine only ever sees the chat-completion
//! request/response shapes below. Retries with exponential backoff on
//! 429/5xx are the client's responsibility, not the core's.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single message in a compiled context or chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls attached to an assistant message, in wire form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Token usage reported by an LLM API response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// One completion choice in a chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Response shape every [`LlmClient`] must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatResponse {
    /// Content of the first choice, or an error if the response is empty.
    pub fn first_content(&self) -> Result<&str, LlmError> {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LlmError::Response("response contained no choices".into()))
    }
}

/// Errors an [`LlmClient`] may surface.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Client constructed or called with invalid configuration.
    #[error("LLM configuration error: {0}")]
    Config(String),

    /// Authentication or authorization failure.
    #[error("LLM authentication failed: {0}")]
    Auth(String),

    /// Rate limited by the provider.
    #[error("LLM rate limited{}", retry_after.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimit { retry_after: Option<u64> },

    /// Response could not be parsed into the expected shape.
    #[error("Malformed LLM response: {0}")]
    Response(String),

    /// Any other client-side failure (transport, timeout, ...).
    #[error("LLM client error: {0}")]
    Client(String),
}

/// Resolved generation parameters for one chat call.
///
/// Every field is optional; `None` means "inherit from the next config in
/// the resolution chain" (per-call sugar > explicit config > per-operation
/// config > tract default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Provider-specific passthrough parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Keys accepted by [`LlmConfig::from_value`] that belong to API plumbing
/// rather than generation parameters; they are silently dropped.
const PLUMBING_KEYS: &[&str] = &["messages", "tools", "tool_choice", "stream", "n", "user"];

impl LlmConfig {
    /// Build a config from a loose JSON object, accepting cross-framework
    /// aliases (`max_completion_tokens` for `max_tokens`, `stop` for
    /// `stop_sequences`) and ignoring API plumbing keys.
    pub fn from_value(value: &Value) -> Self {
        let mut config = Self::default();
        let Some(map) = value.as_object() else {
            return config;
        };
        for (key, v) in map {
            match key.as_str() {
                "model" => config.model = v.as_str().map(String::from),
                "temperature" => config.temperature = v.as_f64(),
                "max_tokens" | "max_completion_tokens" => {
                    config.max_tokens = v.as_u64().map(|n| n as u32);
                }
                "top_p" => config.top_p = v.as_f64(),
                "stop" | "stop_sequences" => {
                    config.stop_sequences = match v {
                        Value::String(s) => Some(vec![s.clone()]),
                        Value::Array(items) => Some(
                            items
                                .iter()
                                .filter_map(|i| i.as_str().map(String::from))
                                .collect(),
                        ),
                        _ => None,
                    };
                }
                "seed" => config.seed = v.as_u64(),
                k if PLUMBING_KEYS.contains(&k) => {}
                other => {
                    config.extra.insert(other.to_string(), v.clone());
                }
            }
        }
        config
    }

    /// Merge `self` over `base`: every `None` field inherits from `base`,
    /// `extra` maps are unioned with `self` winning on key collisions.
    pub fn merged_over(&self, base: &LlmConfig) -> LlmConfig {
        let mut extra = base.extra.clone();
        extra.extend(self.extra.clone());
        LlmConfig {
            model: self.model.clone().or_else(|| base.model.clone()),
            temperature: self.temperature.or(base.temperature),
            max_tokens: self.max_tokens.or(base.max_tokens),
            top_p: self.top_p.or(base.top_p),
            stop_sequences: self
                .stop_sequences
                .clone()
                .or_else(|| base.stop_sequences.clone()),
            seed: self.seed.or(base.seed),
            extra,
        }
    }

    /// Fold a resolution chain (most specific first) into one config.
    ///
    /// Returns the resolved config and a field -> source-label map for
    /// provenance, where the label names the chain entry that supplied the
    /// field.
    pub fn resolve<'a>(
        chain: impl IntoIterator<Item = (&'a str, &'a LlmConfig)>,
    ) -> (LlmConfig, BTreeMap<String, String>) {
        let mut resolved = LlmConfig::default();
        let mut sources: BTreeMap<String, String> = BTreeMap::new();
        for (label, config) in chain {
            let mut note = |field: &str, present: bool| {
                if present && !sources.contains_key(field) {
                    sources.insert(field.to_string(), label.to_string());
                }
            };
            note("model", config.model.is_some());
            note("temperature", config.temperature.is_some());
            note("max_tokens", config.max_tokens.is_some());
            note("top_p", config.top_p.is_some());
            note("stop_sequences", config.stop_sequences.is_some());
            note("seed", config.seed.is_some());
            for key in config.extra.keys() {
                let field = format!("extra.{key}");
                sources.entry(field).or_insert_with(|| label.to_string());
            }
            resolved = resolved.merged_over(config);
        }
        (resolved, sources)
    }
}

/// Chat request handed to an injected client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub config: LlmConfig,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            config: LlmConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }
}

/// Pluggable chat-completion client.
///
/// Any host object with a `chat` producing the shapes above works. The
/// engine issues calls synchronously from the caller's thread during hook
/// approval.
pub trait LlmClient {
    fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Release underlying resources. Default is a no-op.
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_aliases() {
        let config = LlmConfig::from_value(&json!({
            "model": "gpt-4o",
            "max_completion_tokens": 256,
            "stop": "END",
            "messages": [{"role": "user"}],
            "custom_knob": true,
        }));
        assert_eq!(config.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.max_tokens, Some(256));
        assert_eq!(config.stop_sequences, Some(vec!["END".to_string()]));
        assert!(!config.extra.contains_key("messages"));
        assert_eq!(config.extra["custom_knob"], json!(true));
    }

    #[test]
    fn test_resolution_chain_most_specific_wins() {
        let per_call = LlmConfig {
            temperature: Some(0.2),
            ..Default::default()
        };
        let operation = LlmConfig {
            model: Some("small".into()),
            temperature: Some(0.9),
            ..Default::default()
        };
        let default = LlmConfig {
            model: Some("large".into()),
            max_tokens: Some(1024),
            ..Default::default()
        };
        let (resolved, sources) = LlmConfig::resolve([
            ("per_call", &per_call),
            ("operation", &operation),
            ("default", &default),
        ]);
        assert_eq!(resolved.temperature, Some(0.2));
        assert_eq!(resolved.model.as_deref(), Some("small"));
        assert_eq!(resolved.max_tokens, Some(1024));
        assert_eq!(sources["temperature"], "per_call");
        assert_eq!(sources["model"], "operation");
        assert_eq!(sources["max_tokens"], "default");
    }
}
