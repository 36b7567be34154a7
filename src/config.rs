//! Per-tract configuration: default branch, compile cache sizing, token
//! budget enforcement and LLM parameter defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::llm::LlmConfig;

/// Action taken when a commit pushes the compiled context past the
/// configured token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetAction {
    /// Log a warning and proceed.
    #[default]
    Warn,
    /// Fail the commit with `BudgetExceeded`.
    Reject,
    /// Invoke the user callback with `(current, max)` and proceed.
    Callback,
}

/// Token budget enforcement for the commit engine.
#[derive(Clone, Default)]
pub struct TokenBudget {
    pub max_tokens: Option<usize>,
    pub action: BudgetAction,
    pub callback: Option<Rc<dyn Fn(usize, usize)>>,
}

impl TokenBudget {
    pub fn warn(max_tokens: usize) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            action: BudgetAction::Warn,
            callback: None,
        }
    }

    pub fn reject(max_tokens: usize) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            action: BudgetAction::Reject,
            callback: None,
        }
    }

    pub fn with_callback(max_tokens: usize, callback: impl Fn(usize, usize) + 'static) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            action: BudgetAction::Callback,
            callback: Some(Rc::new(callback)),
        }
    }
}

impl fmt::Debug for TokenBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBudget")
            .field("max_tokens", &self.max_tokens)
            .field("action", &self.action)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Per-tract configuration.
#[derive(Debug, Clone)]
pub struct TractConfig {
    /// Name of the default branch created on first commit.
    pub default_branch: String,
    /// Maximum entries held by the in-memory compile cache.
    pub compile_cache_size: usize,
    /// Optional token budget checked on every commit.
    pub token_budget: Option<TokenBudget>,
    /// Tract-level LLM parameter defaults (bottom of the resolution chain).
    pub llm_defaults: LlmConfig,
    /// Per-operation LLM overrides, keyed by operation name
    /// (`compress`, `merge`, ...).
    pub operation_configs: BTreeMap<String, LlmConfig>,
    /// Default retention window, in days, for orphaned commits during gc.
    pub orphan_retention_days: u32,
    /// Default retention window, in days, for commits archived by a
    /// compression event.
    pub archive_retention_days: u32,
}

impl Default for TractConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            compile_cache_size: 8,
            token_budget: None,
            llm_defaults: LlmConfig::default(),
            operation_configs: BTreeMap::new(),
            orphan_retention_days: 14,
            archive_retention_days: 30,
        }
    }
}
