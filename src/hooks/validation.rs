//! Validation results and structured rejections.

use serde_json::Value;

/// Result of validating one item in a pending operation. Consumed by
/// `auto_retry` to drive the steer-and-retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub passed: bool,
    /// Human-readable explanation of the failure, when `!passed`.
    pub diagnosis: Option<String>,
    /// Index of the failing item (e.g. summary index), or `None` for a
    /// whole-operation failure.
    pub index: Option<usize>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnosis: None,
            index: None,
        }
    }

    pub fn fail(diagnosis: impl Into<String>, index: Option<usize>) -> Self {
        Self {
            passed: false,
            diagnosis: Some(diagnosis.into()),
            index,
        }
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed {
            return write!(f, "passed");
        }
        write!(f, "{}", self.diagnosis.as_deref().unwrap_or("failed"))?;
        if let Some(index) = self.index {
            write!(f, " (index {index})")?;
        }
        Ok(())
    }
}

/// Where a rejection originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionSource {
    /// A handler called `reject()`.
    Hook,
    /// A handler failed while running.
    Handler,
    /// A `validate()` check failed.
    Validation,
}

impl RejectionSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RejectionSource::Hook => "hook",
            RejectionSource::Handler => "handler",
            RejectionSource::Validation => "validation",
        }
    }
}

/// Structured rejection returned to callers instead of an error, so the
/// reason (and the rejected plan) can be inspected or fed back into a
/// policy.
#[derive(Debug)]
pub struct HookRejection {
    pub reason: String,
    pub rejection_source: RejectionSource,
    pub metadata: Option<Value>,
    /// The rejected pending, retained for inspection.
    pub pending: Box<crate::hooks::pending::Pending>,
}

impl std::fmt::Display for HookRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rejection_source.as_str(), self.reason)
    }
}
