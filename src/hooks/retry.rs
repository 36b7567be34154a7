//! Validate-and-retry loops.
//!
//! [`auto_retry`] drives a pending operation through
//! `validate -> steer -> retry` until it passes or attempts run out.
//! [`retry_with_steering`] is the generic facade-level protocol for
//! operations that validate raw LLM output.

use crate::errors::{Result, TractError};
use crate::hooks::pending::{OperationOutput, Pending, PendingKind};
use crate::hooks::validation::{HookRejection, RejectionSource, ValidationResult};

/// Outcome of an [`auto_retry`] run.
#[derive(Debug)]
pub enum RetryOutcome {
    Completed(OperationOutput),
    Rejected(HookRejection),
}

/// Validate a pending and retry failing items with the diagnosis as
/// steering guidance, up to `max_retries` attempts. Approves on success;
/// rejects (returning the structured rejection) on exhaustion.
pub fn auto_retry(mut pending: Pending, max_retries: usize) -> Result<RetryOutcome> {
    let mut last_diagnosis: Option<String> = None;

    for _attempt in 0..max_retries.max(1) {
        let validation = pending.validate()?;
        if validation.passed {
            let output = pending.approve()?;
            return Ok(RetryOutcome::Completed(output));
        }
        last_diagnosis = validation.diagnosis.clone();

        match &pending.kind {
            PendingKind::Compress(_) => {
                // Retry the failing summary; whole-plan failures steer the
                // first summary as a heuristic.
                let index = validation.index.unwrap_or(0);
                let guidance = validation.diagnosis.clone().unwrap_or_default();
                pending.retry_summary(index, &guidance)?;
            }
            PendingKind::Merge(_) => {
                let guidance = validation.diagnosis.clone().unwrap_or_default();
                pending.retry_resolutions(&guidance)?;
            }
            _ => break,
        }
    }

    let reason = last_diagnosis.unwrap_or_else(|| "validation failed after all retries".into());
    pending.reject(reason.clone())?;
    Ok(RetryOutcome::Rejected(HookRejection {
        reason,
        rejection_source: RejectionSource::Validation,
        metadata: Some(serde_json::json!({"max_retries": max_retries})),
        pending: Box::new(pending),
    }))
}

/// Result of a successful [`retry_with_steering`] run.
#[derive(Debug, Clone)]
pub struct RetryResult {
    pub value: String,
    pub attempts: usize,
    /// Whether retry artifacts were purged from history.
    pub purified: bool,
}

/// Run `attempt -> validate -> (steer -> retry)` up to `max_retries`
/// times.
///
/// `attempt` receives the steering guidance accumulated from failed
/// validations (`None` on the first try) and returns the candidate
/// output. On exhaustion, [`crate::errors::TractError::RetryExhausted`]
/// carries the last diagnosis and candidate.
pub fn retry_with_steering(
    mut attempt: impl FnMut(Option<&str>) -> Result<String>,
    validate: impl Fn(&str) -> ValidationResult,
    max_retries: usize,
) -> Result<RetryResult> {
    let mut guidance: Option<String> = None;
    let mut last_result: Option<String> = None;
    let attempts = max_retries.max(1);

    for attempt_index in 1..=attempts {
        let candidate = attempt(guidance.as_deref())?;
        let validation = validate(&candidate);
        if validation.passed {
            return Ok(RetryResult {
                value: candidate,
                attempts: attempt_index,
                purified: false,
            });
        }
        let diagnosis = validation
            .diagnosis
            .unwrap_or_else(|| "validation failed".into());
        guidance = Some(match guidance {
            Some(existing) => format!("{existing}\n{diagnosis}"),
            None => diagnosis,
        });
        last_result = Some(candidate);
    }

    Err(TractError::RetryExhausted {
        attempts,
        last_diagnosis: guidance.unwrap_or_default(),
        last_result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_with_steering_passes_diagnosis_forward() {
        let mut seen: Vec<Option<String>> = Vec::new();
        let result = retry_with_steering(
            |guidance| {
                seen.push(guidance.map(String::from));
                Ok(if guidance.is_some() { "good" } else { "bad" }.to_string())
            },
            |candidate| {
                if candidate == "good" {
                    ValidationResult::pass()
                } else {
                    ValidationResult::fail("must say good", None)
                }
            },
            3,
        )
        .unwrap();
        assert_eq!(result.value, "good");
        assert_eq!(result.attempts, 2);
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_deref(), Some("must say good"));
    }

    #[test]
    fn test_retry_exhaustion() {
        let error = retry_with_steering(
            |_| Ok("bad".to_string()),
            |_| ValidationResult::fail("never passes", None),
            2,
        )
        .unwrap_err();
        match error {
            TractError::RetryExhausted {
                attempts,
                last_result,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_result.as_deref(), Some("bad"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
