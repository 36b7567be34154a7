//! Priority annotations.
//!
//! Annotations are lightweight, mutable metadata attached to commits.
//! The annotation table is append-only for provenance; the latest row for
//! a target is its current priority.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TractError};

/// Priority levels for commit annotations.
///
/// Ordering: `Skip < Normal < Important < Pinned`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Excluded from compilation (but not from history).
    Skip,
    /// Ordinary compiled content.
    #[default]
    Normal,
    /// Compiled content whose retention patterns must survive compression.
    Important,
    /// Survives compression verbatim; acts as a grouping boundary.
    Pinned,
}

impl Priority {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Skip => "skip",
            Priority::Normal => "normal",
            Priority::Important => "important",
            Priority::Pinned => "pinned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(Priority::Skip),
            "normal" => Ok(Priority::Normal),
            "important" => Ok(Priority::Important),
            "pinned" => Ok(Priority::Pinned),
            other => Err(TractError::Other(format!("invalid priority: {other}"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How retention `match_patterns` are checked against summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Substring,
    Regex,
}

/// Retention criteria for `important` commits.
///
/// `instructions` is natural-language guidance injected into the
/// summarization prompt; `match_patterns` are checked deterministically
/// against every produced summary after summarization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub match_mode: MatchMode,
}

impl RetentionCriteria {
    pub fn with_patterns(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            match_patterns: Some(patterns.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Check whether `text` satisfies a single pattern under this mode.
    pub fn pattern_matches(&self, pattern: &str, text: &str) -> Result<bool> {
        match self.match_mode {
            MatchMode::Substring => Ok(text.contains(pattern)),
            MatchMode::Regex => {
                let re = Regex::new(pattern).map_err(|e| {
                    TractError::Compression(format!("invalid retention regex `{pattern}`: {e}"))
                })?;
                Ok(re.is_match(text))
            }
        }
    }
}

/// One row of the append-only annotation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityAnnotation {
    pub id: Option<i64>,
    pub tract_id: String,
    pub target_hash: String,
    pub priority: Priority,
    pub reason: Option<String>,
    pub retention: Option<RetentionCriteria>,
    pub created_at: DateTime<Utc>,
}

/// Per-priority commit tallies for a tract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationCounts {
    pub pinned: usize,
    pub important: usize,
    pub normal: usize,
    pub skip: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Skip < Priority::Normal);
        assert!(Priority::Normal < Priority::Important);
        assert!(Priority::Important < Priority::Pinned);
    }

    #[test]
    fn test_priority_round_trip() {
        for p in [
            Priority::Skip,
            Priority::Normal,
            Priority::Important,
            Priority::Pinned,
        ] {
            assert_eq!(Priority::parse(p.as_str()).unwrap(), p);
        }
        assert!(Priority::parse("urgent").is_err());
    }

    #[test]
    fn test_substring_and_regex_matching() {
        let substring = RetentionCriteria::with_patterns(["42 widgets"]);
        assert!(substring.pattern_matches("42 widgets", "we have 42 widgets").unwrap());
        assert!(!substring.pattern_matches("42 widgets", "we have 41").unwrap());

        let regex = RetentionCriteria {
            match_patterns: Some(vec![r"\d+ widgets".to_string()]),
            match_mode: MatchMode::Regex,
            ..Default::default()
        };
        assert!(regex.pattern_matches(r"\d+ widgets", "we have 42 widgets").unwrap());
        assert!(regex.pattern_matches("[invalid", "anything").is_err());
    }
}
