//! Commit domain model.
//!
//! [`CommitInfo`] is the SDK-facing record returned when querying
//! commits; it mirrors the storage row but is used purely for data
//! transfer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::llm::LlmConfig;

/// The two commit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOperation {
    /// Adds new content to the chain.
    Append,
    /// Rewrites the compiled projection of an earlier append commit
    /// without removing it from history.
    Edit,
}

impl CommitOperation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CommitOperation::Append => "append",
            CommitOperation::Edit => "edit",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "append" => Ok(CommitOperation::Append),
            "edit" => Ok(CommitOperation::Edit),
            other => Err(TractError::Other(format!("invalid commit operation: {other}"))),
        }
    }
}

impl std::fmt::Display for CommitOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commit in the context DAG.
///
/// `parent_hash` is the first parent only; extra parents of merge commits
/// live in the parents table. `edit_target`, when set, names the append
/// commit this edit rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit_hash: String,
    pub tract_id: String,
    pub parent_hash: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub operation: CommitOperation,
    pub edit_target: Option<String>,
    pub message: Option<String>,
    pub token_count: usize,
    pub metadata: Option<Value>,
    pub generation_config: Option<LlmConfig>,
    pub created_at: DateTime<Utc>,
}

impl CommitInfo {
    /// Eight-character abbreviation of the commit hash.
    pub fn short_hash(&self) -> &str {
        &self.commit_hash[..self.commit_hash.len().min(8)]
    }

    pub fn is_edit(&self) -> bool {
        self.operation == CommitOperation::Edit
    }
}

impl std::fmt::Display for CommitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut msg = self.message.clone().unwrap_or_default();
        if msg.len() > 60 {
            msg.truncate(57);
            msg.push_str("...");
        }
        write!(f, "{} {}", self.short_hash(), msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(message: Option<&str>) -> CommitInfo {
        CommitInfo {
            commit_hash: "abcdef0123456789".repeat(4),
            tract_id: "t".into(),
            parent_hash: None,
            content_hash: "0".repeat(64),
            content_type: "dialogue".into(),
            operation: CommitOperation::Append,
            edit_target: None,
            message: message.map(String::from),
            token_count: 0,
            metadata: None,
            generation_config: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_display_truncates_message() {
        let c = commit(Some(&"x".repeat(80)));
        let rendered = c.to_string();
        assert!(rendered.starts_with("abcdef01 "));
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn test_operation_round_trip() {
        assert_eq!(CommitOperation::parse("append").unwrap(), CommitOperation::Append);
        assert_eq!(CommitOperation::parse("edit").unwrap(), CommitOperation::Edit);
        assert!(CommitOperation::parse("squash").is_err());
    }
}
