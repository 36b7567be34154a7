//! History views: status, log, edit history, message-level diff.

use crate::errors::Result;
use crate::internal::commit::CommitInfo;
use crate::internal::compiler::CompiledContext;
use crate::internal::dag::first_parent_chain;
use crate::llm::Message;
use crate::storage::Store;

/// Current tract status, as returned by `Tract::status()`.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub head_hash: Option<String>,
    /// Current branch, or `None` when HEAD is detached.
    pub branch_name: Option<String>,
    pub is_detached: bool,
    pub commit_count: usize,
    pub token_count: usize,
    pub token_budget_max: Option<usize>,
    pub token_source: String,
    /// Last three commits, newest first.
    pub recent_commits: Vec<CommitInfo>,
}

impl std::fmt::Display for StatusInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = self
            .head_hash
            .as_deref()
            .map(|h| &h[..8.min(h.len())])
            .unwrap_or("None");
        let branch = self.branch_name.as_deref().unwrap_or("detached");
        write!(
            f,
            "{branch} @ {head} | {} commits | {}",
            self.commit_count, self.token_count
        )?;
        if let Some(max) = self.token_budget_max {
            let pct = if max > 0 {
                self.token_count * 100 / max
            } else {
                0
            };
            write!(f, "/{max} ({pct}%)")?;
        }
        write!(f, " tokens")
    }
}

/// Commit log from a tip, newest first.
pub fn log(store: &Store, tip: &str, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
    let chain = first_parent_chain(store, tip)?;
    Ok(match limit {
        Some(n) => chain.into_iter().take(n).collect(),
        None => chain,
    })
}

/// All revisions of an append commit: the original followed by its edits
/// in chronological order.
pub fn edit_history(store: &Store, target: &str) -> Result<Vec<CommitInfo>> {
    let original = store.require_commit(target)?;
    let mut history = vec![original];
    history.extend(store.edits_of(target)?);
    Ok(history)
}

/// Message-level difference between two compiled contexts.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Messages present only in the newer context.
    pub added: Vec<Message>,
    /// Messages present only in the older context.
    pub removed: Vec<Message>,
    pub stat: DiffStat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStat {
    pub messages_added: usize,
    pub messages_removed: usize,
    pub token_delta: i64,
}

/// Diff two compiles by message identity `(role, content, name)`.
pub fn diff_contexts(older: &CompiledContext, newer: &CompiledContext) -> DiffResult {
    let key = |m: &Message| (m.role.clone(), m.content.clone(), m.name.clone());

    let mut old_counts: std::collections::HashMap<_, usize> = std::collections::HashMap::new();
    for message in &older.messages {
        *old_counts.entry(key(message)).or_default() += 1;
    }

    let mut added = Vec::new();
    for message in &newer.messages {
        let k = key(message);
        match old_counts.get_mut(&k) {
            Some(count) if *count > 0 => *count -= 1,
            _ => added.push(message.clone()),
        }
    }
    let mut removed = Vec::new();
    for (k, count) in old_counts {
        for _ in 0..count {
            removed.push(Message {
                role: k.0.clone(),
                content: k.1.clone(),
                name: k.2.clone(),
                tool_call_id: None,
                tool_calls: None,
            });
        }
    }

    DiffResult {
        stat: DiffStat {
            messages_added: added.len(),
            messages_removed: removed.len(),
            token_delta: newer.token_count as i64 - older.token_count as i64,
        },
        added,
        removed,
    }
}
