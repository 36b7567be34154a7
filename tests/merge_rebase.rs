//! Conflicted merges, rebase replay and single-commit import.

mod common;

use tract::{
    ConflictKind, Content, DialogueRole, HookOutcome, MergeType, PendingStatus, ToolIoRole,
};

use common::tract;

fn edit_text(t: &tract::Tract, target: &str, text: &str) {
    t.edit(target, Content::Dialogue {
        role: DialogueRole::Assistant,
        text: text.into(),
        name: None,
    })
    .unwrap();
}

#[test]
fn test_both_edit_conflict_and_resolution() {
    let t = tract();
    t.system("sys").unwrap();
    let base = t.assistant("base text").unwrap();

    t.branch("b").unwrap();
    edit_text(&t, &base.commit_hash, "A");

    t.switch("main").unwrap();
    edit_text(&t, &base.commit_hash, "B");

    let mut pending = t.merge_review("b", false).unwrap();
    {
        let merge = pending.as_merge().unwrap();
        assert_eq!(merge.plan.conflicts.len(), 1);
        let conflict = &merge.plan.conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictKind::BothEdit);
        assert_eq!(conflict.target_hash, base.commit_hash);
        assert_eq!(conflict.content_a_text, "B");
        assert_eq!(conflict.content_b_text, "A");
        assert_eq!(conflict.ancestor_content_text.as_deref(), Some("base text"));
    }

    // Approval without resolutions must fail and leave the pending open.
    assert!(pending.validate().unwrap().passed == false);
    assert!(pending.approve().is_err());

    pending.set_resolution(&base.commit_hash, "A and B").unwrap();
    assert!(pending.validate().unwrap().passed);
    let result = pending.approve().unwrap().into_merge().unwrap();
    assert_eq!(result.merge_type, MergeType::Conflict);
    assert_eq!(result.resolved_conflicts, vec![base.commit_hash.clone()]);
    assert_eq!(pending.status, PendingStatus::Approved);

    // The compiled projection carries the resolution at the base's slot.
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].content, "A and B");
}

#[test]
fn test_clean_merge_replays_source_commits() {
    let t = tract();
    t.system("sys").unwrap();
    t.branch("side").unwrap();
    t.user("from side").unwrap();
    t.switch("main").unwrap();
    t.user("from main").unwrap();

    let HookOutcome::Completed(result) = t.merge("side", false).unwrap() else {
        panic!("expected completed merge");
    };
    assert_eq!(result.merge_type, MergeType::Clean);
    assert_eq!(result.replayed.len(), 1);
    assert!(result.merge_commit.is_some());

    // Merge marker is skip-annotated: four commits of content, three
    // compiled messages plus the replayed one.
    let context = t.compile().unwrap();
    let contents: Vec<&str> = context
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["sys", "from main", "from side"]);
}

#[test]
fn test_rebase_changes_commit_hashes_not_content_hashes() {
    let t = tract();
    t.user("c1").unwrap();
    t.branch("feature").unwrap();
    let f1 = t.user("f1").unwrap();
    let f2 = t.assistant("f2").unwrap();
    t.switch("main").unwrap();
    t.user("m1").unwrap();
    t.switch("feature").unwrap();

    let HookOutcome::Completed(result) = t.rebase("main").unwrap() else {
        panic!("expected completed rebase");
    };
    assert_eq!(result.replayed.len(), 2);
    for ((old_hash, new_hash), original) in result.replayed.iter().zip([&f1, &f2]) {
        assert_eq!(old_hash, &original.commit_hash);
        assert_ne!(old_hash, new_hash);
        let replayed = t.get_commit(new_hash).unwrap();
        assert_eq!(replayed.content_hash, original.content_hash);
    }

    // The branch follows the rebase and the chain now includes main's tip.
    let contents: Vec<String> = t
        .compile()
        .unwrap()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["c1", "m1", "f1", "f2"]);
}

#[test]
fn test_rebase_exclude_drops_commit() {
    let t = tract();
    t.user("c1").unwrap();
    t.branch("feature").unwrap();
    let f1 = t.user("f1").unwrap();
    t.assistant("f2").unwrap();
    t.switch("main").unwrap();
    t.user("m1").unwrap();
    t.switch("feature").unwrap();

    let mut pending = t.rebase_review("main").unwrap();
    pending.exclude(&f1.commit_hash).unwrap();
    let result = pending.approve().unwrap().into_rebase().unwrap();

    assert_eq!(result.replayed.len(), 1);
    assert_eq!(result.skipped, vec![f1.commit_hash.clone()]);
    assert!(result.warnings.iter().any(|w| w.warning_type == "excluded"));

    let contents: Vec<String> = t
        .compile()
        .unwrap()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["c1", "m1", "f2"]);
}

#[test]
fn test_import_commit_copies_blob_with_new_parent() {
    let t = tract();
    t.user("main work").unwrap();
    t.branch("side").unwrap();
    let side_commit = t.assistant("cherry").unwrap();
    t.switch("main").unwrap();

    let result = t.import_commit(&side_commit.commit_hash).unwrap();
    assert_ne!(result.new_commit.commit_hash, side_commit.commit_hash);
    assert_eq!(result.new_commit.content_hash, side_commit.content_hash);
    assert!(result.issues.is_empty());

    let contents: Vec<String> = t
        .compile()
        .unwrap()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["main work", "cherry"]);
}

#[test]
fn test_import_tool_result_without_call_warns() {
    let t = tract();
    t.user("main").unwrap();
    t.branch("side").unwrap();
    t.tool_call("call_1", "search", serde_json::json!({"q": "x"}))
        .unwrap();
    let result_commit = match t.tool_result("call_1", "search", "3 hits").unwrap() {
        HookOutcome::Completed(commit) => commit,
        _ => panic!("expected completed tool result"),
    };
    t.switch("main").unwrap();

    let imported = t.import_commit(&result_commit.commit_hash).unwrap();
    assert!(
        imported
            .issues
            .iter()
            .any(|i| i.issue_type == "result_without_call")
    );
}

#[test]
fn test_tool_chain_projection() {
    let t = tract();
    t.user("look this up").unwrap();
    t.tool_call("call_9", "search", serde_json::json!({"q": "rust"}))
        .unwrap();
    t.tool_result("call_9", "search", "found docs").unwrap();

    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 3);
    let call = &context.messages[1];
    assert_eq!(call.role, "assistant");
    assert!(call.tool_calls.is_some());
    let result = &context.messages[2];
    assert_eq!(result.role, "tool");
    assert_eq!(result.tool_call_id.as_deref(), Some("call_9"));
    assert!(context.warnings.is_empty());

    // Sanity: the stored payload is a typed tool result.
    let content = t.get_content(&context.commit_hashes[2]).unwrap();
    assert!(matches!(
        content,
        Content::ToolIo {
            role: ToolIoRole::ToolResult,
            ..
        }
    ));
}
