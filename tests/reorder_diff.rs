//! Explicit output ordering with reorder warnings, and message diffs.

mod common;

use tract::{CompileOptions, WarningSeverity};

use common::tract;

#[test]
fn test_order_permutes_compiled_messages() {
    let t = tract();
    let a = t.user("first").unwrap();
    let b = t.assistant("second").unwrap();
    let c = t.user("third").unwrap();

    let context = t
        .compile_with(CompileOptions {
            order: Some(vec![
                c.commit_hash.clone(),
                a.commit_hash.clone(),
                b.commit_hash.clone(),
            ]),
            ..Default::default()
        })
        .unwrap();
    let contents: Vec<&str> = context
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["third", "first", "second"]);
}

#[test]
fn test_unknown_commit_in_order_warns_structural() {
    let t = tract();
    t.user("only message").unwrap();

    let context = t
        .compile_with(CompileOptions {
            order: Some(vec!["f".repeat(64)]),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(context.messages.len(), 1);
    assert!(
        context
            .warnings
            .iter()
            .any(|w| w.warning_type == "unknown_commit"
                && w.severity == WarningSeverity::Structural)
    );
}

#[test]
fn test_result_before_call_warns_semantic() {
    let t = tract();
    t.user("look it up").unwrap();
    let call = t
        .tool_call("call_5", "search", serde_json::json!({"q": "x"}))
        .unwrap();
    let result = match t.tool_result("call_5", "search", "hits").unwrap() {
        tract::HookOutcome::Completed(commit) => commit,
        _ => panic!("expected committed tool result"),
    };

    let context = t
        .compile_with(CompileOptions {
            order: Some(vec![result.commit_hash.clone(), call.commit_hash.clone()]),
            ..Default::default()
        })
        .unwrap();
    assert!(
        context
            .warnings
            .iter()
            .any(|w| w.warning_type == "broken_tool_chain"
                && w.severity == WarningSeverity::Semantic)
    );
}

#[test]
fn test_diff_between_refs() {
    let t = tract();
    t.system("sys").unwrap();
    let old_head = t.user("question").unwrap();
    t.assistant("answer").unwrap();
    let new_head = t.user("follow-up").unwrap();

    let diff = t
        .diff(&old_head.commit_hash, &new_head.commit_hash)
        .unwrap();
    assert_eq!(diff.stat.messages_added, 2);
    assert_eq!(diff.stat.messages_removed, 0);
    let added: Vec<&str> = diff.added.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(added, vec!["answer", "follow-up"]);
}
