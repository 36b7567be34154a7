//! Flows that exercise the injected LLM client: chat, tool-result
//! middleware, policy/trigger proposals and the auto-retry loop.

mod common;

use serde_json::json;
use tract::{HookOutcome, Pending, Priority, RetentionCriteria, RetryOutcome, TractError};

use common::{MockLlm, tract, tract_with_llm};

#[test]
fn test_chat_commits_prompt_and_reply() {
    let t = tract();
    let llm = MockLlm::new("Hello from the model.");
    let requests = llm.requests.clone();
    t.set_llm_client(Box::new(llm));

    t.system("You are terse.").unwrap();
    let reply = t.chat("Say hi").unwrap();

    assert_eq!(reply.text, "Hello from the model.");
    assert_eq!(reply.usage.total_tokens, 15);
    assert!(reply.assistant_commit.metadata.is_some());

    // The request carried the compiled context including the prompt.
    let recorded = requests.borrow();
    assert_eq!(recorded.len(), 1);
    let roles: Vec<&str> = recorded[0]
        .messages
        .iter()
        .map(|m| m.role.as_str())
        .collect();
    assert_eq!(roles, vec!["system", "user"]);

    // Both turns landed in history.
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 3);
    assert_eq!(context.messages[2].content, "Hello from the model.");
}

#[test]
fn test_chat_without_client_fails_cleanly() {
    let t = tract();
    let err = t.chat("hello?").unwrap_err();
    assert!(matches!(err, TractError::Llm(_)));
}

#[test]
fn test_tool_result_edit_preserves_original() {
    let t = tract();
    t.user("run the linter").unwrap();

    t.on(
        "tool_result",
        |pending: &mut Pending| {
            pending.edit_result("3 warnings (truncated)").unwrap();
            pending.approve().unwrap();
        },
        Some("truncator"),
    )
    .unwrap();

    let HookOutcome::Completed(commit) = t
        .tool_result("call_1", "lint", "warning: a\nwarning: b\nwarning: c")
        .unwrap()
    else {
        panic!("expected committed tool result");
    };

    let metadata = commit.metadata.unwrap();
    assert_eq!(
        metadata["original_content"],
        json!("warning: a\nwarning: b\nwarning: c")
    );

    let context = t.compile().unwrap();
    assert_eq!(context.messages[1].content, "3 warnings (truncated)");
}

#[test]
fn test_tool_result_summarize_via_llm() {
    let t = tract_with_llm("lint: 3 warnings, none fatal");
    t.user("run the linter").unwrap();

    let long_output = "x".repeat(500);
    let mut pending = t
        .tool_result_review("call_1", "lint", long_output.clone())
        .unwrap();
    pending.summarize(Some("keep only counts"), false).unwrap();
    {
        let state = pending.as_tool_result().unwrap();
        assert_eq!(state.content, "lint: 3 warnings, none fatal");
        assert_eq!(state.original_content.as_deref(), Some(long_output.as_str()));
    }
    let commit = pending.approve().unwrap().into_commit().unwrap();
    assert_eq!(commit.content_type, "tool_io");
}

#[test]
fn test_policy_proposal_dispatches_operation() {
    let t = tract();
    for i in 0..4 {
        t.user(format!("message {i}")).unwrap();
    }

    let HookOutcome::Completed(value) = t
        .propose_policy(
            "auto_compress",
            "compress",
            json!({"content": "policy rollup"}),
            Some("history grew past the threshold".into()),
        )
        .unwrap()
    else {
        panic!("expected executed policy");
    };
    assert_eq!(value["operation"], "compress");
    assert_eq!(t.compile().unwrap().messages[0].content, "policy rollup");
}

#[test]
fn test_policy_rejection_via_handler() {
    let t = tract();
    t.user("base").unwrap();

    t.on(
        "policy",
        |pending: &mut Pending| {
            pending.reject("manual mode").unwrap();
        },
        Some("gatekeeper"),
    )
    .unwrap();

    let HookOutcome::Rejected(rejection) = t
        .propose_policy("auto_compress", "compress", json!({}), None)
        .unwrap()
    else {
        panic!("expected rejected policy");
    };
    assert_eq!(rejection.reason, "manual mode");
}

#[test]
fn test_trigger_fires_annotation() {
    let t = tract();
    let commit = t.user("pin me").unwrap();

    let HookOutcome::Completed(value) = t
        .fire_trigger(
            "pin_on_keyword",
            "content contains 'pin'",
            "annotate",
            json!({"target": commit.commit_hash, "priority": "pinned"}),
        )
        .unwrap()
    else {
        panic!("expected executed trigger");
    };
    assert_eq!(value["priority"], "pinned");
    assert_eq!(t.annotation_counts().unwrap().pinned, 1);
}

#[test]
fn test_unknown_proposal_operation_is_config_error() {
    let t = tract();
    t.user("base").unwrap();
    let err = t
        .propose_policy("bad", "drop_everything", json!({}), None)
        .unwrap_err();
    assert!(matches!(err, TractError::PolicyExecution(_)));
}

#[test]
fn test_auto_retry_steers_until_validation_passes() {
    let t = tract();
    let llm = MockLlm::new("better summary with 42 widgets");
    llm.push_response("first summary, forgets the number");
    t.set_llm_client(Box::new(llm));

    let commit = t.user("we bought 42 widgets").unwrap();
    t.user("and later sold half").unwrap();
    t.annotate_with(
        &commit.commit_hash,
        Priority::Important,
        None,
        Some(RetentionCriteria::with_patterns(["42 widgets"])),
    )
    .unwrap();

    let pending = t.compress_review(Default::default()).unwrap();
    // First summary fails validation; the retry re-summarizes with the
    // diagnosis as guidance and the second response passes.
    let outcome = tract::auto_retry(pending, 3).unwrap();
    let RetryOutcome::Completed(output) = outcome else {
        panic!("expected the retry loop to converge");
    };
    let result = output.into_compress().unwrap();
    assert_eq!(result.summary_commits.len(), 1);
    assert!(
        t.compile()
            .unwrap()
            .messages
            .iter()
            .any(|m| m.content.contains("42 widgets"))
    );
}

#[test]
fn test_auto_retry_exhaustion_rejects() {
    let t = tract_with_llm("stubbornly wrong summary");
    let commit = t.user("we bought 42 widgets").unwrap();
    t.annotate_with(
        &commit.commit_hash,
        Priority::Important,
        None,
        Some(RetentionCriteria::with_patterns(["42 widgets"])),
    )
    .unwrap();

    let pending = t.compress_review(Default::default()).unwrap();
    let outcome = tract::auto_retry(pending, 2).unwrap();
    let RetryOutcome::Rejected(rejection) = outcome else {
        panic!("expected exhaustion to reject");
    };
    assert_eq!(rejection.rejection_source.as_str(), "validation");
    // History is untouched.
    assert_eq!(t.compile().unwrap().messages.len(), 1);
}
