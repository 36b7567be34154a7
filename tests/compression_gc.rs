//! Compression with retention validation, and garbage collection.

mod common;

use tract::{
    CompressOptions, GcOptions, HookOutcome, Priority, RetentionCriteria, TractError,
};

use common::{MockLlm, tract, tract_with_llm};

/// Ten alternating dialogue commits; returns their hashes in order.
fn seed_dialogue(t: &tract::Tract) -> Vec<String> {
    let mut hashes = Vec::new();
    for i in 0..10 {
        let commit = if i % 2 == 0 {
            t.user(format!("question {i} about widgets"))
        } else {
            t.assistant(format!("answer {i}"))
        }
        .unwrap();
        hashes.push(commit.commit_hash);
    }
    hashes
}

#[test]
fn test_compression_preserves_pinned_and_retention() {
    let t = tract_with_llm("We discussed 42 widgets across the inventory.");
    let hashes = seed_dialogue(&t);

    t.annotate(&hashes[5], Priority::Pinned).unwrap();
    t.annotate_with(
        &hashes[2],
        Priority::Important,
        None,
        Some(RetentionCriteria::with_patterns(["42 widgets"])),
    )
    .unwrap();

    let HookOutcome::Completed(result) = t
        .compress(CompressOptions {
            target_tokens: Some(50),
            ..Default::default()
        })
        .unwrap()
    else {
        panic!("expected completed compression");
    };

    // Pinned boundary splits the stream into two groups.
    assert_eq!(result.summary_commits.len(), 2);
    assert_eq!(result.preserved_commits.len(), 1);
    assert!(!result.source_commits.contains(&hashes[5]));

    let context = t.compile().unwrap();
    let contents: Vec<&str> = context
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    // Pinned commit verbatim, summaries carry the retention pattern.
    assert!(contents.contains(&"answer 5"));
    assert!(
        contents
            .iter()
            .filter(|c| c.contains("42 widgets"))
            .count()
            >= 1
    );
    assert_eq!(context.messages.len(), 3);
}

#[test]
fn test_compression_rejects_lost_retention_pattern() {
    let t = tract_with_llm("a summary that forgets the number");
    let hashes = seed_dialogue(&t);
    t.annotate_with(
        &hashes[2],
        Priority::Important,
        None,
        Some(RetentionCriteria::with_patterns(["42 widgets"])),
    )
    .unwrap();

    let err = t
        .compress(CompressOptions::default())
        .unwrap_err();
    assert!(matches!(err, TractError::Compression(_)));

    // Nothing changed: all ten commits still compile.
    assert_eq!(t.compile().unwrap().messages.len(), 10);
}

#[test]
fn test_compression_review_edit_summary_then_approve() {
    let t = tract_with_llm("draft summary");
    let hashes = seed_dialogue(&t);
    t.annotate_with(
        &hashes[2],
        Priority::Important,
        None,
        Some(RetentionCriteria::with_patterns(["42 widgets"])),
    )
    .unwrap();

    let mut pending = t.compress_review(CompressOptions::default()).unwrap();
    let validation = pending.validate().unwrap();
    assert!(!validation.passed);
    assert_eq!(validation.index, Some(0));

    pending
        .edit_summary(0, "Edited: the user tracks 42 widgets.")
        .unwrap();
    assert!(pending.validate().unwrap().passed);

    let result = pending.approve().unwrap().into_compress().unwrap();
    assert_eq!(result.summary_commits.len(), 1);
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 1);
    assert!(context.messages[0].content.contains("42 widgets"));
}

#[test]
fn test_manual_compression_content() {
    let t = tract();
    seed_dialogue(&t);

    let HookOutcome::Completed(result) = t
        .compress(CompressOptions {
            content: Some("manual rollup of the conversation".into()),
            ..Default::default()
        })
        .unwrap()
    else {
        panic!("expected completed compression");
    };
    assert_eq!(result.summary_commits.len(), 1);
    assert_eq!(
        t.compile().unwrap().messages[0].content,
        "manual rollup of the conversation"
    );
}

#[test]
fn test_two_stage_guidance_flows_into_summary_prompt() {
    let t = tract();
    let llm = MockLlm::new("summary with 42 widgets");
    llm.push_response("guidance: keep the widget count");
    let requests = llm.requests.clone();
    t.set_llm_client(Box::new(llm));
    seed_dialogue(&t);

    let pending = t
        .compress_review(CompressOptions {
            two_stage: true,
            ..Default::default()
        })
        .unwrap();
    let state = pending.as_compress().unwrap();
    assert_eq!(
        state.guidance.as_deref(),
        Some("guidance: keep the widget count")
    );

    // Two calls so far: guidance, then one summary that saw the guidance.
    let recorded = requests.borrow();
    assert_eq!(recorded.len(), 2);
    assert!(
        recorded[1].messages[1]
            .content
            .contains("guidance: keep the widget count")
    );
}

#[test]
fn test_gc_removes_unreachable_commits() {
    let t = tract();
    t.system("sys").unwrap();
    t.user("kept").unwrap();

    t.branch("temp").unwrap();
    t.user("throwaway 1").unwrap();
    t.assistant("throwaway 2").unwrap();
    t.switch("main").unwrap();
    t.delete_branch("temp", true).unwrap();

    let before = t.compile().unwrap();
    let HookOutcome::Completed(result) = t
        .gc(Some(GcOptions {
            orphan_retention_days: 0,
            archive_retention_days: 0,
        }))
        .unwrap()
    else {
        panic!("expected completed gc");
    };
    assert_eq!(result.commits_removed, 2);
    assert!(result.blobs_removed >= 1);

    // Reachable history is untouched.
    assert_eq!(t.compile().unwrap().messages, before.messages);

    // A second pass finds nothing.
    let HookOutcome::Completed(second) = t
        .gc(Some(GcOptions {
            orphan_retention_days: 0,
            archive_retention_days: 0,
        }))
        .unwrap()
    else {
        panic!("expected completed gc");
    };
    assert_eq!(second.commits_removed, 0);
}

#[test]
fn test_gc_respects_retention_window() {
    let t = tract();
    t.user("kept").unwrap();
    t.branch("temp").unwrap();
    t.user("young orphan").unwrap();
    t.switch("main").unwrap();
    t.delete_branch("temp", true).unwrap();

    // A day-long window keeps a seconds-old orphan alive.
    let HookOutcome::Completed(result) = t
        .gc(Some(GcOptions {
            orphan_retention_days: 1,
            archive_retention_days: 1,
        }))
        .unwrap()
    else {
        panic!("expected completed gc");
    };
    assert_eq!(result.commits_removed, 0);
}

#[test]
fn test_gc_exclude_keeps_commit() {
    let t = tract();
    t.user("kept").unwrap();
    t.branch("temp").unwrap();
    let orphan = t.user("spared").unwrap();
    t.switch("main").unwrap();
    t.delete_branch("temp", true).unwrap();

    let mut pending = t
        .gc_review(Some(GcOptions {
            orphan_retention_days: 0,
            archive_retention_days: 0,
        }))
        .unwrap();
    pending.exclude(&orphan.commit_hash).unwrap();
    let result = pending.approve().unwrap().into_gc().unwrap();
    assert_eq!(result.commits_removed, 0);
    assert!(t.get_commit(&orphan.commit_hash).is_ok());
}
