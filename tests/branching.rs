//! Branch lifecycle, navigation and fast-forward merges.

mod common;

use tract::{HookOutcome, MergeType, ResetMode, TractError};

use common::tract;

#[test]
fn test_branch_and_fast_forward_merge() {
    let t = tract();
    t.system("sys").unwrap();
    t.user("Hi").unwrap();
    t.assistant("Hello!").unwrap();

    t.branch("feature").unwrap();
    t.user("feature question").unwrap();
    t.assistant("feature answer").unwrap();

    t.switch("main").unwrap();
    assert_eq!(t.compile().unwrap().messages.len(), 3);

    let outcome = t.merge("feature", false).unwrap();
    let HookOutcome::Completed(result) = outcome else {
        panic!("expected a completed merge");
    };
    assert_eq!(result.merge_type, MergeType::FastForward);
    assert!(result.merge_commit.is_none());
    assert_eq!(t.compile().unwrap().messages.len(), 5);

    // Fast-forward preserved the original commit hashes.
    assert_eq!(t.head().unwrap().unwrap(), result.new_head);
}

#[test]
fn test_merge_of_reachable_branch_is_nothing_to_merge() {
    let t = tract();
    t.user("base").unwrap();
    t.branch_at("stale", None, false).unwrap();
    t.user("ahead").unwrap();

    let err = t.merge("stale", false).unwrap_err();
    assert!(matches!(err, TractError::NothingToMerge(_)));
}

#[test]
fn test_delete_branch_rules() {
    let t = tract();
    t.user("base").unwrap();
    t.branch("doomed").unwrap();
    t.user("unmerged work").unwrap();

    // Cannot delete the branch HEAD is on.
    assert!(t.delete_branch("doomed", false).is_err());

    t.switch("main").unwrap();
    let err = t.delete_branch("doomed", false).unwrap_err();
    assert!(matches!(err, TractError::UnmergedBranch(_)));

    t.delete_branch("doomed", true).unwrap();
    assert!(t.branches().unwrap().iter().all(|b| b.name != "doomed"));

    assert!(matches!(
        t.delete_branch("doomed", true),
        Err(TractError::BranchNotFound(_))
    ));
}

#[test]
fn test_invalid_branch_names_rejected() {
    let t = tract();
    t.user("base").unwrap();
    for bad in ["has space", "a..b", "x.lock", ".hidden", "a//b"] {
        assert!(
            matches!(
                t.branch(bad),
                Err(TractError::InvalidBranchName { .. })
            ),
            "expected `{bad}` to be rejected"
        );
    }
    assert!(matches!(
        t.branch("main"),
        Err(TractError::BranchExists(_))
    ));
}

#[test]
fn test_reset_records_orig_head() {
    let t = tract();
    let first = t.user("one").unwrap();
    let second = t.user("two").unwrap();

    t.reset(&first.commit_hash, ResetMode::Soft, false).unwrap();
    assert_eq!(t.head().unwrap().unwrap(), first.commit_hash);
    assert_eq!(t.resolve("ORIG_HEAD").unwrap(), second.commit_hash);

    // Hard is gated on force.
    assert!(matches!(
        t.reset(&second.commit_hash, ResetMode::Hard, false),
        Err(TractError::SemanticSafety(_))
    ));
    t.reset(&second.commit_hash, ResetMode::Hard, true).unwrap();
    assert_eq!(t.head().unwrap().unwrap(), second.commit_hash);
}

#[test]
fn test_checkout_dash_round_trips() {
    let t = tract();
    let first = t.user("one").unwrap();
    let second = t.user("two").unwrap();

    let (hash, detached) = t.checkout(&first.commit_hash).unwrap();
    assert_eq!(hash, first.commit_hash);
    assert!(detached);
    assert_eq!(t.current_branch().unwrap(), None);

    // "-" swaps back to the attached position.
    let (hash, detached) = t.checkout("-").unwrap();
    assert_eq!(hash, second.commit_hash);
    assert!(!detached);
    assert_eq!(t.current_branch().unwrap().as_deref(), Some("main"));

    // And swaps again to the detached one.
    let (hash, detached) = t.checkout("-").unwrap();
    assert_eq!(hash, first.commit_hash);
    assert!(detached);
}

#[test]
fn test_checkout_dash_without_history_fails() {
    let t = tract();
    t.user("one").unwrap();
    assert!(t.checkout("-").is_err());
}

#[test]
fn test_detached_commits_do_not_move_branches() {
    let t = tract();
    let first = t.user("one").unwrap();
    t.user("two").unwrap();

    t.checkout(&first.commit_hash).unwrap();
    t.user("detached work").unwrap();

    let main_tip = t
        .branches()
        .unwrap()
        .into_iter()
        .find(|b| b.name == "main")
        .unwrap()
        .tip_hash;
    // The branch stayed put; only detached HEAD advanced.
    assert_ne!(t.head().unwrap().unwrap(), main_tip);
}

#[test]
fn test_merge_base_is_symmetric() {
    let t = tract();
    t.user("base").unwrap();
    t.branch("left").unwrap();
    t.user("left work").unwrap();
    t.switch("main").unwrap();
    t.user("right work").unwrap();

    let ab = t.merge_base("main", "left").unwrap();
    let ba = t.merge_base("left", "main").unwrap();
    assert!(ab.is_some());
    assert_eq!(ab, ba);
}

#[test]
fn test_status_reports_position() {
    let t = tract();
    t.system("sys").unwrap();
    t.user("q").unwrap();

    let status = t.status().unwrap();
    assert_eq!(status.branch_name.as_deref(), Some("main"));
    assert!(!status.is_detached);
    assert_eq!(status.commit_count, 2);
    assert_eq!(status.recent_commits.len(), 2);
    assert!(status.to_string().contains("main @"));
}
