//! Dynamic operations: registration, sandboxed actions, persistence.

mod common;

use serde_json::{Map, json};
use tract::{ActionSpec, HookOutcome, OperationSpec, Pending, Tract};

use common::tract;

fn tagging_spec() -> OperationSpec {
    let mut fields = Map::new();
    fields.insert("label".into(), json!("untagged"));
    fields.insert("count".into(), json!(0));
    OperationSpec {
        name: "tag_session".into(),
        description: "Attach a label to the current session".into(),
        fields,
        actions: vec![
            ActionSpec {
                name: "set_label".into(),
                description: Some("Set the session label".into()),
                params: vec!["label".into()],
                required: vec!["label".into()],
                code: r#"
                    set_field("label", arg("label"));
                    set_field("count", get_field("count") + 1);
                    get_field("label")
                "#
                .into(),
            },
            ActionSpec {
                name: "approve".into(),
                description: None,
                params: vec![],
                required: vec![],
                code: r#"get_field("label")"#.into(),
            },
        ],
        version: 1,
    }
}

#[test]
fn test_register_and_fire_dynamic_operation() {
    let t = tract();
    t.user("base").unwrap();
    t.register_operation(tagging_spec()).unwrap();
    assert_eq!(t.operation_names(), vec!["tag_session".to_string()]);

    let mut pending = t.operation_review("tag_session", Map::new()).unwrap();
    let result = pending
        .execute_tool("set_label", &json!({"label": "research"}))
        .unwrap();
    assert_eq!(result, json!("research"));

    let state = pending.as_dynamic().unwrap();
    assert_eq!(state.fields["label"], json!("research"));
    assert_eq!(state.fields["count"], json!(1));

    // Approve runs the spec's approve action.
    let output = pending.approve().unwrap();
    match output {
        tract::OperationOutput::Value(value) => assert_eq!(value, json!("research")),
        other => panic!("unexpected output: {other:?}"),
    }
}

#[test]
fn test_dynamic_operation_routes_through_hooks() {
    let t = tract();
    t.user("base").unwrap();
    t.register_operation(tagging_spec()).unwrap();

    t.on(
        "tag_session",
        |pending: &mut Pending| {
            pending
                .execute_tool("set_label", &json!({"label": "from-hook"}))
                .unwrap();
            pending.approve().unwrap();
        },
        Some("labeler"),
    )
    .unwrap();

    let HookOutcome::Completed(value) = t.operation("tag_session", Map::new()).unwrap() else {
        panic!("expected completed operation");
    };
    assert_eq!(value, json!("from-hook"));
}

#[test]
fn test_builtin_names_are_reserved() {
    let t = tract();
    let mut spec = tagging_spec();
    spec.name = "compress".into();
    assert!(t.register_operation(spec).is_err());
}

#[test]
fn test_required_params_enforced() {
    let t = tract();
    t.register_operation(tagging_spec()).unwrap();
    let mut pending = t.operation_review("tag_session", Map::new()).unwrap();
    assert!(pending.execute_tool("set_label", &json!({})).is_err());
}

#[test]
fn test_specs_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("context.db");

    {
        let t = Tract::open(&db_path).unwrap();
        t.register_operation(tagging_spec()).unwrap();
    }
    // The spec file landed in the sidecar.
    assert!(
        dir.path()
            .join(".tract/operations/tag_session.json")
            .exists()
    );

    let reopened = Tract::open(&db_path).unwrap();
    assert_eq!(
        reopened.operation_names(),
        vec!["tag_session".to_string()]
    );
    let HookOutcome::Completed(_) = reopened.operation("tag_session", Map::new()).unwrap() else {
        panic!("expected completed operation");
    };
}

#[test]
fn test_scripted_handler_loads_from_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("context.db");
    let hook_dir = dir.path().join(".tract/hooks/gc");
    std::fs::create_dir_all(&hook_dir).unwrap();
    std::fs::write(hook_dir.join("veto.rhai"), r#"reject("scripted veto")"#).unwrap();

    let t = Tract::open(&db_path).unwrap();
    t.set_token_counter(std::rc::Rc::new(tract::NullTokenCounter));
    t.user("base").unwrap();
    t.branch("temp").unwrap();
    t.user("orphan").unwrap();
    t.switch("main").unwrap();
    t.delete_branch("temp", true).unwrap();

    let outcome = t
        .gc(Some(tract::GcOptions {
            orphan_retention_days: 0,
            archive_retention_days: 0,
        }))
        .unwrap();
    let HookOutcome::Rejected(rejection) = outcome else {
        panic!("expected the scripted handler to reject");
    };
    assert_eq!(rejection.reason, "scripted veto");
}

#[test]
fn test_commit_hashes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("context.db");

    let hashes: Vec<String> = {
        let t = Tract::open(&db_path).unwrap();
        t.set_token_counter(std::rc::Rc::new(tract::NullTokenCounter));
        t.system("sys").unwrap();
        t.user("question").unwrap();
        t.log().unwrap().into_iter().map(|c| c.commit_hash).collect()
    };

    let reopened = Tract::open(&db_path).unwrap();
    reopened.set_token_counter(std::rc::Rc::new(tract::NullTokenCounter));
    let reloaded: Vec<String> = reopened
        .log()
        .unwrap()
        .into_iter()
        .map(|c| c.commit_hash)
        .collect();
    assert_eq!(hashes, reloaded);
    assert_eq!(reopened.compile().unwrap().messages.len(), 2);
}
