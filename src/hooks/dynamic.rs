//! Dynamically-registered operations.
//!
//! A host can register an [`OperationSpec`] at runtime: named fields
//! with defaults plus actions whose bodies are Rhai scripts. Firing the
//! operation produces a dynamic [`Pending`](crate::hooks::pending::Pending)
//! whose actions run in a sandboxed engine: no filesystem, no modules,
//! no network — only the field accessors and the explicitly registered
//! tract functions.
//!
//! Specs persist twice: in the `saved_specs` table and as
//! `<db-dir>/.tract/operations/<name>.json`, the latter auto-loaded at
//! open time. Scripted hook handlers load from
//! `<db-dir>/.tract/hooks/<op>/<name>.rhai`; sources that fail to
//! compile are moved to `<db-dir>/.tract/quarantine/`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rhai::{Dynamic, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::{Result, TractError};

/// Operation names reserved by the built-in hookable operations.
pub const BUILTIN_OPS: &[&str] = &[
    "compress",
    "gc",
    "rebase",
    "merge",
    "tool_result",
    "policy",
    "trigger",
];

/// One scripted action of a dynamic operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parameter names the action accepts.
    #[serde(default)]
    pub params: Vec<String>,
    /// Subset of `params` that must be supplied.
    #[serde(default)]
    pub required: Vec<String>,
    /// Rhai source executed when the action is invoked.
    pub code: String,
}

/// A dynamically-registered operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    pub description: String,
    /// Field name -> default value; copied into each pending.
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl OperationSpec {
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// Registry of dynamic operations, owned by a tract instance.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    specs: BTreeMap<String, OperationSpec>,
}

impl OperationRegistry {
    /// Register a spec. Names conflicting with built-in operations or an
    /// existing registration are refused.
    pub fn register(&mut self, spec: OperationSpec) -> Result<()> {
        if BUILTIN_OPS.contains(&spec.name.as_str()) {
            return Err(TractError::OperationSpec(format!(
                "cannot register '{}': conflicts with a built-in operation",
                spec.name
            )));
        }
        if self.specs.contains_key(&spec.name) {
            return Err(TractError::OperationSpec(format!(
                "operation '{}' is already registered",
                spec.name
            )));
        }
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.specs.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&OperationSpec> {
        self.specs.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }
}

/// Functions the sandbox exposes over the owning tract. Kept as plain
/// closures so the script layer never sees the tract type itself.
pub struct TractScriptApi {
    /// Current HEAD hash, or empty string.
    pub head: Box<dyn Fn() -> String>,
    /// Number of commits reachable from HEAD.
    pub log_len: Box<dyn Fn() -> i64>,
    /// Annotate a commit; returns false on failure.
    pub annotate: Box<dyn Fn(String, String) -> bool>,
    /// Commit a freeform system note; returns the commit hash or empty.
    pub note: Box<dyn Fn(String) -> String>,
}

/// Decision reached by a scripted hook handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptDecision {
    Approve,
    Reject(String),
    PassThrough,
    None,
}

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();
    // The default engine ships a file-based module resolver; an empty
    // static resolver plus a disabled `import` keyword closes both the
    // module and filesystem surfaces.
    engine.set_module_resolver(rhai::module_resolvers::StaticModuleResolver::new());
    engine.disable_symbol("import");
    engine.set_max_operations(100_000);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1 << 20);
    engine.set_max_array_size(4096);
    engine.set_max_map_size(4096);
    engine
}

fn register_tract_api(engine: &mut Engine, api: Rc<TractScriptApi>) {
    let head_api = api.clone();
    engine.register_fn("head", move || (head_api.head)());
    let log_api = api.clone();
    engine.register_fn("log_len", move || (log_api.log_len)());
    let annotate_api = api.clone();
    engine.register_fn("annotate", move |hash: &str, priority: &str| {
        (annotate_api.annotate)(hash.to_string(), priority.to_string())
    });
    let note_api = api;
    engine.register_fn("note", move |text: &str| (note_api.note)(text.to_string()));
}

/// Run one dynamic action in the sandbox.
///
/// The script reads pending fields via `get_field(name)`, writes them
/// via `set_field(name, value)`, reads invocation arguments via
/// `arg(name)`, and may call the registered tract functions. The
/// script's final expression becomes the action's JSON result.
pub fn run_action(
    api: Rc<TractScriptApi>,
    fields: &mut Map<String, Value>,
    action: &ActionSpec,
    args: &Value,
) -> Result<Value> {
    for required in &action.required {
        if args.get(required).is_none() {
            return Err(TractError::OperationSpec(format!(
                "action '{}' requires argument '{required}'",
                action.name
            )));
        }
    }

    let mut engine = sandboxed_engine();
    register_tract_api(&mut engine, api);

    let fields_cell: Rc<RefCell<Map<String, Value>>> = Rc::new(RefCell::new(fields.clone()));
    let args_value = args.clone();

    let get_cell = fields_cell.clone();
    engine.register_fn("get_field", move |name: &str| -> Dynamic {
        get_cell
            .borrow()
            .get(name)
            .and_then(|v| rhai::serde::to_dynamic(v).ok())
            .unwrap_or(Dynamic::UNIT)
    });
    let set_cell = fields_cell.clone();
    engine.register_fn("set_field", move |name: &str, value: Dynamic| {
        let json = rhai::serde::from_dynamic::<Value>(&value).unwrap_or(Value::Null);
        set_cell.borrow_mut().insert(name.to_string(), json);
    });
    engine.register_fn("arg", move |name: &str| -> Dynamic {
        args_value
            .get(name)
            .and_then(|v| rhai::serde::to_dynamic(v).ok())
            .unwrap_or(Dynamic::UNIT)
    });

    let outcome = engine
        .eval::<Dynamic>(&action.code)
        .map_err(|e| TractError::OperationSpec(format!("action '{}' failed: {e}", action.name)))?;

    *fields = fields_cell.borrow().clone();
    let result = rhai::serde::from_dynamic::<Value>(&outcome).unwrap_or(Value::Null);
    Ok(result)
}

/// Run a scripted hook handler. The script sees the pending as JSON via
/// `pending()` and resolves it by calling `approve()`, `reject(reason)`
/// or `pass_through()`.
pub fn run_handler_script(
    api: Rc<TractScriptApi>,
    pending_json: Value,
    code: &str,
) -> Result<ScriptDecision> {
    let mut engine = sandboxed_engine();
    register_tract_api(&mut engine, api);

    let decision: Rc<RefCell<ScriptDecision>> = Rc::new(RefCell::new(ScriptDecision::None));

    let approve_cell = decision.clone();
    engine.register_fn("approve", move || {
        *approve_cell.borrow_mut() = ScriptDecision::Approve;
    });
    let reject_cell = decision.clone();
    engine.register_fn("reject", move |reason: &str| {
        *reject_cell.borrow_mut() = ScriptDecision::Reject(reason.to_string());
    });
    let pass_cell = decision.clone();
    engine.register_fn("pass_through", move || {
        *pass_cell.borrow_mut() = ScriptDecision::PassThrough;
    });
    engine.register_fn("pending", move || -> Dynamic {
        rhai::serde::to_dynamic(&pending_json).unwrap_or(Dynamic::UNIT)
    });

    engine
        .eval::<Dynamic>(code)
        .map_err(|e| TractError::Hook(format!("scripted handler failed: {e}")))?;

    let result = decision.borrow().clone();
    Ok(result)
}

// -- Sidecar persistence -------------------------------------------------

/// Directory layout under `<db-dir>/.tract/`.
pub struct Sidecar {
    pub root: PathBuf,
}

impl Sidecar {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.root.join("operations")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join("hooks")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    /// Persist a spec as `operations/<name>.json`.
    pub fn save_spec(&self, spec: &OperationSpec) -> Result<()> {
        let dir = self.operations_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", spec.name));
        std::fs::write(path, serde_json::to_string_pretty(spec)?)?;
        Ok(())
    }

    pub fn remove_spec(&self, name: &str) -> Result<()> {
        let path = self.operations_dir().join(format!("{name}.json"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Load every persisted spec; files that fail to parse move to
    /// quarantine.
    pub fn load_specs(&self) -> Result<Vec<OperationSpec>> {
        let dir = self.operations_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut specs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(TractError::from)
                .and_then(|raw| Ok(serde_json::from_str::<OperationSpec>(&raw)?))
            {
                Ok(spec) => specs.push(spec),
                Err(error) => {
                    warn!(path = %path.display(), %error, "quarantining unreadable spec");
                    self.quarantine(&path)?;
                }
            }
        }
        Ok(specs)
    }

    /// Load scripted handlers from `hooks/<op>/<name>.rhai`. Sources
    /// that fail to compile move to quarantine.
    pub fn load_handler_scripts(&self) -> Result<Vec<(String, String, String)>> {
        let dir = self.hooks_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let engine = sandboxed_engine();
        let mut scripts = Vec::new();
        for op_entry in std::fs::read_dir(&dir)? {
            let op_path = op_entry?.path();
            if !op_path.is_dir() {
                continue;
            }
            let operation = op_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            for entry in std::fs::read_dir(&op_path)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("rhai") {
                    continue;
                }
                let name = path
                    .file_stem()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let code = std::fs::read_to_string(&path)?;
                if let Err(error) = engine.compile(&code) {
                    warn!(path = %path.display(), %error, "quarantining handler script");
                    self.quarantine(&path)?;
                    continue;
                }
                scripts.push((operation.clone(), name, code));
            }
        }
        Ok(scripts)
    }

    fn quarantine(&self, path: &Path) -> Result<()> {
        let dir = self.quarantine_dir();
        std::fs::create_dir_all(&dir)?;
        let file_name = path.file_name().map(PathBuf::from).unwrap_or_default();
        std::fs::rename(path, dir.join(file_name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn null_api() -> Rc<TractScriptApi> {
        Rc::new(TractScriptApi {
            head: Box::new(String::new),
            log_len: Box::new(|| 0),
            annotate: Box::new(|_, _| false),
            note: Box::new(|_| String::new()),
        })
    }

    #[test]
    fn test_registry_refuses_builtins_and_duplicates() {
        let mut registry = OperationRegistry::default();
        let mut spec = OperationSpec {
            name: "compress".into(),
            description: "clash".into(),
            fields: Map::new(),
            actions: vec![],
            version: 1,
        };
        assert!(registry.register(spec.clone()).is_err());

        spec.name = "prune_notes".into();
        registry.register(spec.clone()).unwrap();
        assert!(registry.register(spec).is_err());
        assert!(registry.is_registered("prune_notes"));
    }

    #[test]
    fn test_action_mutates_fields_and_returns_value() {
        let action = ActionSpec {
            name: "bump".into(),
            description: None,
            params: vec!["amount".into()],
            required: vec!["amount".into()],
            code: r#"
                let current = get_field("count");
                let next = current + arg("amount");
                set_field("count", next);
                next
            "#
            .into(),
        };
        let mut fields = Map::new();
        fields.insert("count".into(), json!(1));

        let result = run_action(null_api(), &mut fields, &action, &json!({"amount": 2})).unwrap();
        assert_eq!(result, json!(3));
        assert_eq!(fields["count"], json!(3));
    }

    #[test]
    fn test_scripts_cannot_import_modules() {
        let action = ActionSpec {
            name: "escape".into(),
            description: None,
            params: vec![],
            required: vec![],
            code: r#"import "secrets" as m; 1"#.into(),
        };
        let mut fields = Map::new();
        assert!(run_action(null_api(), &mut fields, &action, &json!({})).is_err());

        assert!(
            run_handler_script(null_api(), json!({}), r#"import "secrets" as m; approve()"#)
                .is_err()
        );
    }

    #[test]
    fn test_action_missing_required_arg() {
        let action = ActionSpec {
            name: "bump".into(),
            description: None,
            params: vec!["amount".into()],
            required: vec!["amount".into()],
            code: "1".into(),
        };
        let mut fields = Map::new();
        assert!(run_action(null_api(), &mut fields, &action, &json!({})).is_err());
    }

    #[test]
    fn test_handler_script_decisions() {
        let decision =
            run_handler_script(null_api(), json!({"operation": "gc"}), "approve()").unwrap();
        assert_eq!(decision, ScriptDecision::Approve);

        let decision = run_handler_script(
            null_api(),
            json!({"operation": "gc"}),
            r#"
                let p = pending();
                if p.operation == "gc" { reject("no gc today") } else { pass_through() }
            "#,
        )
        .unwrap();
        assert_eq!(decision, ScriptDecision::Reject("no gc today".into()));
    }

    #[test]
    fn test_sidecar_spec_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::new(dir.path().join(".tract"));
        let spec = OperationSpec {
            name: "prune_notes".into(),
            description: "demo".into(),
            fields: Map::new(),
            actions: vec![],
            version: 1,
        };
        sidecar.save_spec(&spec).unwrap();

        // A corrupt sibling gets quarantined rather than failing the load.
        std::fs::write(sidecar.operations_dir().join("broken.json"), "{not json").unwrap();

        let specs = sidecar.load_specs().unwrap();
        assert_eq!(specs, vec![spec]);
        assert!(sidecar.quarantine_dir().join("broken.json").exists());
    }
}
