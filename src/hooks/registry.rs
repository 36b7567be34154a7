//! Handler registry: named handlers per operation, with ordering
//! controls and a catch-all channel.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::errors::{Result, TractError};
use crate::hooks::pending::Pending;

/// A hook handler. Handlers resolve the pending by calling `approve`,
/// `reject` or `pass_through` on it; mutable captured state goes through
/// `RefCell`.
pub type HookHandler = Rc<dyn Fn(&mut Pending)>;

/// The catch-all operation key.
pub const CATCH_ALL: &str = "*";

/// Where a new handler lands in the chain.
#[derive(Debug, Clone, Default)]
pub enum HookPosition {
    /// End of the chain (default).
    #[default]
    Append,
    /// Front of the chain.
    Prepend,
    /// Immediately before the named handler.
    Before(String),
    /// Immediately after the named handler.
    After(String),
    /// Exact index, clamped to the chain length.
    At(usize),
}

#[derive(Clone)]
pub struct NamedHandler {
    pub name: String,
    pub handler: HookHandler,
}

/// Per-tract handler registry.
#[derive(Default)]
pub struct HookRegistry {
    chains: BTreeMap<String, Vec<NamedHandler>>,
    anonymous_counter: usize,
}

impl HookRegistry {
    /// Register a handler for `operation` (an op name or `"*"`).
    /// Duplicate names within one operation are refused.
    pub fn on(
        &mut self,
        operation: &str,
        handler: HookHandler,
        name: Option<String>,
        position: HookPosition,
    ) -> Result<String> {
        let name = name.unwrap_or_else(|| {
            self.anonymous_counter += 1;
            format!("handler_{}", self.anonymous_counter)
        });
        let chain = self.chains.entry(operation.to_string()).or_default();
        if chain.iter().any(|h| h.name == name) {
            return Err(TractError::Hook(format!(
                "handler '{name}' is already registered for '{operation}'"
            )));
        }

        let index = match position {
            HookPosition::Append => chain.len(),
            HookPosition::Prepend => 0,
            HookPosition::At(index) => index.min(chain.len()),
            HookPosition::Before(anchor) => chain
                .iter()
                .position(|h| h.name == anchor)
                .ok_or_else(|| {
                    TractError::Hook(format!("no handler named '{anchor}' on '{operation}'"))
                })?,
            HookPosition::After(anchor) => {
                chain
                    .iter()
                    .position(|h| h.name == anchor)
                    .ok_or_else(|| {
                        TractError::Hook(format!("no handler named '{anchor}' on '{operation}'"))
                    })?
                    + 1
            }
        };
        chain.insert(index, NamedHandler {
            name: name.clone(),
            handler,
        });
        Ok(name)
    }

    /// Remove one handler by name, or every handler for the operation.
    pub fn off(&mut self, operation: &str, name: Option<&str>) -> usize {
        match name {
            None => self.chains.remove(operation).map(|c| c.len()).unwrap_or(0),
            Some(name) => {
                let Some(chain) = self.chains.get_mut(operation) else {
                    return 0;
                };
                let before = chain.len();
                chain.retain(|h| h.name != name);
                let removed = before - chain.len();
                if chain.is_empty() {
                    self.chains.remove(operation);
                }
                removed
            }
        }
    }

    /// The firing chain for an operation: its own handlers first, then
    /// catch-all handlers, each in registration order.
    pub fn handlers_for(&self, operation: &str) -> Vec<NamedHandler> {
        let mut chain: Vec<NamedHandler> = self
            .chains
            .get(operation)
            .map(|c| c.to_vec())
            .unwrap_or_default();
        if operation != CATCH_ALL {
            if let Some(catch_all) = self.chains.get(CATCH_ALL) {
                chain.extend(catch_all.iter().cloned());
            }
        }
        chain
    }

    /// `operation -> handler names`, for observability.
    pub fn hook_names(&self) -> BTreeMap<String, Vec<String>> {
        self.chains
            .iter()
            .map(|(op, chain)| {
                (op.clone(), chain.iter().map(|h| h.name.clone()).collect())
            })
            .collect()
    }

    /// Human-readable listing of every registered handler.
    pub fn describe(&self) -> String {
        if self.chains.is_empty() {
            return "no hooks registered".to_string();
        }
        let mut out = String::new();
        for (operation, chain) in &self.chains {
            out.push_str(operation);
            out.push_str(":\n");
            for (index, handler) in chain.iter().enumerate() {
                out.push_str(&format!("  {index}. {}\n", handler.name));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> HookHandler {
        Rc::new(|_pending: &mut Pending| {})
    }

    #[test]
    fn test_registration_order_and_positions() {
        let mut registry = HookRegistry::default();
        registry.on("compress", noop(), Some("a".into()), HookPosition::Append).unwrap();
        registry.on("compress", noop(), Some("b".into()), HookPosition::Append).unwrap();
        registry.on("compress", noop(), Some("front".into()), HookPosition::Prepend).unwrap();
        registry
            .on("compress", noop(), Some("mid".into()), HookPosition::Before("b".into()))
            .unwrap();
        registry
            .on("compress", noop(), Some("tail".into()), HookPosition::After("b".into()))
            .unwrap();

        let names: Vec<String> = registry
            .handlers_for("compress")
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, vec!["front", "a", "mid", "b", "tail"]);
    }

    #[test]
    fn test_duplicate_names_refused() {
        let mut registry = HookRegistry::default();
        registry.on("gc", noop(), Some("x".into()), HookPosition::Append).unwrap();
        assert!(
            registry
                .on("gc", noop(), Some("x".into()), HookPosition::Append)
                .is_err()
        );
    }

    #[test]
    fn test_catch_all_appended_after_specific() {
        let mut registry = HookRegistry::default();
        registry.on(CATCH_ALL, noop(), Some("any".into()), HookPosition::Append).unwrap();
        registry.on("gc", noop(), Some("only_gc".into()), HookPosition::Append).unwrap();

        let names: Vec<String> = registry
            .handlers_for("gc")
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, vec!["only_gc", "any"]);
        assert!(registry.handlers_for("merge").iter().any(|h| h.name == "any"));
    }

    #[test]
    fn test_off_by_name_and_wholesale() {
        let mut registry = HookRegistry::default();
        registry.on("gc", noop(), Some("x".into()), HookPosition::Append).unwrap();
        registry.on("gc", noop(), Some("y".into()), HookPosition::Append).unwrap();
        assert_eq!(registry.off("gc", Some("x")), 1);
        assert_eq!(registry.off("gc", None), 1);
        assert!(registry.handlers_for("gc").is_empty());
    }
}
