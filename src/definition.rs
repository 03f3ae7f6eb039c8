//! Raw machine definition types.
//!
//! Machine definitions use a JSON DSL. A minimal machine:
//!
//! ```json
//! {
//!   "initial": "green",
//!   "states": {
//!     "green":  {"on": {"TIMER": "yellow"}},
//!     "yellow": {"on": {"TIMER": "red"}},
//!     "red":    {"on": {"TIMER": "green"}}
//!   }
//! }
//! ```
//!
//! Recognized per-node options: `id`, `type`, `initial`, `history`,
//! `target`, `states`, `on`, `entry`, `exit`, `activities`, `invoke`,
//! `after`, `meta`, `data`; the root additionally accepts `context`,
//! `delimiter`, and `strict`. Transitions are a target string, an object
//! `{target, cond, actions, in, internal}`, or a list of either; several
//! positions accept "one or many" and are normalized here. `states` and
//! `on` preserve insertion order, which becomes document order in the
//! built tree.

use crate::error::MachineError;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Raw configuration of one state node, as deserialized from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Explicit node id; defaults to the dotted path from the machine key.
    pub id: Option<String>,

    /// Node kind: `atomic`, `compound`, `parallel`, `final`, or `history`.
    /// Inferred from `states`/`history` when omitted.
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Initial child key. Required on compound nodes, forbidden elsewhere.
    pub initial: Option<String>,

    /// History depth on history nodes: `"shallow"`, `"deep"`, or `true`
    /// (shallow).
    pub history: Option<Value>,

    /// Default target of a history node.
    pub target: Option<String>,

    /// Child nodes, in document order.
    pub states: Map<String, Value>,

    /// Event type to transition(s).
    pub on: Map<String, Value>,

    /// Entry action(s).
    pub entry: Option<Value>,

    /// Exit action(s).
    pub exit: Option<Value>,

    /// Activity descriptor(s), lowered into start/stop pairs.
    pub activities: Option<Value>,

    /// Invocation descriptor(s), lowered into start/stop pairs plus
    /// `done.invoke.*` / `error.invoke.*` transitions.
    pub invoke: Option<Value>,

    /// Delay (ms literal or registry name) to transition(s).
    pub after: Map<String, Value>,

    pub meta: Option<Value>,

    /// Done-event payload on final nodes.
    pub data: Option<Value>,

    /// Initial extended context (root only).
    pub context: Option<Value>,

    /// Path delimiter (root only, default `.`).
    pub delimiter: Option<String>,

    /// Reject events outside the machine's alphabet (root only).
    pub strict: Option<bool>,
}

/// Raw configuration of one transition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Target path(s). Absent means an action-only transition.
    pub target: Option<Value>,

    /// Condition: an inline expression or a named guard.
    pub cond: Option<String>,

    /// Action(s) to run when the transition fires.
    pub actions: Option<Value>,

    /// Only fire while this state (id or path) is active.
    #[serde(rename = "in")]
    pub in_state: Option<String>,

    /// Fire without exiting the source. Defaults to true for
    /// leading-delimiter targets.
    pub internal: Option<bool>,
}

/// Raw configuration of one invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeConfig {
    /// Service name, resolved from the options registry when started.
    pub src: String,

    /// Invocation id; defaults to `src`.
    #[serde(default)]
    pub id: Option<String>,

    /// Input payload passed to the service.
    #[serde(default)]
    pub data: Option<Value>,

    /// Transition(s) on `done.invoke.<id>`.
    #[serde(default, rename = "onDone")]
    pub on_done: Option<Value>,

    /// Transition(s) on `error.invoke.<id>`.
    #[serde(default, rename = "onError")]
    pub on_error: Option<Value>,
}

impl StateConfig {
    /// Deserializes a node configuration from a JSON value.
    pub fn from_value(value: &Value) -> Result<Self, MachineError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Normalizes a "one or many" JSON position into a list of values.
pub(crate) fn one_or_many(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Normalizes a transition position (string, object, or list of either)
/// into transition configs.
pub(crate) fn transition_list(value: &Value) -> Result<Vec<TransitionConfig>, MachineError> {
    one_or_many(value)
        .into_iter()
        .map(|item| match item {
            Value::String(target) => Ok(TransitionConfig {
                target: Some(Value::String(target)),
                ..TransitionConfig::default()
            }),
            Value::Object(_) => Ok(serde_json::from_value(item)?),
            other => Err(MachineError::InvalidConfiguration {
                reason: format!("transition must be a string or object, got: {other}"),
            }),
        })
        .collect()
}

/// Extracts the target path list of a transition config.
pub(crate) fn target_paths(config: &TransitionConfig) -> Result<Vec<String>, MachineError> {
    let Some(target) = &config.target else {
        return Ok(Vec::new());
    };
    one_or_many(target)
        .into_iter()
        .map(|item| match item {
            Value::String(path) => Ok(path),
            other => Err(MachineError::InvalidConfiguration {
                reason: format!("transition target must be a string, got: {other}"),
            }),
        })
        .collect()
}

/// Normalizes an invoke position into invoke configs.
pub(crate) fn invoke_list(value: &Value) -> Result<Vec<InvokeConfig>, MachineError> {
    one_or_many(value)
        .into_iter()
        .map(|item| Ok(serde_json::from_value(item)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_node() {
        let config = StateConfig::from_value(&json!({
            "initial": "green",
            "states": {"green": {}, "yellow": {}}
        }))
        .unwrap();

        assert_eq!(config.initial.as_deref(), Some("green"));
        assert_eq!(config.states.len(), 2);
        // Insertion order survives deserialization.
        let keys: Vec<&String> = config.states.keys().collect();
        assert_eq!(keys, ["green", "yellow"]);
    }

    #[test]
    fn test_transition_list_normalization() {
        let list = transition_list(&json!("yellow")).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(target_paths(&list[0]).unwrap(), ["yellow"]);

        let list = transition_list(&json!([
            {"target": "opened", "cond": "ctx.isAdmin"},
            {"target": ".error"}
        ]))
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].cond.as_deref(), Some("ctx.isAdmin"));

        assert!(transition_list(&json!(42)).is_err());
    }

    #[test]
    fn test_multi_target() {
        let list = transition_list(&json!({"target": ["A.a2", "B.b2"]})).unwrap();
        assert_eq!(target_paths(&list[0]).unwrap(), ["A.a2", "B.b2"]);
    }

    #[test]
    fn test_invoke_defaults() {
        let invokes = invoke_list(&json!({"src": "fetchUser", "onDone": "done"})).unwrap();
        assert_eq!(invokes.len(), 1);
        assert_eq!(invokes[0].src, "fetchUser");
        assert!(invokes[0].id.is_none());
    }
}
