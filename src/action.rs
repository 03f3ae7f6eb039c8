//! Action descriptors and resolved side effects.
//!
//! Configuration positions (`entry`, `exit`, transition `actions`) accept
//! strings and objects, canonicalized here into [`Action`] descriptors:
//!
//! - `"notify"` - a named action, resolved from the options registry when
//!   the microstep runs; names without a registry entry are forwarded to
//!   the host verbatim.
//! - `{"type": "assign", "set": {"count": "ctx.count + 1"}}` - assigns;
//!   values with a `ctx.`/`event.` reference are expressions, anything
//!   else is a literal.
//! - `{"type": "raise", "event": "CHECK"}` - internal event.
//! - `{"type": "send", "event": "PING", "to": "child", "delay": 500}` -
//!   a send; `delay` may also name a registry delay. A send with no
//!   target (or target `"internal"`) and no delay joins the raised queue.
//! - `{"type": "log", "expr": "ctx.count", "label": "count"}`
//! - `{"type": "pure", "src": "decide"}` - a registry function returning
//!   further descriptors, resolved recursively.
//! - `{"type": "cancel", "id": "after(500)#light.green"}`
//! - anything else round-trips as a custom action for the host.
//!
//! The engine consumes assigns and raises itself; everything else is
//! emitted as an ordered [`SideEffect`] list on the resulting state.

use crate::definition::one_or_many;
use crate::error::MachineError;
use crate::event::Event;
use crate::guard::Expr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A value position inside an assign or send payload: a literal, or an
/// expression evaluated against context and event.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignValue {
    Lit(Value),
    Expr(Expr),
}

impl AssignValue {
    fn from_value(value: &Value) -> Result<Self, MachineError> {
        match value {
            Value::String(s) if s.contains("ctx.") || s.contains("event.") => {
                Ok(AssignValue::Expr(Expr::parse(s)?))
            }
            other => Ok(AssignValue::Lit(other.clone())),
        }
    }

    pub(crate) fn evaluate(&self, ctx: &Value, event: &Event) -> Value {
        match self {
            AssignValue::Lit(value) => value.clone(),
            AssignValue::Expr(expr) => expr.evaluate(ctx, event),
        }
    }
}

/// A delay: a millisecond literal or a named registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySpec {
    Ms(u64),
    Named(String),
}

/// An activity or invocation owned by a state node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySpec {
    /// Unique id within the machine; `cancel`/`stop` reference it.
    pub id: String,

    /// Name of the worker, resolved from the options registries.
    pub src: String,

    /// Input payload handed to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// True when lowered from `invoke` (the src must then name a
    /// registered service).
    #[serde(default)]
    pub invoked: bool,
}

/// A send descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SendSpec {
    pub event: Event,

    /// Payload entries evaluated at resolution time and merged into the
    /// event data.
    pub payload: Vec<(String, AssignValue)>,

    /// Destination: `None` or `"internal"` is the machine itself.
    pub to: Option<String>,

    pub delay: Option<DelaySpec>,

    /// Id a later `cancel` can reference; defaults to the event type.
    pub id: String,
}

/// A canonicalized action descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Registry-resolved action name.
    Named(String),
    /// Ordered context updates.
    Assign(Vec<(String, AssignValue)>),
    /// Raise an internal event.
    Raise(Event),
    /// Send an event to a target, possibly delayed.
    Send(SendSpec),
    /// Diagnostic log.
    Log {
        label: Option<String>,
        expr: Option<Expr>,
    },
    /// Registry function producing further descriptors.
    Pure(String),
    /// Start an activity or invocation.
    Start(ActivitySpec),
    /// Stop an activity or invocation.
    Stop(String),
    /// Cancel a pending delayed send.
    Cancel(String),
    /// Unrecognized descriptor, forwarded to the host.
    Custom(Value),
}

impl Action {
    /// Canonicalizes an action position (string, object, or list of
    /// either) into descriptors.
    pub fn canonicalize(value: &Value) -> Result<Vec<Action>, MachineError> {
        one_or_many(value)
            .iter()
            .map(Action::from_value)
            .collect()
    }

    fn from_value(value: &Value) -> Result<Action, MachineError> {
        match value {
            Value::String(name) => Ok(Action::Named(name.clone())),
            Value::Object(map) => Action::from_object(map, value),
            other => Err(MachineError::InvalidConfiguration {
                reason: format!("action must be a string or object, got: {other}"),
            }),
        }
    }

    fn from_object(map: &Map<String, Value>, raw: &Value) -> Result<Action, MachineError> {
        let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "assign" => {
                let set = map.get("set").and_then(Value::as_object).ok_or_else(|| {
                    MachineError::InvalidConfiguration {
                        reason: "assign action requires an object 'set'".to_string(),
                    }
                })?;
                let mut assignments = Vec::with_capacity(set.len());
                for (key, value) in set {
                    assignments.push((key.clone(), AssignValue::from_value(value)?));
                }
                Ok(Action::Assign(assignments))
            }
            "raise" => {
                let event = event_of(map, "raise")?;
                Ok(Action::Raise(event))
            }
            "send" => {
                let event = event_of(map, "send")?;
                let payload = match map.get("payload").and_then(Value::as_object) {
                    Some(entries) => {
                        let mut payload = Vec::with_capacity(entries.len());
                        for (key, value) in entries {
                            payload.push((key.clone(), AssignValue::from_value(value)?));
                        }
                        payload
                    }
                    None => Vec::new(),
                };
                let delay = match map.get("delay") {
                    None | Some(Value::Null) => None,
                    Some(Value::Number(n)) => Some(DelaySpec::Ms(n.as_u64().ok_or_else(
                        || MachineError::InvalidConfiguration {
                            reason: format!("send delay must be a non-negative integer: {n}"),
                        },
                    )?)),
                    Some(Value::String(name)) => Some(DelaySpec::Named(name.clone())),
                    Some(other) => {
                        return Err(MachineError::InvalidConfiguration {
                            reason: format!("send delay must be a number or name, got: {other}"),
                        })
                    }
                };
                let to = map.get("to").and_then(Value::as_str).map(str::to_string);
                let id = map
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| event.event_type.clone());
                Ok(Action::Send(SendSpec {
                    event,
                    payload,
                    to,
                    delay,
                    id,
                }))
            }
            "log" => {
                let expr = match map.get("expr").and_then(Value::as_str) {
                    Some(src) => Some(Expr::parse(src)?),
                    None => None,
                };
                let label = map.get("label").and_then(Value::as_str).map(str::to_string);
                Ok(Action::Log { label, expr })
            }
            "pure" => {
                let src = map.get("src").and_then(Value::as_str).ok_or_else(|| {
                    MachineError::InvalidConfiguration {
                        reason: "pure action requires a 'src' name".to_string(),
                    }
                })?;
                Ok(Action::Pure(src.to_string()))
            }
            "start" => {
                let src = map.get("src").and_then(Value::as_str).ok_or_else(|| {
                    MachineError::InvalidConfiguration {
                        reason: "start action requires a 'src' name".to_string(),
                    }
                })?;
                let id = map.get("id").and_then(Value::as_str).unwrap_or(src);
                Ok(Action::Start(ActivitySpec {
                    id: id.to_string(),
                    src: src.to_string(),
                    input: map.get("input").cloned(),
                    invoked: false,
                }))
            }
            "stop" => {
                let id = map.get("id").and_then(Value::as_str).ok_or_else(|| {
                    MachineError::InvalidConfiguration {
                        reason: "stop action requires an 'id'".to_string(),
                    }
                })?;
                Ok(Action::Stop(id.to_string()))
            }
            "cancel" => {
                let id = map.get("id").and_then(Value::as_str).ok_or_else(|| {
                    MachineError::InvalidConfiguration {
                        reason: "cancel action requires an 'id'".to_string(),
                    }
                })?;
                Ok(Action::Cancel(id.to_string()))
            }
            _ => Ok(Action::Custom(raw.clone())),
        }
    }
}

/// Reads the `event` field of a raise/send object: a type string or an
/// object with `type` and `data`.
fn event_of(map: &Map<String, Value>, action: &str) -> Result<Event, MachineError> {
    match map.get("event") {
        Some(Value::String(event_type)) => Ok(Event::new(event_type.clone())),
        Some(Value::Object(event)) => {
            let event_type = event.get("type").and_then(Value::as_str).ok_or_else(|| {
                MachineError::InvalidConfiguration {
                    reason: format!("{action} event object requires a 'type'"),
                }
            })?;
            let data = event.get("data").cloned().unwrap_or(Value::Null);
            Ok(Event::with_data(event_type.to_string(), data))
        }
        _ => Err(MachineError::InvalidConfiguration {
            reason: format!("{action} action requires an 'event'"),
        }),
    }
}

/// A fully resolved side effect, emitted in execution order on the
/// resulting state. Assigns and raises never appear here; the engine
/// consumes them during the microstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SideEffect {
    Send {
        event: Event,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        id: String,
    },
    Log {
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        message: Value,
    },
    Start(ActivitySpec),
    Stop {
        id: String,
    },
    Cancel {
        id: String,
    },
    Custom {
        action: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_string_and_list() {
        let actions = Action::canonicalize(&json!("notify")).unwrap();
        assert_eq!(actions, vec![Action::Named("notify".to_string())]);

        let actions = Action::canonicalize(&json!(["notify", {"type": "raise", "event": "X"}]))
            .unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1], Action::Raise(Event::new("X")));
    }

    #[test]
    fn test_assign_literal_and_expression() {
        let actions = Action::canonicalize(&json!({
            "type": "assign",
            "set": {"count": "ctx.count + 1", "label": "hello", "limit": 5}
        }))
        .unwrap();

        let Action::Assign(set) = &actions[0] else {
            panic!("expected assign");
        };
        assert_eq!(set.len(), 3);
        assert!(matches!(set[0], (ref k, AssignValue::Expr(_)) if k == "count"));
        assert_eq!(
            set[1],
            ("label".to_string(), AssignValue::Lit(json!("hello")))
        );
        assert_eq!(set[2], ("limit".to_string(), AssignValue::Lit(json!(5))));
    }

    #[test]
    fn test_send_defaults_id_to_event_type() {
        let actions = Action::canonicalize(&json!({
            "type": "send", "event": "PING", "delay": 500
        }))
        .unwrap();

        let Action::Send(send) = &actions[0] else {
            panic!("expected send");
        };
        assert_eq!(send.id, "PING");
        assert_eq!(send.delay, Some(DelaySpec::Ms(500)));
        assert!(send.to.is_none());
    }

    #[test]
    fn test_send_named_delay_and_event_object() {
        let actions = Action::canonicalize(&json!({
            "type": "send",
            "event": {"type": "REMIND", "data": {"level": 1}},
            "to": "internal",
            "delay": "SLOW"
        }))
        .unwrap();

        let Action::Send(send) = &actions[0] else {
            panic!("expected send");
        };
        assert_eq!(send.event.data, json!({"level": 1}));
        assert_eq!(send.delay, Some(DelaySpec::Named("SLOW".to_string())));
        assert_eq!(send.to.as_deref(), Some("internal"));
    }

    #[test]
    fn test_unknown_type_round_trips_as_custom() {
        let raw = json!({"type": "vibrate", "pattern": [100, 50, 100]});
        let actions = Action::canonicalize(&raw).unwrap();
        assert_eq!(actions, vec![Action::Custom(raw)]);
    }

    #[test]
    fn test_invalid_shapes_fail() {
        assert!(Action::canonicalize(&json!(42)).is_err());
        assert!(Action::canonicalize(&json!({"type": "assign"})).is_err());
        assert!(Action::canonicalize(&json!({"type": "raise"})).is_err());
        assert!(Action::canonicalize(&json!({"type": "cancel"})).is_err());
    }

    #[test]
    fn test_side_effect_serialization() {
        let effect = SideEffect::Send {
            event: Event::new("PING"),
            to: None,
            delay_ms: Some(500),
            id: "PING".to_string(),
        };
        let encoded = serde_json::to_value(&effect).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "send", "event": {"type": "PING"}, "delay_ms": 500, "id": "PING"})
        );
    }
}
