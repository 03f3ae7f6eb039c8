//! The immutable state record returned by the engine.

use crate::action::SideEffect;
use crate::event::Event;
use crate::history::HistoryValue;
use crate::value::StateValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of one `transition` call: the resolved state value, the extended
/// context after all assigns, the ordered side effects to execute, and the
/// bookkeeping a subsequent call needs (configuration, history snapshot).
///
/// States are immutable; the engine never mutates its input. `previous`
/// links one level back only, so holding a long-lived state does not chain
/// the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// The (full) state value.
    pub value: StateValue,

    /// Extended context after this macrostep.
    pub context: Value,

    /// Side effects in execution order. Empty when nothing fired.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<SideEffect>,

    /// Activities and invocations by id: `true` while running.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub activities: BTreeMap<String, bool>,

    /// Ids of all active state nodes, in document order.
    pub configuration: Vec<String>,

    /// History snapshot, keyed by history-node id.
    #[serde(default, skip_serializing_if = "HistoryValue::is_empty")]
    pub history: HistoryValue,

    /// The state this one was derived from, truncated to one level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<State>>,

    /// The event that produced this state, absent on the initial state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,

    /// True when the call changed the value or context.
    #[serde(default)]
    pub changed: bool,

    /// True when the machine root has reached its done condition.
    #[serde(default)]
    pub done: bool,
}

impl State {
    /// Whether `descriptor` (a dotted path with the default delimiter) is a
    /// prefix of this state's value.
    pub fn matches(&self, descriptor: &str) -> bool {
        StateValue::from(descriptor).matches(&self.value)
    }

    /// A copy suitable for the `previous` slot: no further back-link and no
    /// replayable side effects.
    pub(crate) fn as_previous(&self) -> State {
        State {
            previous: None,
            actions: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> State {
        State {
            value: StateValue::from("red.walk"),
            context: json!({"count": 1}),
            actions: Vec::new(),
            activities: BTreeMap::new(),
            configuration: vec!["light".into(), "light.red".into(), "light.red.walk".into()],
            history: HistoryValue::default(),
            previous: None,
            event: Some(Event::new("TIMER")),
            changed: true,
            done: false,
        }
    }

    #[test]
    fn test_matches_prefix() {
        let state = sample();
        assert!(state.matches("red"));
        assert!(state.matches("red.walk"));
        assert!(!state.matches("green"));
        assert!(!state.matches("red.wait"));
    }

    #[test]
    fn test_previous_is_truncated() {
        let mut second = sample();
        second.previous = Some(Box::new(sample().as_previous()));

        let third_previous = second.as_previous();
        assert!(third_previous.previous.is_none());
        assert!(third_previous.actions.is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let state = sample();
        let encoded = serde_json::to_value(&state).unwrap();
        assert_eq!(encoded["value"], json!({"red": "walk"}));

        let decoded: State = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, state);
    }
}
