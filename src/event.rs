//! Event types.
//!
//! Events are tagged records with a `type` and an optional JSON payload.
//! Two symbols are reserved: the empty type is the null (eventless) event,
//! taken immediately when a transient state is entered, and `*` is the
//! wildcard, matching any non-null event during selection. Events raised by
//! the machine itself (raises, done events, delayed self-sends) carry the
//! type of the event that produced them in `origin`, for diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The null (eventless) event type.
pub const NULL_EVENT: &str = "";

/// The wildcard event type.
pub const WILDCARD_EVENT: &str = "*";

/// The event type used for the initial entry of a machine.
pub const INIT_EVENT: &str = "machine.init";

/// An event fed to or raised by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Optional payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Type of the event that caused this one to be raised, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Event {
    /// Creates an event with no payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Value::Null,
            origin: None,
        }
    }

    /// Creates an event with a payload.
    pub fn with_data(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: None,
        }
    }

    /// The null event.
    pub fn null() -> Self {
        Self::new(NULL_EVENT)
    }

    /// The event delivered on initial machine entry.
    pub fn init() -> Self {
        Self::new(INIT_EVENT)
    }

    /// Returns true for the null (eventless) event.
    pub fn is_null(&self) -> bool {
        self.event_type == NULL_EVENT
    }

    /// Tags this event with the type of the event that produced it.
    pub fn raised_by(mut self, origin: &Event) -> Self {
        self.origin = Some(origin.event_type.clone());
        self
    }

    /// The done event raised when a compound or parallel state completes.
    pub fn done_state(id: &str, data: Value) -> Self {
        Self::with_data(format!("done.state.{id}"), data)
    }

    /// The done event raised when an invoked service completes.
    pub fn done_invoke(id: &str, data: Value) -> Self {
        Self::with_data(format!("done.invoke.{id}"), data)
    }

    /// The error event raised when an invoked service fails.
    pub fn error_invoke(id: &str, data: Value) -> Self {
        Self::with_data(format!("error.invoke.{id}"), data)
    }

    /// The synthetic event type for a delayed transition on a state node.
    pub fn after_type(delay: &str, id: &str) -> String {
        format!("after({delay})#{id}")
    }
}

impl From<&str> for Event {
    fn from(event_type: &str) -> Self {
        Self::new(event_type)
    }
}

impl From<String> for Event {
    fn from(event_type: String) -> Self {
        Self::new(event_type)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "{}", self.event_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_and_wildcard_symbols() {
        assert!(Event::null().is_null());
        assert!(!Event::new("TIMER").is_null());
        assert_eq!(WILDCARD_EVENT, "*");
    }

    #[test]
    fn test_done_event_types() {
        assert_eq!(
            Event::done_state("light.red", Value::Null).event_type,
            "done.state.light.red"
        );
        assert_eq!(
            Event::done_invoke("fetchUser", Value::Null).event_type,
            "done.invoke.fetchUser"
        );
        assert_eq!(Event::after_type("500", "light.green"), "after(500)#light.green");
    }

    #[test]
    fn test_origin_tagging() {
        let cause = Event::new("INC");
        let raised = Event::new("CHECK").raised_by(&cause);
        assert_eq!(raised.origin.as_deref(), Some("INC"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let event = Event::with_data("PAY", json!({"amount": 100}));
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded, json!({"type": "PAY", "data": {"amount": 100}}));

        let decoded: Event = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, event);
    }
}
