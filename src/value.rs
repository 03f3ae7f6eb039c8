//! State value algebra.
//!
//! A state value is either a leaf name or a mapping from child key to a
//! nested value: `"green"`, `{"red": "walk"}`, `{"A": "a1", "B": "b1"}`.
//! A full value names exactly one leaf inside every active branch; a partial
//! value may omit initial descents and is completed by
//! [`Machine::resolve_value`](crate::Machine::resolve_value). Equality is
//! structural; branch keys are kept ordered so two equal values are also
//! byte-equal once serialized.

use crate::error::MachineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// The default path delimiter.
pub const DEFAULT_DELIMITER: &str = ".";

/// A resolved or partial state value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// A single active leaf, named by its key.
    Leaf(String),
    /// Active children keyed by child key.
    Branch(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Builds a leaf value.
    pub fn leaf(key: impl Into<String>) -> Self {
        StateValue::Leaf(key.into())
    }

    /// Builds a branch value from `(key, value)` pairs.
    pub fn branch<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, StateValue)>,
        K: Into<String>,
    {
        StateValue::Branch(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Parses a delimited path such as `"red.walk"` into a nested value.
    pub fn parse(path: &str, delimiter: &str) -> Self {
        let mut segments = path.split(delimiter).collect::<Vec<_>>().into_iter().rev();
        let leaf = segments.next().unwrap_or_default();
        let mut value = StateValue::Leaf(leaf.to_string());
        for segment in segments {
            let mut map = BTreeMap::new();
            map.insert(segment.to_string(), value);
            value = StateValue::Branch(map);
        }
        value
    }

    /// Converts a JSON value (string path or nested object) into a state
    /// value using the given delimiter for strings.
    pub fn from_json(value: &Value, delimiter: &str) -> Result<Self, MachineError> {
        match value {
            Value::String(path) => Ok(Self::parse(path, delimiter)),
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, child) in map {
                    out.insert(key.clone(), Self::from_json(child, delimiter)?);
                }
                Ok(StateValue::Branch(out))
            }
            other => Err(MachineError::InvalidConfiguration {
                reason: format!("state value must be a string or object, got: {other}"),
            }),
        }
    }

    /// Returns true when `self` is a prefix of `value`: every branch named
    /// by `self` is active in `value`, possibly with deeper descendants.
    pub fn matches(&self, value: &StateValue) -> bool {
        match (self, value) {
            (StateValue::Leaf(a), StateValue::Leaf(b)) => a == b,
            (StateValue::Leaf(a), StateValue::Branch(map)) => map.contains_key(a),
            (StateValue::Branch(_), StateValue::Leaf(_)) => false,
            (StateValue::Branch(a), StateValue::Branch(b)) => a
                .iter()
                .all(|(key, sub)| b.get(key).is_some_and(|v| sub.matches(v))),
        }
    }

    /// Produces the set of leaf paths, in key order.
    pub fn to_paths(&self) -> Vec<Vec<String>> {
        match self {
            StateValue::Leaf(key) => vec![vec![key.clone()]],
            StateValue::Branch(map) if map.is_empty() => vec![Vec::new()],
            StateValue::Branch(map) => {
                let mut paths = Vec::new();
                for (key, sub) in map {
                    for mut path in sub.to_paths() {
                        path.insert(0, key.clone());
                        paths.push(path);
                    }
                }
                paths
            }
        }
    }

    /// Produces the leaf paths joined by `delimiter`.
    pub fn to_strings(&self, delimiter: &str) -> Vec<String> {
        self.to_paths()
            .into_iter()
            .map(|path| path.join(delimiter))
            .collect()
    }
}

impl From<&str> for StateValue {
    /// Parses with the default `.` delimiter.
    fn from(path: &str) -> Self {
        StateValue::parse(path, DEFAULT_DELIMITER)
    }
}

impl From<String> for StateValue {
    fn from(path: String) -> Self {
        StateValue::parse(&path, DEFAULT_DELIMITER)
    }
}

// Display shows the leaf paths, comma separated, which reads well in error
// messages and test failures.
impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strings(DEFAULT_DELIMITER).join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_dotted_path() {
        assert_eq!(StateValue::from("green"), StateValue::leaf("green"));
        assert_eq!(
            StateValue::from("red.walk"),
            StateValue::branch([("red", StateValue::leaf("walk"))])
        );
        assert_eq!(
            StateValue::from("a.b.c"),
            StateValue::branch([(
                "a",
                StateValue::branch([("b", StateValue::leaf("c"))])
            )])
        );
    }

    #[test]
    fn test_from_json() {
        let value = StateValue::from_json(&json!({"red": "walk"}), ".").unwrap();
        assert_eq!(value, StateValue::from("red.walk"));

        let value = StateValue::from_json(&json!({"A": "a1", "B": "b1"}), ".").unwrap();
        assert_eq!(
            value,
            StateValue::branch([
                ("A", StateValue::leaf("a1")),
                ("B", StateValue::leaf("b1"))
            ])
        );

        assert!(StateValue::from_json(&json!(42), ".").is_err());
    }

    #[test]
    fn test_matches_prefix() {
        let full = StateValue::from("red.walk");
        assert!(StateValue::from("red").matches(&full));
        assert!(full.matches(&full));
        assert!(!StateValue::from("green").matches(&full));
        assert!(!full.matches(&StateValue::from("red")));
    }

    #[test]
    fn test_matches_parallel() {
        let full = StateValue::branch([
            ("A", StateValue::leaf("a2")),
            ("B", StateValue::leaf("b1")),
        ]);
        assert!(StateValue::leaf("A").matches(&full));
        assert!(StateValue::branch([("A", StateValue::leaf("a2"))]).matches(&full));
        assert!(!StateValue::branch([("A", StateValue::leaf("a1"))]).matches(&full));
    }

    #[test]
    fn test_to_strings() {
        let value = StateValue::branch([
            ("A", StateValue::leaf("a2")),
            ("B", StateValue::branch([("b1", StateValue::leaf("x"))])),
        ]);
        assert_eq!(value.to_strings("."), vec!["A.a2", "B.b1.x"]);
    }

    #[test]
    fn test_serde_untagged() {
        let value = StateValue::from("red.walk");
        let encoded = serde_json::to_value(&value).unwrap();
        assert_eq!(encoded, json!({"red": "walk"}));

        let decoded: StateValue = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_structural_equality_ignores_key_order() {
        let a = StateValue::branch([
            ("A", StateValue::leaf("a1")),
            ("B", StateValue::leaf("b1")),
        ]);
        let b = StateValue::branch([
            ("B", StateValue::leaf("b1")),
            ("A", StateValue::leaf("a1")),
        ]);
        assert_eq!(a, b);
    }
}
