//! History recording and entry descent.
//!
//! Every history pseudo-state owns a slot in the history snapshot, keyed by
//! its node id. The slot is written when the history node's parent subtree
//! is exited: shallow history records the parent's one-level value, deep
//! history the full descendant value. Entering a history node replays the
//! slot; with nothing recorded it falls back to the declared default
//! target, then to the parent's initial descent.

use crate::error::MachineError;
use crate::machine::Machine;
use crate::node::{HistoryKind, NodeId, NodeKind};
use crate::value::StateValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Recorded history values, keyed by history-node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryValue(BTreeMap<String, StateValue>);

impl HistoryValue {
    pub fn get(&self, id: &str) -> Option<&StateValue> {
        self.0.get(id)
    }

    pub(crate) fn insert(&mut self, id: String, value: StateValue) {
        self.0.insert(id, value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Machine {
    /// Enters `node`'s mandatory descendants: the initial chain of a
    /// compound node, every region of a parallel node.
    pub(crate) fn enter_descendants(
        &self,
        node: NodeId,
        entry: &mut BTreeSet<NodeId>,
    ) -> Result<(), MachineError> {
        let n = self.node(node);
        match n.kind {
            NodeKind::Atomic | NodeKind::Final => Ok(()),
            NodeKind::Compound => {
                let child = self.initial_child(node)?;
                entry.insert(child);
                self.enter_descendants(child, entry)
            }
            NodeKind::Parallel => {
                for &region in &n.children {
                    if self.node(region).kind == NodeKind::History {
                        continue;
                    }
                    entry.insert(region);
                    self.enter_descendants(region, entry)?;
                }
                Ok(())
            }
            NodeKind::History => Err(MachineError::InvalidConfiguration {
                reason: format!("history state '{}' cannot be entered by initial descent", n.id),
            }),
        }
    }

    /// Enters the subtree under `node` described by `value`, completing any
    /// levels the value leaves unspecified.
    pub(crate) fn enter_value(
        &self,
        node: NodeId,
        value: &StateValue,
        entry: &mut BTreeSet<NodeId>,
    ) -> Result<(), MachineError> {
        match value {
            StateValue::Leaf(key) => {
                let child = self.child_by_key(node, key).ok_or_else(|| {
                    MachineError::NoSuchState {
                        path: format!("{}.{}", self.node(node).id, key),
                    }
                })?;
                entry.insert(child);
                self.enter_descendants(child, entry)
            }
            StateValue::Branch(map) => {
                if map.is_empty() {
                    return self.enter_descendants(node, entry);
                }
                for (key, sub) in map {
                    let child = self.child_by_key(node, key).ok_or_else(|| {
                        MachineError::NoSuchState {
                            path: format!("{}.{}", self.node(node).id, key),
                        }
                    })?;
                    entry.insert(child);
                    if self.node(child).is_leaf() {
                        continue;
                    }
                    self.enter_value(child, sub, entry)?;
                }
                // A value may name only some regions of a parallel node;
                // the remaining regions enter through their initials.
                if self.node(node).kind == NodeKind::Parallel {
                    for &region in &self.node(node).children {
                        if self.node(region).kind != NodeKind::History
                            && !entry.contains(&region)
                        {
                            entry.insert(region);
                            self.enter_descendants(region, entry)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Records history slots for every exited node that owns a history
    /// child, reading the pre-exit configuration.
    pub(crate) fn record_exit_history(
        &self,
        exit_set: &BTreeSet<NodeId>,
        config: &BTreeSet<NodeId>,
        history: &mut HistoryValue,
    ) {
        for &exited in exit_set {
            let node = self.node(exited);
            if !matches!(node.kind, NodeKind::Compound | NodeKind::Parallel) {
                continue;
            }
            for &child in &node.children {
                let Some(kind) = self.node(child).history_kind else {
                    continue;
                };
                let value = match kind {
                    HistoryKind::Shallow => self.shallow_value_in(exited, config),
                    HistoryKind::Deep => self.value_in(exited, config),
                };
                history.insert(self.node(child).id.clone(), value);
            }
        }
    }

    /// The one-level value under a compound or parallel node.
    fn shallow_value_in(&self, node: NodeId, config: &BTreeSet<NodeId>) -> StateValue {
        let n = self.node(node);
        match n.kind {
            NodeKind::Parallel => {
                let mut map = BTreeMap::new();
                for &region in &n.children {
                    if self.node(region).kind == NodeKind::History {
                        continue;
                    }
                    let value = match self.node(region).kind {
                        NodeKind::Compound | NodeKind::Parallel => {
                            self.shallow_value_in(region, config)
                        }
                        _ => StateValue::Branch(BTreeMap::new()),
                    };
                    map.insert(self.node(region).key.clone(), value);
                }
                StateValue::Branch(map)
            }
            _ => match self.active_child(node, config) {
                Some(child) => StateValue::Leaf(self.node(child).key.clone()),
                None => StateValue::Branch(BTreeMap::new()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_value_serde() {
        let mut history = HistoryValue::default();
        history.insert("door.A.$history".to_string(), StateValue::from("C"));

        let encoded = serde_json::to_value(&history).unwrap();
        assert_eq!(encoded, json!({"door.A.$history": "C"}));

        let decoded: HistoryValue = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, history);
    }
}
