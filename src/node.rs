//! State tree nodes.

use crate::action::{Action, ActivitySpec};
use crate::guard::Guard;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index of a node in the machine's arena. Indices are assigned in
/// depth-first document order, so ordering node ids orders nodes by
/// document position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

/// Kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History,
}

/// Depth of a history pseudo-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    /// Recalls the last active child, one level deep.
    Shallow,
    /// Recalls the full descendant value.
    Deep,
}

/// A node in the statechart tree.
#[derive(Debug, Clone)]
pub struct StateNode {
    /// Local name within the parent's `states` map.
    pub key: String,

    /// Globally unique id: user-supplied or `machineKey.parent.child`.
    pub id: String,

    /// Key sequence from the machine root (the root itself has an empty path).
    pub path: Vec<String>,

    pub kind: NodeKind,

    pub parent: Option<NodeId>,

    /// Children in document order.
    pub children: Vec<NodeId>,

    /// Initial child key. Required on compound nodes.
    pub initial: Option<String>,

    /// History depth, on history nodes.
    pub history_kind: Option<HistoryKind>,

    /// Declared default target of a history node.
    pub history_target: Option<NodeId>,

    /// Canonicalized entry actions, including lowered activity starts and
    /// delayed sends.
    pub entry: Vec<Action>,

    /// Canonicalized exit actions, including lowered activity stops and
    /// delayed-send cancels.
    pub exit: Vec<Action>,

    /// Activities and invocations owned by this node.
    pub activities: Vec<ActivitySpec>,

    /// Outgoing transitions: insertion order, wildcard candidates last.
    pub transitions: Vec<TransitionNode>,

    /// True when a null-event transition leaves this node.
    pub transient: bool,

    pub meta: Option<Value>,

    /// Done-event payload, on final nodes.
    pub data: Option<Value>,
}

impl StateNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A resolved transition descriptor.
#[derive(Debug, Clone)]
pub struct TransitionNode {
    /// Event type this transition answers to. The empty string is the null
    /// event; `*` matches any non-null event.
    pub event_type: String,

    pub source: NodeId,

    /// Resolved targets. Empty for an action-only transition.
    pub targets: Vec<NodeId>,

    pub guard: Option<Guard>,

    /// "In this other state" predicate, checked against the configuration.
    pub in_state: Option<NodeId>,

    pub actions: Vec<Action>,

    /// Internal transitions fire without exiting their source.
    pub internal: bool,
}

impl TransitionNode {
    /// Whether this transition is a candidate for the given event type.
    pub fn handles(&self, event_type: &str) -> bool {
        if event_type.is_empty() {
            self.event_type.is_empty()
        } else {
            self.event_type == event_type || self.event_type == crate::event::WILDCARD_EVENT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_order_by_document_position() {
        let a = NodeId(1);
        let b = NodeId(4);
        assert!(a < b);
    }

    #[test]
    fn test_wildcard_matching() {
        let t = TransitionNode {
            event_type: "*".to_string(),
            source: NodeId(0),
            targets: Vec::new(),
            guard: None,
            in_state: None,
            actions: Vec::new(),
            internal: false,
        };
        assert!(t.handles("ANYTHING"));
        // The null event never falls through to the wildcard.
        assert!(!t.handles(""));
    }
}
