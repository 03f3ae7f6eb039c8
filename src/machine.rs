//! Machine construction and the state tree.
//!
//! A [`Machine`] is built once from a JSON definition and is immutable
//! afterwards: nodes live in an arena indexed by [`NodeId`] in depth-first
//! document order, every node is indexed by id at the root, and transition
//! targets are resolved to node indices at construction time. Cheap clones
//! share the tree; [`Machine::with_context`] and [`Machine::with_config`]
//! return clones with a different context or merged option registries.

use crate::action::{Action, ActivitySpec, DelaySpec, SendSpec};
use crate::definition::{
    invoke_list, one_or_many, target_paths, transition_list, StateConfig, TransitionConfig,
};
use crate::error::MachineError;
use crate::event::Event;
use crate::guard::Guard;
use crate::node::{HistoryKind, NodeId, NodeKind, StateNode, TransitionNode};
use crate::options::MachineOptions;
use crate::value::{StateValue, DEFAULT_DELIMITER};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// The key of the synthetic history child created by `$history` targets.
const HISTORY_KEY: &str = "$history";

/// Lazily computed, write-once per-machine caches. Reset by `with_config`.
#[derive(Default)]
struct Caches {
    alphabet: RwLock<Option<Arc<BTreeSet<String>>>>,
    initial_value: RwLock<Option<StateValue>>,
}

impl fmt::Debug for Caches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caches").finish_non_exhaustive()
    }
}

/// A validated, indexed statechart.
#[derive(Debug, Clone)]
pub struct Machine {
    key: String,
    id: String,
    delimiter: String,
    strict: bool,
    pub(crate) nodes: Arc<Vec<StateNode>>,
    ids: Arc<HashMap<String, NodeId>>,
    pub(crate) root: NodeId,
    pub(crate) context: Value,
    pub(crate) options: MachineOptions,
    caches: Arc<Caches>,
    checksum: String,
}

impl Machine {
    /// Parses and validates a machine definition from JSON.
    pub fn from_json(key: impl Into<String>, json: &Value) -> Result<Self, MachineError> {
        let key = key.into();
        let config = StateConfig::from_value(json)?;

        let delimiter = config
            .delimiter
            .clone()
            .unwrap_or_else(|| DEFAULT_DELIMITER.to_string());
        let strict = config.strict.unwrap_or(false);
        let context = config.context.clone().unwrap_or(Value::Null);

        let mut builder = Builder {
            delimiter: delimiter.clone(),
            nodes: Vec::new(),
            configs: Vec::new(),
            ids: HashMap::new(),
        };
        let root = builder.add_node(&key, config, None)?;
        builder.build_transitions()?;
        builder.validate()?;

        let json_bytes = serde_json::to_vec(json)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        let id = builder.nodes[root.0].id.clone();
        Ok(Self {
            key,
            id,
            delimiter,
            strict,
            nodes: Arc::new(builder.nodes),
            ids: Arc::new(builder.ids),
            root,
            context,
            options: MachineOptions::default(),
            caches: Arc::new(Caches::default()),
            checksum,
        })
    }

    /// Machine key (root node key).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Machine id (root node id).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Checksum of the raw definition, for integrity checks.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// The initial extended context.
    pub fn context(&self) -> &Value {
        &self.context
    }

    /// Returns a clone carrying a different initial context.
    pub fn with_context(&self, context: Value) -> Machine {
        let mut machine = self.clone();
        machine.context = context;
        machine
    }

    /// Returns a clone with `options` merged over the current registries.
    /// Lazy caches are reset on the clone.
    pub fn with_config(&self, options: MachineOptions) -> Machine {
        let mut machine = self.clone();
        machine.options = machine.options.merge(options);
        machine.caches = Arc::new(Caches::default());
        machine
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub(crate) fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.0]
    }

    /// Looks up a state node by `#id` or delimited path from the root.
    pub fn state_node(&self, descriptor: &str) -> Result<&StateNode, MachineError> {
        self.node_id(descriptor).map(|id| self.node(id))
    }

    pub(crate) fn node_id(&self, descriptor: &str) -> Result<NodeId, MachineError> {
        if let Some(id) = descriptor.strip_prefix('#') {
            return self
                .ids
                .get(id)
                .copied()
                .ok_or_else(|| MachineError::NoSuchState {
                    path: descriptor.to_string(),
                });
        }

        let mut current = self.root;
        for segment in descriptor.split(self.delimiter.as_str()) {
            current =
                self.child_by_key(current, segment)
                    .ok_or_else(|| MachineError::NoSuchState {
                        path: descriptor.to_string(),
                    })?;
        }
        Ok(current)
    }

    /// The flattened, order-preserving transition list of a state node.
    pub fn transitions_of(&self, descriptor: &str) -> Result<&[TransitionNode], MachineError> {
        Ok(&self.state_node(descriptor)?.transitions)
    }

    /// The least common ancestor of two state nodes.
    pub fn lca(&self, a: &str, b: &str) -> Result<&StateNode, MachineError> {
        let a = self.node_id(a)?;
        let b = self.node_id(b)?;
        Ok(self.node(self.lca_set(&[a, b])))
    }

    /// The machine's event alphabet: every event type any transition
    /// answers to, excluding the null event.
    pub fn events(&self) -> Arc<BTreeSet<String>> {
        if let Some(alphabet) = self.caches.alphabet.read().as_ref() {
            return Arc::clone(alphabet);
        }

        let mut alphabet = BTreeSet::new();
        for node in self.nodes.iter() {
            for transition in &node.transitions {
                if !transition.event_type.is_empty() {
                    alphabet.insert(transition.event_type.clone());
                }
            }
        }
        let alphabet = Arc::new(alphabet);
        *self.caches.alphabet.write() = Some(Arc::clone(&alphabet));
        alphabet
    }

    pub(crate) fn child_by_key(&self, node: NodeId, key: &str) -> Option<NodeId> {
        self.node(node)
            .children
            .iter()
            .copied()
            .find(|&child| self.node(child).key == key)
    }

    /// The active child of a compound node under `config`.
    pub(crate) fn active_child(&self, node: NodeId, config: &BTreeSet<NodeId>) -> Option<NodeId> {
        self.node(node)
            .children
            .iter()
            .copied()
            .find(|child| config.contains(child))
    }

    pub(crate) fn initial_child(&self, node: NodeId) -> Result<NodeId, MachineError> {
        let n = self.node(node);
        let key = n
            .initial
            .as_deref()
            .ok_or_else(|| MachineError::InvalidConfiguration {
                reason: format!("compound state '{}' declares no initial child", n.id),
            })?;
        self.child_by_key(node, key)
            .ok_or_else(|| MachineError::InvalidConfiguration {
                reason: format!("initial child '{}' of '{}' does not exist", key, n.id),
            })
    }

    // =========================================================================
    // Tree algebra
    // =========================================================================

    pub(crate) fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    pub(crate) fn is_proper_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        is_proper_ancestor(&self.nodes, ancestor, node)
    }

    /// The least common ancestor of a node set: the deepest non-parallel
    /// node that is a proper ancestor of every member. Falls back to the
    /// root when a member is the root itself.
    pub(crate) fn lca_set(&self, nodes: &[NodeId]) -> NodeId {
        let Some((&head, tail)) = nodes.split_first() else {
            return self.root;
        };

        let mut current = self.parent(head);
        while let Some(candidate) = current {
            if self.node(candidate).kind != NodeKind::Parallel
                && tail
                    .iter()
                    .all(|&n| self.is_proper_ancestor(candidate, n))
            {
                return candidate;
            }
            current = self.parent(candidate);
        }
        self.root
    }

    /// Whether `node` counts as "in a final state" under `config`.
    pub(crate) fn is_in_final(&self, node: NodeId, config: &BTreeSet<NodeId>) -> bool {
        let n = self.node(node);
        match n.kind {
            NodeKind::Final => config.contains(&node),
            NodeKind::Compound => n.children.iter().any(|&child| {
                self.node(child).kind == NodeKind::Final && config.contains(&child)
            }),
            NodeKind::Parallel => n
                .children
                .iter()
                .filter(|&&child| self.node(child).kind != NodeKind::History)
                .all(|&child| self.is_in_final(child, config)),
            _ => false,
        }
    }

    // =========================================================================
    // Value <-> configuration
    // =========================================================================

    /// Derives the active node set from a full state value, including every
    /// ancestor of every leaf and every region of active parallels.
    pub(crate) fn configuration_of(
        &self,
        value: &StateValue,
    ) -> Result<BTreeSet<NodeId>, MachineError> {
        let mut set = BTreeSet::new();
        set.insert(self.root);
        self.collect_config(self.root, value, &mut set)?;
        Ok(set)
    }

    fn collect_config(
        &self,
        node: NodeId,
        value: &StateValue,
        set: &mut BTreeSet<NodeId>,
    ) -> Result<(), MachineError> {
        let n = self.node(node);
        match value {
            StateValue::Leaf(key) => {
                if n.kind == NodeKind::Parallel {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("state value under parallel '{}' must be a mapping", n.id),
                    });
                }
                let child =
                    self.child_by_key(node, key)
                        .ok_or_else(|| MachineError::NoSuchState {
                            path: format!("{}{}{}", n.id, self.delimiter, key),
                        })?;
                set.insert(child);
                Ok(())
            }
            StateValue::Branch(map) => {
                if map.is_empty() {
                    return Ok(());
                }
                if n.kind != NodeKind::Parallel && map.len() != 1 {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!(
                            "state value under compound '{}' must name a single child",
                            n.id
                        ),
                    });
                }
                for (key, sub) in map {
                    let child = self.child_by_key(node, key).ok_or_else(|| {
                        MachineError::NoSuchState {
                            path: format!("{}{}{}", n.id, self.delimiter, key),
                        }
                    })?;
                    set.insert(child);
                    if !self.node(child).is_leaf() {
                        self.collect_config(child, sub, set)?;
                    }
                }
                if n.kind == NodeKind::Parallel {
                    for &region in &n.children {
                        if self.node(region).kind != NodeKind::History && !set.contains(&region) {
                            return Err(MachineError::InvalidConfiguration {
                                reason: format!(
                                    "state value omits region '{}' of parallel '{}'",
                                    self.node(region).key,
                                    n.id
                                ),
                            });
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// The state value of the subtree under a compound or parallel node.
    pub(crate) fn value_in(&self, node: NodeId, config: &BTreeSet<NodeId>) -> StateValue {
        let n = self.node(node);
        match n.kind {
            NodeKind::Parallel => {
                let mut map = BTreeMap::new();
                for &region in &n.children {
                    let r = self.node(region);
                    if r.kind == NodeKind::History {
                        continue;
                    }
                    let value = if r.is_leaf() {
                        StateValue::Branch(BTreeMap::new())
                    } else {
                        self.value_in(region, config)
                    };
                    map.insert(r.key.clone(), value);
                }
                StateValue::Branch(map)
            }
            _ => match self.active_child(node, config) {
                Some(child) if self.node(child).is_leaf() => {
                    StateValue::Leaf(self.node(child).key.clone())
                }
                Some(child) => {
                    let mut map = BTreeMap::new();
                    map.insert(self.node(child).key.clone(), self.value_in(child, config));
                    StateValue::Branch(map)
                }
                None => StateValue::Branch(BTreeMap::new()),
            },
        }
    }

    /// The full state value of a configuration.
    pub(crate) fn value_of(&self, config: &BTreeSet<NodeId>) -> StateValue {
        self.value_in(self.root, config)
    }

    /// Completes a partial state value: missing children become initial
    /// descents, missing regions of a parallel are filled in.
    pub fn resolve_value(&self, partial: &StateValue) -> Result<StateValue, MachineError> {
        self.resolve_children(self.root, Some(partial))
    }

    /// The machine's fully resolved initial state value.
    pub fn initial_value(&self) -> Result<StateValue, MachineError> {
        if let Some(value) = self.caches.initial_value.read().as_ref() {
            return Ok(value.clone());
        }
        let value = self.resolve_children(self.root, None)?;
        *self.caches.initial_value.write() = Some(value.clone());
        Ok(value)
    }

    fn resolve_children(
        &self,
        node: NodeId,
        partial: Option<&StateValue>,
    ) -> Result<StateValue, MachineError> {
        let n = self.node(node);
        match n.kind {
            NodeKind::Parallel => {
                let mut map = BTreeMap::new();
                for &region in &n.children {
                    let r = self.node(region);
                    if r.kind == NodeKind::History {
                        continue;
                    }
                    let sub = match partial {
                        Some(StateValue::Branch(m)) => m.get(&r.key),
                        Some(StateValue::Leaf(_)) => {
                            return Err(MachineError::InvalidConfiguration {
                                reason: format!(
                                    "state value under parallel '{}' must be a mapping",
                                    n.id
                                ),
                            })
                        }
                        None => None,
                    };
                    let value = if r.is_leaf() {
                        StateValue::Branch(BTreeMap::new())
                    } else {
                        self.resolve_children(region, sub)?
                    };
                    map.insert(r.key.clone(), value);
                }
                Ok(StateValue::Branch(map))
            }
            _ => {
                // Compound: pick the named child or fall back to the
                // initial descent.
                let (child, sub) = match partial {
                    None => (self.initial_child(node)?, None),
                    Some(StateValue::Leaf(key)) => {
                        let child = self.child_by_key(node, key).ok_or_else(|| {
                            MachineError::NoSuchState {
                                path: format!("{}{}{}", n.id, self.delimiter, key),
                            }
                        })?;
                        (child, None)
                    }
                    Some(StateValue::Branch(map)) => match map.len() {
                        0 => (self.initial_child(node)?, None),
                        1 => {
                            let (key, sub) = map.iter().next().unwrap();
                            let child = self.child_by_key(node, key).ok_or_else(|| {
                                MachineError::NoSuchState {
                                    path: format!("{}{}{}", n.id, self.delimiter, key),
                                }
                            })?;
                            (child, Some(sub))
                        }
                        _ => {
                            return Err(MachineError::InvalidConfiguration {
                                reason: format!(
                                    "state value under compound '{}' must name a single child",
                                    n.id
                                ),
                            })
                        }
                    },
                };

                let c = self.node(child);
                if c.kind == NodeKind::History {
                    return Err(MachineError::NoSuchState {
                        path: c.id.clone(),
                    });
                }
                if c.is_leaf() {
                    Ok(StateValue::Leaf(c.key.clone()))
                } else {
                    let mut map = BTreeMap::new();
                    map.insert(c.key.clone(), self.resolve_children(child, sub)?);
                    Ok(StateValue::Branch(map))
                }
            }
        }
    }
}

fn is_proper_ancestor(nodes: &[StateNode], ancestor: NodeId, node: NodeId) -> bool {
    let mut current = nodes[node.0].parent;
    while let Some(p) = current {
        if p == ancestor {
            return true;
        }
        current = nodes[p.0].parent;
    }
    false
}

fn region_of(nodes: &[StateNode], parallel: NodeId, node: NodeId) -> Option<NodeId> {
    let mut current = node;
    while let Some(p) = nodes[current.0].parent {
        if p == parallel {
            return Some(current);
        }
        current = p;
    }
    None
}

// =============================================================================
// Builder
// =============================================================================

struct Builder {
    delimiter: String,
    nodes: Vec<StateNode>,
    /// Raw configs aligned with the declared prefix of `nodes`; synthetic
    /// history nodes appended later have no config.
    configs: Vec<StateConfig>,
    ids: HashMap<String, NodeId>,
}

impl Builder {
    /// Depth-first walk assigning document-order indices.
    fn add_node(
        &mut self,
        key: &str,
        config: StateConfig,
        parent: Option<NodeId>,
    ) -> Result<NodeId, MachineError> {
        let id = match &config.id {
            Some(explicit) => explicit.clone(),
            None => match parent {
                Some(p) => format!("{}{}{}", self.nodes[p.0].id, self.delimiter, key),
                None => key.to_string(),
            },
        };

        let kind = self.node_kind(&config, &id)?;
        self.validate_node(&config, kind, &id, parent)?;

        let history_kind = if kind == NodeKind::History {
            Some(parse_history_kind(&config, &id)?)
        } else {
            None
        };

        let path = match parent {
            Some(p) => {
                let mut path = self.nodes[p.0].path.clone();
                path.push(key.to_string());
                path
            }
            None => Vec::new(),
        };

        let node_id = NodeId(self.nodes.len());
        if self.ids.insert(id.clone(), node_id).is_some() {
            return Err(MachineError::InvalidConfiguration {
                reason: format!("duplicate state id '{id}'"),
            });
        }

        self.nodes.push(StateNode {
            key: key.to_string(),
            id,
            path,
            kind,
            parent,
            children: Vec::new(),
            initial: config.initial.clone(),
            history_kind,
            history_target: None,
            entry: Vec::new(),
            exit: Vec::new(),
            activities: Vec::new(),
            transitions: Vec::new(),
            transient: false,
            meta: config.meta.clone(),
            data: config.data.clone(),
        });
        self.configs.push(config);

        let states = self.configs[node_id.0].states.clone();
        for (child_key, child_value) in &states {
            let child_config = StateConfig::from_value(child_value)?;
            let child = self.add_node(child_key, child_config, Some(node_id))?;
            self.nodes[node_id.0].children.push(child);
        }

        Ok(node_id)
    }

    fn node_kind(&self, config: &StateConfig, id: &str) -> Result<NodeKind, MachineError> {
        match config.kind.as_deref() {
            None => Ok(if config.history.is_some() {
                NodeKind::History
            } else if config.states.is_empty() {
                NodeKind::Atomic
            } else {
                NodeKind::Compound
            }),
            Some("atomic") => Ok(NodeKind::Atomic),
            Some("compound") => Ok(NodeKind::Compound),
            Some("parallel") => Ok(NodeKind::Parallel),
            Some("final") => Ok(NodeKind::Final),
            Some("history") => Ok(NodeKind::History),
            Some(other) => Err(MachineError::InvalidConfiguration {
                reason: format!("unknown state type '{other}' on '{id}'"),
            }),
        }
    }

    fn validate_node(
        &self,
        config: &StateConfig,
        kind: NodeKind,
        id: &str,
        parent: Option<NodeId>,
    ) -> Result<(), MachineError> {
        match kind {
            NodeKind::Compound => {
                if config.states.is_empty() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("compound state '{id}' has no children"),
                    });
                }
                if config.initial.is_none() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("compound state '{id}' declares no initial child"),
                    });
                }
            }
            NodeKind::Parallel => {
                if config.initial.is_some() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("parallel state '{id}' must not declare initial"),
                    });
                }
                if config.states.is_empty() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("parallel state '{id}' has no regions"),
                    });
                }
            }
            NodeKind::Atomic | NodeKind::Final | NodeKind::History => {
                if !config.states.is_empty() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("state '{id}' cannot have children"),
                    });
                }
                if config.initial.is_some() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!("state '{id}' must not declare initial"),
                    });
                }
            }
        }

        if parent.is_none() && !matches!(kind, NodeKind::Compound | NodeKind::Parallel) {
            return Err(MachineError::InvalidConfiguration {
                reason: "machine root must declare states".to_string(),
            });
        }

        Ok(())
    }

    /// Second pass: canonicalize actions, lower `after`/`activities`/
    /// `invoke`, and resolve transition targets. Only the declared prefix
    /// of the arena is walked; nodes synthesized along the way (implicit
    /// history children) carry no transitions of their own.
    fn build_transitions(&mut self) -> Result<(), MachineError> {
        for index in 0..self.configs.len() {
            let node_id = NodeId(index);
            let config = self.configs[index].clone();

            let mut entry = match &config.entry {
                Some(value) => Action::canonicalize(value)?,
                None => Vec::new(),
            };
            let mut exit = match &config.exit {
                Some(value) => Action::canonicalize(value)?,
                None => Vec::new(),
            };
            let mut activities = Vec::new();
            let mut transitions = Vec::new();

            for (event_type, raw) in &config.on {
                for tc in transition_list(raw)? {
                    transitions.push(self.build_transition(node_id, event_type, &tc)?);
                }
            }

            for (delay_key, raw) in &config.after {
                let event_type = Event::after_type(delay_key, &self.nodes[index].id);
                let delay = delay_key
                    .parse::<u64>()
                    .map(DelaySpec::Ms)
                    .unwrap_or_else(|_| DelaySpec::Named(delay_key.clone()));

                entry.push(Action::Send(SendSpec {
                    event: Event::new(event_type.clone()),
                    payload: Vec::new(),
                    to: None,
                    delay: Some(delay),
                    id: event_type.clone(),
                }));
                exit.push(Action::Cancel(event_type.clone()));

                for tc in transition_list(raw)? {
                    transitions.push(self.build_transition(node_id, &event_type, &tc)?);
                }
            }

            if let Some(raw) = &config.activities {
                for item in one_or_many(raw) {
                    let spec = activity_spec(&item, &self.nodes[index].id)?;
                    entry.push(Action::Start(spec.clone()));
                    exit.push(Action::Stop(spec.id.clone()));
                    activities.push(spec);
                }
            }

            if let Some(raw) = &config.invoke {
                for invoke in invoke_list(raw)? {
                    let id = invoke.id.clone().unwrap_or_else(|| invoke.src.clone());
                    let spec = ActivitySpec {
                        id: id.clone(),
                        src: invoke.src.clone(),
                        input: invoke.data.clone(),
                        invoked: true,
                    };
                    entry.push(Action::Start(spec.clone()));
                    exit.push(Action::Stop(id.clone()));
                    activities.push(spec);

                    if let Some(raw) = &invoke.on_done {
                        let event_type = format!("done.invoke.{id}");
                        for tc in transition_list(raw)? {
                            transitions.push(self.build_transition(node_id, &event_type, &tc)?);
                        }
                    }
                    if let Some(raw) = &invoke.on_error {
                        let event_type = format!("error.invoke.{id}");
                        for tc in transition_list(raw)? {
                            transitions.push(self.build_transition(node_id, &event_type, &tc)?);
                        }
                    }
                }
            }

            if self.nodes[index].kind == NodeKind::History {
                if let Some(target) = &config.target {
                    let (resolved, _) = self.resolve_target(node_id, target)?;
                    self.nodes[index].history_target = Some(resolved);
                }
            }

            // Typed candidates first, wildcard last; insertion order is
            // preserved within each group.
            let (typed, wildcard): (Vec<_>, Vec<_>) = transitions
                .into_iter()
                .partition(|t| t.event_type != crate::event::WILDCARD_EVENT);
            let mut transitions = typed;
            transitions.extend(wildcard);

            let node = &mut self.nodes[index];
            node.transient = transitions.iter().any(|t| t.event_type.is_empty());
            node.entry = entry;
            node.exit = exit;
            node.activities = activities;
            node.transitions = transitions;
        }
        Ok(())
    }

    fn build_transition(
        &mut self,
        source: NodeId,
        event_type: &str,
        config: &TransitionConfig,
    ) -> Result<TransitionNode, MachineError> {
        let mut targets = Vec::new();
        let mut any_relative = false;
        for path in target_paths(config)? {
            let (target, relative) = self.resolve_target(source, &path)?;
            targets.push(target);
            any_relative |= relative;
        }

        let guard = match &config.cond {
            Some(cond) => Some(Guard::from_cond(cond)?),
            None => None,
        };

        let in_state = match &config.in_state {
            Some(path) => Some(self.resolve_target(source, path)?.0),
            None => None,
        };

        let actions = match &config.actions {
            Some(value) => Action::canonicalize(value)?,
            None => Vec::new(),
        };

        Ok(TransitionNode {
            event_type: event_type.to_string(),
            source,
            targets,
            guard,
            in_state,
            actions,
            internal: config.internal.unwrap_or(any_relative),
        })
    }

    /// Resolves a target path against a source node. Returns the node and
    /// whether the path was leading-delimiter relative (which makes the
    /// transition internal by default).
    fn resolve_target(
        &mut self,
        source: NodeId,
        target: &str,
    ) -> Result<(NodeId, bool), MachineError> {
        let unresolvable = |this: &Self| MachineError::InvalidConfiguration {
            reason: format!(
                "unresolvable target '{}' from state '{}'",
                target, this.nodes[source.0].id
            ),
        };

        if let Some(id) = target.strip_prefix('#') {
            return self
                .ids
                .get(id)
                .copied()
                .map(|n| (n, false))
                .ok_or_else(|| unresolvable(self));
        }

        if let Some(rest) = target.strip_prefix(self.delimiter.as_str()) {
            let segments: Vec<String> = rest
                .split(self.delimiter.as_str())
                .map(str::to_string)
                .collect();
            let resolved = self
                .walk(source, &segments)?
                .ok_or_else(|| unresolvable(self))?;
            return Ok((resolved, true));
        }

        let segments: Vec<String> = target
            .split(self.delimiter.as_str())
            .map(str::to_string)
            .collect();

        // Sibling first, then own descendant, then absolute id, then a
        // path from the machine root.
        if let Some(parent) = self.nodes[source.0].parent {
            if let Some(resolved) = self.walk(parent, &segments)? {
                return Ok((resolved, false));
            }
        }
        if let Some(resolved) = self.walk(source, &segments)? {
            return Ok((resolved, false));
        }
        if let Some(&resolved) = self.ids.get(target) {
            return Ok((resolved, false));
        }
        if let Some(resolved) = self.walk(NodeId(0), &segments)? {
            return Ok((resolved, false));
        }

        Err(unresolvable(self))
    }

    fn walk(&mut self, from: NodeId, segments: &[String]) -> Result<Option<NodeId>, MachineError> {
        let mut current = from;
        for (index, segment) in segments.iter().enumerate() {
            if segment == HISTORY_KEY {
                if index + 1 != segments.len() {
                    return Err(MachineError::InvalidConfiguration {
                        reason: format!(
                            "'{HISTORY_KEY}' must be the last segment of a target path (state '{}')",
                            self.nodes[current.0].id
                        ),
                    });
                }
                return Ok(Some(self.history_child_of(current)?));
            }

            let next = self.nodes[current.0]
                .children
                .iter()
                .copied()
                .find(|&child| self.nodes[child.0].key == *segment);
            match next {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Finds the history child of a node, creating an implicit shallow one
    /// for `$history` targets when none is declared.
    fn history_child_of(&mut self, parent: NodeId) -> Result<NodeId, MachineError> {
        if !matches!(
            self.nodes[parent.0].kind,
            NodeKind::Compound | NodeKind::Parallel
        ) {
            return Err(MachineError::InvalidConfiguration {
                reason: format!(
                    "state '{}' is not compound and cannot have history",
                    self.nodes[parent.0].id
                ),
            });
        }

        let existing = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child.0].kind == NodeKind::History);
        if let Some(history) = existing {
            return Ok(history);
        }

        let id = format!(
            "{}{}{}",
            self.nodes[parent.0].id, self.delimiter, HISTORY_KEY
        );
        let node_id = NodeId(self.nodes.len());
        if self.ids.insert(id.clone(), node_id).is_some() {
            return Err(MachineError::InvalidConfiguration {
                reason: format!("duplicate state id '{id}'"),
            });
        }

        let mut path = self.nodes[parent.0].path.clone();
        path.push(HISTORY_KEY.to_string());
        self.nodes.push(StateNode {
            key: HISTORY_KEY.to_string(),
            id,
            path,
            kind: NodeKind::History,
            parent: Some(parent),
            children: Vec::new(),
            initial: None,
            history_kind: Some(HistoryKind::Shallow),
            history_target: None,
            entry: Vec::new(),
            exit: Vec::new(),
            activities: Vec::new(),
            transitions: Vec::new(),
            transient: false,
            meta: None,
            data: None,
        });
        self.nodes[parent.0].children.push(node_id);
        Ok(node_id)
    }

    /// Final validation over the resolved tree.
    fn validate(&self) -> Result<(), MachineError> {
        for node in &self.nodes {
            // Initial children must exist and must be enterable.
            if node.kind == NodeKind::Compound {
                let key = node.initial.as_deref().unwrap_or_default();
                let initial = node
                    .children
                    .iter()
                    .copied()
                    .find(|&child| self.nodes[child.0].key == key);
                match initial {
                    None => {
                        return Err(MachineError::InvalidConfiguration {
                            reason: format!(
                                "initial child '{}' of '{}' does not exist",
                                key, node.id
                            ),
                        })
                    }
                    Some(child) if self.nodes[child.0].kind == NodeKind::History => {
                        return Err(MachineError::InvalidConfiguration {
                            reason: format!(
                                "initial child '{}' of '{}' is a history state",
                                key, node.id
                            ),
                        })
                    }
                    Some(_) => {}
                }
            }

            // A transition may not cross between sibling regions of a
            // parallel node; such machines have no canonical semantics.
            for transition in &node.transitions {
                for &target in &transition.targets {
                    let mut current = transition.source;
                    while let Some(parent) = self.nodes[current.0].parent {
                        if self.nodes[parent.0].kind == NodeKind::Parallel
                            && is_proper_ancestor(&self.nodes, parent, target)
                        {
                            let source_region = current;
                            let target_region = region_of(&self.nodes, parent, target);
                            if target_region != Some(source_region) {
                                return Err(MachineError::InvalidConfiguration {
                                    reason: format!(
                                        "transition from '{}' targets '{}' in a sibling region of parallel '{}'",
                                        self.nodes[transition.source.0].id,
                                        self.nodes[target.0].id,
                                        self.nodes[parent.0].id
                                    ),
                                });
                            }
                        }
                        current = parent;
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_history_kind(config: &StateConfig, id: &str) -> Result<HistoryKind, MachineError> {
    match &config.history {
        None | Some(Value::Bool(true)) => Ok(HistoryKind::Shallow),
        Some(Value::String(s)) if s == "shallow" => Ok(HistoryKind::Shallow),
        Some(Value::String(s)) if s == "deep" => Ok(HistoryKind::Deep),
        Some(other) => Err(MachineError::InvalidConfiguration {
            reason: format!("invalid history depth {other} on '{id}'"),
        }),
    }
}

fn activity_spec(value: &Value, owner: &str) -> Result<ActivitySpec, MachineError> {
    match value {
        Value::String(name) => Ok(ActivitySpec {
            id: name.clone(),
            src: name.clone(),
            input: None,
            invoked: false,
        }),
        Value::Object(map) => {
            let src = map
                .get("src")
                .or_else(|| map.get("type"))
                .and_then(Value::as_str)
                .ok_or_else(|| MachineError::InvalidConfiguration {
                    reason: format!("activity on '{owner}' requires a 'src' name"),
                })?;
            let id = map
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(src)
                .to_string();
            Ok(ActivitySpec {
                id,
                src: src.to_string(),
                input: map.get("input").cloned(),
                invoked: false,
            })
        }
        other => Err(MachineError::InvalidConfiguration {
            reason: format!("activity on '{owner}' must be a string or object, got: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn light() -> Machine {
        Machine::from_json(
            "light",
            &json!({
                "initial": "green",
                "states": {
                    "green": {"on": {"TIMER": "yellow"}},
                    "yellow": {"on": {"TIMER": "red"}},
                    "red": {
                        "initial": "walk",
                        "on": {"TIMER": "green"},
                        "states": {
                            "walk": {"on": {"PED": "wait"}},
                            "wait": {"on": {"PED": "stop"}},
                            "stop": {}
                        }
                    }
                }
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_build_assigns_document_order() {
        let machine = light();
        let green = machine.state_node("green").unwrap();
        let red = machine.state_node("red").unwrap();
        let walk = machine.state_node("red.walk").unwrap();

        assert_eq!(green.id, "light.green");
        assert_eq!(red.id, "light.red");
        assert_eq!(walk.id, "light.red.walk");
        assert_eq!(walk.path, ["red", "walk"]);

        // Document order: green before red, red before its children.
        let green_id = machine.node_id("green").unwrap();
        let red_id = machine.node_id("red").unwrap();
        let walk_id = machine.node_id("red.walk").unwrap();
        assert!(green_id < red_id);
        assert!(red_id < walk_id);
    }

    #[test]
    fn test_lookup_by_id_and_path() {
        let machine = light();
        assert_eq!(
            machine.state_node("#light.red.walk").unwrap().key,
            "walk"
        );
        assert!(matches!(
            machine.state_node("red.missing"),
            Err(MachineError::NoSuchState { .. })
        ));
    }

    #[test]
    fn test_lca() {
        let machine = light();
        assert_eq!(machine.lca("red.walk", "red.wait").unwrap().id, "light.red");
        assert_eq!(machine.lca("red.walk", "green").unwrap().id, "light");
    }

    #[test]
    fn test_events_alphabet() {
        let machine = light();
        let events = machine.events();
        assert!(events.contains("TIMER"));
        assert!(events.contains("PED"));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_checksum_is_stable() {
        let definition = json!({
            "initial": "a",
            "states": {"a": {}}
        });
        let first = Machine::from_json("m", &definition).unwrap();
        let second = Machine::from_json("m", &definition).unwrap();
        assert_eq!(first.checksum(), second.checksum());
        assert_eq!(first.with_context(json!({"n": 1})).checksum(), first.checksum());
    }

    #[test]
    fn test_missing_initial_fails() {
        let result = Machine::from_json(
            "m",
            &json!({
                "initial": "a",
                "states": {
                    "a": {"states": {"x": {}}}
                }
            }),
        );
        assert!(matches!(
            result,
            Err(MachineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_unknown_target_fails() {
        let result = Machine::from_json(
            "m",
            &json!({
                "initial": "a",
                "states": {"a": {"on": {"GO": "nowhere"}}}
            }),
        );
        assert!(matches!(
            result,
            Err(MachineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_duplicate_id_fails() {
        let result = Machine::from_json(
            "m",
            &json!({
                "initial": "a",
                "states": {
                    "a": {"id": "dup"},
                    "b": {"id": "dup"}
                }
            }),
        );
        assert!(matches!(
            result,
            Err(MachineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_parallel_must_not_declare_initial() {
        let result = Machine::from_json(
            "m",
            &json!({
                "type": "parallel",
                "initial": "A",
                "states": {"A": {}, "B": {}}
            }),
        );
        assert!(matches!(
            result,
            Err(MachineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_cross_region_target_rejected() {
        let result = Machine::from_json(
            "m",
            &json!({
                "type": "parallel",
                "states": {
                    "A": {
                        "initial": "a1",
                        "states": {"a1": {"on": {"X": "#m.B.b2"}}, "a2": {}}
                    },
                    "B": {
                        "initial": "b1",
                        "states": {"b1": {}, "b2": {}}
                    }
                }
            }),
        );
        assert!(matches!(
            result,
            Err(MachineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_dot_target_resolves_to_own_child_and_is_internal() {
        let machine = Machine::from_json(
            "door",
            &json!({
                "initial": "closed",
                "states": {
                    "closed": {
                        "initial": "idle",
                        "on": {"OPEN": ".error"},
                        "states": {"idle": {}, "error": {}}
                    }
                }
            }),
        )
        .unwrap();

        let transitions = machine.transitions_of("closed").unwrap();
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].internal);
        let target = transitions[0].targets[0];
        assert_eq!(machine.node(target).id, "door.closed.error");
    }

    #[test]
    fn test_implicit_history_child_is_synthesized() {
        let machine = Machine::from_json(
            "m",
            &json!({
                "initial": "A",
                "states": {
                    "A": {
                        "initial": "B",
                        "on": {"OUT": "F"},
                        "states": {"B": {}, "C": {}}
                    },
                    "F": {"on": {"BACK": "A.$history"}}
                }
            }),
        )
        .unwrap();

        let history = machine.state_node("#m.A.$history").unwrap();
        assert_eq!(history.kind, NodeKind::History);
        assert_eq!(history.history_kind, Some(HistoryKind::Shallow));
    }

    #[test]
    fn test_wildcard_sorted_last() {
        let machine = Machine::from_json(
            "m",
            &json!({
                "initial": "a",
                "states": {
                    "a": {"on": {"*": "c", "GO": "b"}},
                    "b": {},
                    "c": {}
                }
            }),
        )
        .unwrap();

        let transitions = machine.transitions_of("a").unwrap();
        assert_eq!(transitions[0].event_type, "GO");
        assert_eq!(transitions[1].event_type, "*");
    }

    #[test]
    fn test_resolve_value_completes_descents() {
        let machine = light();
        assert_eq!(
            machine.resolve_value(&StateValue::from("red")).unwrap(),
            StateValue::from("red.walk")
        );
        assert_eq!(machine.initial_value().unwrap(), StateValue::from("green"));
    }

    #[test]
    fn test_configuration_closure() {
        let machine = light();
        let config = machine
            .configuration_of(&StateValue::from("red.wait"))
            .unwrap();
        let ids: Vec<&str> = config.iter().map(|&n| machine.node(n).id.as_str()).collect();
        assert_eq!(ids, ["light", "light.red", "light.red.wait"]);
    }

    #[test]
    fn test_after_is_lowered_to_send_and_cancel() {
        let machine = Machine::from_json(
            "m",
            &json!({
                "initial": "a",
                "states": {
                    "a": {"after": {"500": "b"}},
                    "b": {}
                }
            }),
        )
        .unwrap();

        let a = machine.state_node("a").unwrap();
        assert!(matches!(a.entry[0], Action::Send(ref s) if s.id == "after(500)#m.a"));
        assert!(matches!(a.exit[0], Action::Cancel(ref id) if id == "after(500)#m.a"));
        assert_eq!(a.transitions[0].event_type, "after(500)#m.a");
    }
}
