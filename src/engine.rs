//! The transition engine.
//!
//! `transition` is a pure function: given the current state and an event it
//! selects transitions innermost-first (a selection at a descendant stops
//! the event from bubbling to ancestors; orthogonal regions select
//! independently), computes LCA-based exit and entry sets, folds actions
//! into an ordered side-effect list while applying assigns eagerly, and
//! drains raised and null events until the configuration is stable. One
//! call is one macrostep; the number of microsteps inside it is bounded by
//! the options' transient limit.

use crate::action::{Action, DelaySpec, SideEffect};
use crate::error::MachineError;
use crate::event::{Event, WILDCARD_EVENT};
use crate::guard::Guard;
use crate::history::HistoryValue;
use crate::machine::Machine;
use crate::node::{NodeId, NodeKind, TransitionNode};
use crate::options::Delay;
use crate::state::State;
use crate::value::StateValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Bound on `pure` actions producing further `pure` actions.
const PURE_DEPTH_LIMIT: usize = 16;

/// Mutable accumulator for one macrostep.
struct Flow {
    config: BTreeSet<NodeId>,
    ctx: Value,
    history: HistoryValue,
    activities: BTreeMap<String, bool>,
    effects: Vec<SideEffect>,
    raised: VecDeque<Event>,
    assigned: bool,
    fired: bool,
    steps: usize,
}

impl Machine {
    // =========================================================================
    // Engine surface
    // =========================================================================

    /// The machine's initial state, carrying the full entry action list and
    /// with transient transitions already drained.
    pub fn initial_state(&self) -> Result<State, MachineError> {
        let mut entry = BTreeSet::new();
        entry.insert(self.root);
        self.enter_descendants(self.root, &mut entry)?;

        let mut flow = Flow {
            config: BTreeSet::new(),
            ctx: self.context.clone(),
            history: HistoryValue::default(),
            activities: BTreeMap::new(),
            effects: Vec::new(),
            raised: VecDeque::new(),
            assigned: false,
            fired: false,
            steps: 0,
        };

        let init = Event::init();
        for &node in &entry {
            self.resolve_actions(&self.node(node).entry, &self.node(node).id, &init, &mut flow)?;
        }
        flow.config = entry.clone();
        self.raise_done_events(&entry, &mut flow, &init);

        let flow = self.macrostep(flow, None)?;

        Ok(self.seal(flow, None, None, false))
    }

    /// Completes a partial state value into a full state, with no actions
    /// to execute.
    pub fn resolve_state(&self, value: impl Into<StateValue>) -> Result<State, MachineError> {
        let value = self.resolve_value(&value.into())?;
        let config = self.configuration_of(&value)?;

        Ok(State {
            value,
            context: self.context.clone(),
            actions: Vec::new(),
            activities: BTreeMap::new(),
            configuration: config.iter().map(|&n| self.node(n).id.clone()).collect(),
            history: HistoryValue::default(),
            previous: None,
            event: None,
            changed: false,
            done: self.is_in_final(self.root, &config),
        })
    }

    /// Applies one external event: selects transitions, runs the microstep
    /// loop to quiescence, and returns the next immutable state. When
    /// nothing selects, the returned state carries `changed = false` and
    /// the unchanged value, context, and configuration.
    pub fn transition(
        &self,
        state: &State,
        event: impl Into<Event>,
    ) -> Result<State, MachineError> {
        let event = event.into();

        if self.strict() && !event.is_null() {
            let alphabet = self.events();
            if !alphabet.contains(&event.event_type) && !alphabet.contains(WILDCARD_EVENT) {
                return Err(MachineError::UnhandledEvent {
                    machine: self.id().to_string(),
                    event: event.event_type,
                });
            }
        }

        let value = self.resolve_value(&state.value)?;
        let config = self.configuration_of(&value)?;

        let flow = Flow {
            config,
            ctx: state.context.clone(),
            history: state.history.clone(),
            activities: state.activities.clone(),
            effects: Vec::new(),
            raised: VecDeque::new(),
            assigned: false,
            fired: false,
            steps: 0,
        };

        let flow = self.macrostep(flow, Some(event.clone()))?;
        Ok(self.seal(flow, Some(state), Some(event), true))
    }

    /// Builds the immutable result state from a finished macrostep.
    fn seal(
        &self,
        flow: Flow,
        previous: Option<&State>,
        event: Option<Event>,
        compute_changed: bool,
    ) -> State {
        let value = self.value_of(&flow.config);
        let changed = compute_changed
            && flow.fired
            && previous.is_some_and(|prev| {
                flow.assigned || flow.ctx != prev.context || value != prev.value
            });

        State {
            value,
            context: flow.ctx,
            actions: flow.effects,
            activities: flow.activities,
            configuration: flow
                .config
                .iter()
                .map(|&n| self.node(n).id.clone())
                .collect(),
            history: flow.history,
            previous: previous.map(|prev| Box::new(prev.as_previous())),
            event,
            changed,
            done: self.is_in_final(self.root, &flow.config),
        }
    }

    // =========================================================================
    // Run-to-completion loop
    // =========================================================================

    fn macrostep(&self, mut flow: Flow, external: Option<Event>) -> Result<Flow, MachineError> {
        let limit = self.options.transient_limit;
        let mut pending = external;

        loop {
            if let Some(event) = pending.take() {
                let selected = self.select(&flow.config, &flow.ctx, &event)?;
                if !selected.is_empty() {
                    flow.steps += 1;
                    if flow.steps > limit {
                        return Err(MachineError::TransientLoop {
                            machine: self.id().to_string(),
                            limit,
                            event: event.event_type,
                        });
                    }
                    self.apply_microstep(&selected, &mut flow, &event)?;
                }
            }

            // Null-event transitions of transient states drain before
            // raised events.
            if flow.config.iter().any(|&n| self.node(n).transient) {
                let null = Event::null();
                let selected = self.select(&flow.config, &flow.ctx, &null)?;
                if !selected.is_empty() {
                    flow.steps += 1;
                    if flow.steps > limit {
                        return Err(MachineError::TransientLoop {
                            machine: self.id().to_string(),
                            limit,
                            event: null.event_type,
                        });
                    }
                    self.apply_microstep(&selected, &mut flow, &null)?;
                    continue;
                }
            }

            match flow.raised.pop_front() {
                Some(event) => pending = Some(event),
                None => break,
            }
        }

        Ok(flow)
    }

    fn apply_microstep(
        &self,
        selected: &[&TransitionNode],
        flow: &mut Flow,
        event: &Event,
    ) -> Result<(), MachineError> {
        let mut transitions: Vec<&TransitionNode> = selected.to_vec();
        transitions.sort_by_key(|t| t.source);

        let mut exit_set = BTreeSet::new();
        let mut kept = Vec::with_capacity(transitions.len());
        let mut targeted = Vec::new();

        for t in transitions {
            // A transition whose source was already exited by an earlier
            // (document-order) transition is preempted.
            if exit_set.contains(&t.source) {
                continue;
            }
            kept.push(t);
            // No targets, or an internal transition pointing back at its
            // own source: action-only, no exit or entry sets.
            if t.targets.is_empty()
                || (t.internal && t.targets.iter().all(|&target| target == t.source))
            {
                continue;
            }

            let domain = self.transition_domain(t);
            for &node in flow.config.iter() {
                if self.is_proper_ancestor(domain, node) {
                    exit_set.insert(node);
                }
            }
            targeted.push((t, domain));
        }

        // History slots are written from the pre-exit configuration,
        // before entry sets are computed, so a transition entering the
        // history of a subtree it exits recalls the fresh value.
        self.record_exit_history(&exit_set, &flow.config, &mut flow.history);

        let mut entry_set = BTreeSet::new();
        for (t, domain) in targeted {
            for &target in &t.targets {
                self.add_entry(target, domain, &mut entry_set, &flow.history)?;
            }
        }
        self.close_entry(&mut entry_set)?;

        // Exit actions, deepest first.
        for &node in exit_set.iter().rev() {
            self.resolve_actions(&self.node(node).exit, &self.node(node).id, event, flow)?;
        }

        // Transition actions in document order of their sources.
        for t in &kept {
            self.resolve_actions(&t.actions, &self.node(t.source).id, event, flow)?;
        }

        let mut new_config: BTreeSet<NodeId> =
            flow.config.difference(&exit_set).copied().collect();
        new_config.extend(entry_set.iter().copied());
        flow.config = new_config;

        // Entry actions, shallowest first.
        for &node in entry_set.iter() {
            self.resolve_actions(&self.node(node).entry, &self.node(node).id, event, flow)?;
        }

        self.raise_done_events(&entry_set, flow, event);
        flow.fired = true;
        Ok(())
    }

    /// Raises `done.state.*` events for final nodes in the entered set.
    fn raise_done_events(&self, entered: &BTreeSet<NodeId>, flow: &mut Flow, event: &Event) {
        for &node in entered {
            if self.node(node).kind != NodeKind::Final {
                continue;
            }
            let Some(parent) = self.parent(node) else {
                continue;
            };
            match self.node(parent).kind {
                NodeKind::Compound => {
                    let data = self.node(node).data.clone().unwrap_or(Value::Null);
                    flow.raised
                        .push_back(Event::done_state(&self.node(parent).id, data).raised_by(event));
                    if let Some(grandparent) = self.parent(parent) {
                        if self.node(grandparent).kind == NodeKind::Parallel
                            && self.is_in_final(grandparent, &flow.config)
                        {
                            flow.raised.push_back(
                                Event::done_state(&self.node(grandparent).id, Value::Null)
                                    .raised_by(event),
                            );
                        }
                    }
                }
                NodeKind::Parallel => {
                    if self.is_in_final(parent, &flow.config) {
                        flow.raised.push_back(
                            Event::done_state(&self.node(parent).id, Value::Null).raised_by(event),
                        );
                    }
                }
                _ => {}
            }
        }
    }

    // =========================================================================
    // Transition selection
    // =========================================================================

    fn select(
        &self,
        config: &BTreeSet<NodeId>,
        ctx: &Value,
        event: &Event,
    ) -> Result<Vec<&TransitionNode>, MachineError> {
        self.select_in(self.root, config, ctx, event)
    }

    /// Innermost-first selection: descendants get the first chance; an
    /// ancestor only selects when no descendant did. Regions of a parallel
    /// node select independently and their picks are unioned.
    fn select_in(
        &self,
        node: NodeId,
        config: &BTreeSet<NodeId>,
        ctx: &Value,
        event: &Event,
    ) -> Result<Vec<&TransitionNode>, MachineError> {
        let n = self.node(node);
        match n.kind {
            NodeKind::Compound => {
                if let Some(child) = self.active_child(node, config) {
                    let selected = self.select_in(child, config, ctx, event)?;
                    if !selected.is_empty() {
                        return Ok(selected);
                    }
                }
                Ok(self
                    .first_enabled(node, config, ctx, event)?
                    .into_iter()
                    .collect())
            }
            NodeKind::Parallel => {
                let mut selected = Vec::new();
                for &region in &n.children {
                    if self.node(region).kind == NodeKind::History || !config.contains(&region) {
                        continue;
                    }
                    selected.extend(self.select_in(region, config, ctx, event)?);
                }
                if selected.is_empty() {
                    selected.extend(self.first_enabled(node, config, ctx, event)?);
                }
                Ok(selected)
            }
            NodeKind::Atomic | NodeKind::Final => Ok(self
                .first_enabled(node, config, ctx, event)?
                .into_iter()
                .collect()),
            NodeKind::History => Ok(Vec::new()),
        }
    }

    /// The first candidate in source order whose guard and in-state
    /// predicate pass. Candidates are stored typed-first, wildcard-last.
    fn first_enabled(
        &self,
        node: NodeId,
        config: &BTreeSet<NodeId>,
        ctx: &Value,
        event: &Event,
    ) -> Result<Option<&TransitionNode>, MachineError> {
        for transition in &self.node(node).transitions {
            if !transition.handles(&event.event_type) {
                continue;
            }
            if let Some(in_state) = transition.in_state {
                if !config.contains(&in_state) {
                    continue;
                }
            }
            if self.guard_passes(transition, ctx, event)? {
                return Ok(Some(transition));
            }
        }
        Ok(None)
    }

    fn guard_passes(
        &self,
        transition: &TransitionNode,
        ctx: &Value,
        event: &Event,
    ) -> Result<bool, MachineError> {
        match &transition.guard {
            None => Ok(true),
            Some(Guard::Expr(expr)) => Ok(expr.check(ctx, event)),
            Some(Guard::Named(name)) => {
                let source = &self.node(transition.source).id;
                let guard =
                    self.options
                        .guards
                        .get(name)
                        .ok_or_else(|| MachineError::UnknownGuard {
                            name: name.clone(),
                            state: source.clone(),
                            event: event.event_type.clone(),
                        })?;
                guard(ctx, event).map_err(|reason| MachineError::GuardFailure {
                    state: source.clone(),
                    event: event.event_type.clone(),
                    reason,
                })
            }
        }
    }

    // =========================================================================
    // Exit and entry sets
    // =========================================================================

    /// The domain of a transition: the source itself for an internal
    /// transition to its own descendants, otherwise the least common
    /// ancestor of the source and all targets.
    fn transition_domain(&self, transition: &TransitionNode) -> NodeId {
        if transition.internal
            && matches!(
                self.node(transition.source).kind,
                NodeKind::Compound | NodeKind::Parallel
            )
            && transition
                .targets
                .iter()
                .all(|&t| t == transition.source || self.is_proper_ancestor(transition.source, t))
        {
            return transition.source;
        }

        let mut members = Vec::with_capacity(transition.targets.len() + 1);
        members.push(transition.source);
        members.extend(transition.targets.iter().copied());
        self.lca_set(&members)
    }

    /// Adds a target and its mandatory companions to the entry set: the
    /// ancestor chain up to (excluding) the domain, plus the target's
    /// initial or history descent.
    fn add_entry(
        &self,
        target: NodeId,
        domain: NodeId,
        entry: &mut BTreeSet<NodeId>,
        history: &HistoryValue,
    ) -> Result<(), MachineError> {
        if self.node(target).kind == NodeKind::History {
            return self.enter_history(target, domain, entry, history);
        }
        if target == domain {
            return Ok(());
        }
        self.push_chain(target, domain, entry);
        entry.insert(target);
        self.enter_descendants(target, entry)
    }

    /// Inserts the proper ancestors of `node` up to (excluding) `domain`.
    fn push_chain(&self, node: NodeId, domain: NodeId, entry: &mut BTreeSet<NodeId>) {
        let mut current = self.parent(node);
        while let Some(ancestor) = current {
            if ancestor == domain {
                break;
            }
            entry.insert(ancestor);
            current = self.parent(ancestor);
        }
    }

    /// Entering a history node recalls its parent's recorded value, or the
    /// declared default target, or the parent's initial descent.
    fn enter_history(
        &self,
        history_node: NodeId,
        domain: NodeId,
        entry: &mut BTreeSet<NodeId>,
        history: &HistoryValue,
    ) -> Result<(), MachineError> {
        let parent = self
            .parent(history_node)
            .ok_or_else(|| MachineError::InvalidConfiguration {
                reason: format!(
                    "history state '{}' has no parent",
                    self.node(history_node).id
                ),
            })?;

        if parent != domain {
            self.push_chain(parent, domain, entry);
            entry.insert(parent);
        }

        match history.get(&self.node(history_node).id) {
            Some(value) => self.enter_value(parent, value, entry),
            None => match self.node(history_node).history_target {
                Some(default) => self.add_entry(default, domain, entry, history),
                None => self.enter_descendants(parent, entry),
            },
        }
    }

    /// Closes the entry set: every entered parallel node has all regions
    /// entered, every entered compound node has an entered child.
    fn close_entry(&self, entry: &mut BTreeSet<NodeId>) -> Result<(), MachineError> {
        loop {
            let mut additions = Vec::new();
            for &node in entry.iter() {
                let n = self.node(node);
                match n.kind {
                    NodeKind::Parallel => {
                        for &region in &n.children {
                            if self.node(region).kind != NodeKind::History
                                && !entry.contains(&region)
                            {
                                additions.push(region);
                            }
                        }
                    }
                    NodeKind::Compound => {
                        if !n.children.iter().any(|child| entry.contains(child)) {
                            additions.push(self.initial_child(node)?);
                        }
                    }
                    _ => {}
                }
            }
            if additions.is_empty() {
                return Ok(());
            }
            for node in additions {
                entry.insert(node);
                self.enter_descendants(node, entry)?;
            }
        }
    }

    // =========================================================================
    // Action resolution
    // =========================================================================

    /// Folds action descriptors into the flow: assigns update the working
    /// context, raises and immediate internal sends join the raised queue,
    /// everything else is appended to the emitted side-effect list. Each
    /// descriptor is resolved against the context as of its position.
    fn resolve_actions(
        &self,
        actions: &[Action],
        source: &str,
        event: &Event,
        flow: &mut Flow,
    ) -> Result<(), MachineError> {
        self.resolve_actions_at(actions, source, event, flow, 0)
    }

    fn resolve_actions_at(
        &self,
        actions: &[Action],
        source: &str,
        event: &Event,
        flow: &mut Flow,
        depth: usize,
    ) -> Result<(), MachineError> {
        if depth > PURE_DEPTH_LIMIT {
            return Err(MachineError::ActionFailure {
                state: source.to_string(),
                event: event.event_type.clone(),
                reason: "pure action recursion exceeded depth limit".to_string(),
            });
        }

        for action in actions {
            match action {
                Action::Named(name) => match self.options.actions.get(name) {
                    Some(resolved) => {
                        let resolved = resolved.clone();
                        self.resolve_actions_at(
                            std::slice::from_ref(&resolved),
                            source,
                            event,
                            flow,
                            depth + 1,
                        )?;
                    }
                    None => {
                        tracing::warn!(
                            action = %name,
                            state = %source,
                            "unknown action forwarded to host"
                        );
                        flow.effects.push(SideEffect::Custom {
                            action: Value::String(name.clone()),
                        });
                    }
                },

                Action::Assign(set) => {
                    if flow.ctx.is_null() {
                        flow.ctx = Value::Object(serde_json::Map::new());
                    }
                    if !flow.ctx.is_object() {
                        return Err(MachineError::AssignFailure {
                            state: source.to_string(),
                            event: event.event_type.clone(),
                            reason: "context is not an object".to_string(),
                        });
                    }
                    for (key, value) in set {
                        let resolved = value.evaluate(&flow.ctx, event);
                        flow.ctx
                            .as_object_mut()
                            .expect("context checked above")
                            .insert(key.clone(), resolved);
                    }
                    flow.assigned = true;
                }

                Action::Raise(raised) => {
                    flow.raised.push_back(raised.clone().raised_by(event));
                }

                Action::Send(send) => {
                    let delay_ms = match &send.delay {
                        None => None,
                        Some(DelaySpec::Ms(ms)) => Some(*ms),
                        Some(DelaySpec::Named(name)) => {
                            match self.options.delays.get(name) {
                                Some(Delay::Ms(ms)) => Some(*ms),
                                Some(Delay::Fn(delay)) => Some(delay(&flow.ctx, event)),
                                None => {
                                    return Err(MachineError::UnknownDelay {
                                        name: name.clone(),
                                        state: source.to_string(),
                                        event: event.event_type.clone(),
                                    })
                                }
                            }
                        }
                    };

                    let mut outgoing = send.event.clone();
                    if !send.payload.is_empty() {
                        let mut data = match outgoing.data.take() {
                            Value::Object(map) => map,
                            _ => serde_json::Map::new(),
                        };
                        for (key, value) in &send.payload {
                            data.insert(key.clone(), value.evaluate(&flow.ctx, event));
                        }
                        outgoing.data = Value::Object(data);
                    }

                    let internal = send.to.as_deref().is_none_or(|to| to == "internal");
                    if internal && delay_ms.is_none() {
                        flow.raised.push_back(outgoing.raised_by(event));
                    } else {
                        flow.effects.push(SideEffect::Send {
                            event: outgoing,
                            to: send.to.clone(),
                            delay_ms,
                            id: send.id.clone(),
                        });
                    }
                }

                Action::Log { label, expr } => {
                    let message = expr
                        .as_ref()
                        .map(|e| e.evaluate(&flow.ctx, event))
                        .unwrap_or(Value::Null);
                    tracing::debug!(
                        state = %source,
                        label = label.as_deref().unwrap_or(""),
                        %message,
                        "log action"
                    );
                    flow.effects.push(SideEffect::Log {
                        label: label.clone(),
                        message,
                    });
                }

                Action::Pure(src) => {
                    let pure =
                        self.options
                            .pures
                            .get(src)
                            .ok_or_else(|| MachineError::UnknownAction {
                                name: src.clone(),
                                state: source.to_string(),
                                event: event.event_type.clone(),
                            })?;
                    let produced =
                        pure(&flow.ctx, event).map_err(|reason| MachineError::ActionFailure {
                            state: source.to_string(),
                            event: event.event_type.clone(),
                            reason,
                        })?;
                    self.resolve_actions_at(&produced, source, event, flow, depth + 1)?;
                }

                Action::Start(spec) => {
                    if spec.invoked && !self.options.services.contains_key(&spec.src) {
                        return Err(MachineError::UnknownService {
                            name: spec.src.clone(),
                            state: source.to_string(),
                            event: event.event_type.clone(),
                        });
                    }
                    flow.activities.insert(spec.id.clone(), true);
                    flow.effects.push(SideEffect::Start(spec.clone()));
                }

                Action::Stop(id) => {
                    flow.activities.insert(id.clone(), false);
                    flow.effects.push(SideEffect::Stop { id: id.clone() });
                }

                Action::Cancel(id) => {
                    flow.effects.push(SideEffect::Cancel { id: id.clone() });
                }

                Action::Custom(value) => {
                    tracing::warn!(state = %source, "unknown action type forwarded to host");
                    flow.effects.push(SideEffect::Custom {
                        action: value.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
