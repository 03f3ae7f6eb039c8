//! Options registries.
//!
//! Machines reference guards, actions, delays, services, and activities by
//! name; the registries here supply the implementations. Resolution is
//! lazy: a missing entry fails the microstep that needs it, not machine
//! construction. Registries merge via [`crate::Machine::with_config`],
//! later entries overriding earlier ones.

use crate::action::Action;
use crate::event::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Named guard: `(context, event) -> passed`. An `Err` is surfaced as a
/// guard evaluation failure naming the source state and event.
pub type GuardFn = dyn Fn(&Value, &Event) -> Result<bool, String> + Send + Sync;

/// Named pure-action function: returns further descriptors to resolve.
pub type PureFn = dyn Fn(&Value, &Event) -> Result<Vec<Action>, String> + Send + Sync;

/// Named delay computed from context and event.
pub type DelayFn = dyn Fn(&Value, &Event) -> u64 + Send + Sync;

/// A registered delay.
#[derive(Clone)]
pub enum Delay {
    Ms(u64),
    Fn(Arc<DelayFn>),
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Ms(ms) => write!(f, "Delay::Ms({ms})"),
            Delay::Fn(_) => write!(f, "Delay::Fn(..)"),
        }
    }
}

/// Default bound on microsteps per macrostep before the engine reports a
/// transient loop.
pub const DEFAULT_TRANSIENT_LIMIT: usize = 100;

/// Registries and engine tunables attached to a machine.
#[derive(Clone)]
pub struct MachineOptions {
    pub(crate) guards: HashMap<String, Arc<GuardFn>>,
    pub(crate) actions: HashMap<String, Action>,
    pub(crate) pures: HashMap<String, Arc<PureFn>>,
    pub(crate) delays: HashMap<String, Delay>,
    pub(crate) services: HashMap<String, Value>,
    pub(crate) activities: HashMap<String, Value>,
    pub(crate) transient_limit: usize,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            guards: HashMap::new(),
            actions: HashMap::new(),
            pures: HashMap::new(),
            delays: HashMap::new(),
            services: HashMap::new(),
            activities: HashMap::new(),
            transient_limit: DEFAULT_TRANSIENT_LIMIT,
        }
    }
}

impl MachineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named guard.
    pub fn with_guard<F>(mut self, name: impl Into<String>, guard: F) -> Self
    where
        F: Fn(&Value, &Event) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(guard));
        self
    }

    /// Registers a named action descriptor.
    pub fn with_action(mut self, name: impl Into<String>, action: Action) -> Self {
        self.actions.insert(name.into(), action);
        self
    }

    /// Registers a pure-action function.
    pub fn with_pure<F>(mut self, name: impl Into<String>, pure: F) -> Self
    where
        F: Fn(&Value, &Event) -> Result<Vec<Action>, String> + Send + Sync + 'static,
    {
        self.pures.insert(name.into(), Arc::new(pure));
        self
    }

    /// Registers a fixed delay in milliseconds.
    pub fn with_delay(mut self, name: impl Into<String>, ms: u64) -> Self {
        self.delays.insert(name.into(), Delay::Ms(ms));
        self
    }

    /// Registers a computed delay.
    pub fn with_delay_fn<F>(mut self, name: impl Into<String>, delay: F) -> Self
    where
        F: Fn(&Value, &Event) -> u64 + Send + Sync + 'static,
    {
        self.delays.insert(name.into(), Delay::Fn(Arc::new(delay)));
        self
    }

    /// Registers a service spec for `invoke`.
    pub fn with_service(mut self, name: impl Into<String>, spec: Value) -> Self {
        self.services.insert(name.into(), spec);
        self
    }

    /// Registers an activity spec.
    pub fn with_activity(mut self, name: impl Into<String>, spec: Value) -> Self {
        self.activities.insert(name.into(), spec);
        self
    }

    /// Overrides the transient-loop bound.
    pub fn with_transient_limit(mut self, limit: usize) -> Self {
        self.transient_limit = limit;
        self
    }

    /// Merges `other` over `self`.
    pub(crate) fn merge(mut self, other: MachineOptions) -> Self {
        self.guards.extend(other.guards);
        self.actions.extend(other.actions);
        self.pures.extend(other.pures);
        self.delays.extend(other.delays);
        self.services.extend(other.services);
        self.activities.extend(other.activities);
        if other.transient_limit != DEFAULT_TRANSIENT_LIMIT {
            self.transient_limit = other.transient_limit;
        }
        self
    }
}

impl fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineOptions")
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("pures", &self.pures.keys().collect::<Vec<_>>())
            .field("delays", &self.delays.keys().collect::<Vec<_>>())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .field("transient_limit", &self.transient_limit)
            .finish()
    }
}
