//! # statechart
//!
//! A pure statechart transition engine in the SCXML (Harel) family:
//! hierarchical states, parallel regions, history pseudo-states, guarded
//! transitions, internal transitions, raised events, and run-to-completion
//! processing.
//!
//! This crate provides:
//! - Machine definition parsing and validation (JSON DSL)
//! - State value resolution and the configuration algebra
//! - Transition selection with guard expression evaluation
//! - LCA-based exit/entry set computation and ordered side effects
//! - Shallow/deep history recording and recall
//!
//! The engine is deliberately small: `transition(state, event)` is a pure,
//! synchronous function returning an immutable [`State`] with the ordered
//! side effects for the host to execute. Timers, actors, and transports
//! live outside; delayed sends are emitted as descriptors for the host's
//! clock, and invocations as start/stop pairs for the host's supervisor.
//!
//! ```
//! use serde_json::json;
//! use statechart::Machine;
//!
//! let machine = Machine::from_json("light", &json!({
//!     "initial": "green",
//!     "states": {
//!         "green":  {"on": {"TIMER": "yellow"}},
//!         "yellow": {"on": {"TIMER": "red"}},
//!         "red":    {"on": {"TIMER": "green"}}
//!     }
//! })).unwrap();
//!
//! let state = machine.initial_state().unwrap();
//! let state = machine.transition(&state, "TIMER").unwrap();
//! assert!(state.matches("yellow"));
//! ```

pub mod action;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod guard;
pub mod history;
pub mod machine;
pub mod node;
pub mod options;
pub mod state;
pub mod value;

pub use action::{Action, ActivitySpec, AssignValue, DelaySpec, SendSpec, SideEffect};
pub use error::MachineError;
pub use event::{Event, INIT_EVENT, NULL_EVENT, WILDCARD_EVENT};
pub use guard::{Expr, Guard};
pub use history::HistoryValue;
pub use machine::Machine;
pub use node::{HistoryKind, NodeKind, StateNode, TransitionNode};
pub use options::{Delay, MachineOptions};
pub use state::State;
pub use value::{StateValue, DEFAULT_DELIMITER};
