//! Engine error types.

use thiserror::Error;

/// Errors from machine construction and the transition engine.
///
/// Construction failures are reported while building the machine; runtime
/// failures propagate out of `transition` and leave the previously observed
/// state valid. Messages carry the state id and event type where they are
/// known, so a host can attribute a failure without replaying the input.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid machine configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("no such state: '{path}'")]
    NoSuchState { path: String },

    #[error("unknown guard '{name}' (state '{state}', event '{event}')")]
    UnknownGuard {
        name: String,
        state: String,
        event: String,
    },

    #[error("unknown delay '{name}' (state '{state}', event '{event}')")]
    UnknownDelay {
        name: String,
        state: String,
        event: String,
    },

    #[error("unknown service '{name}' (state '{state}', event '{event}')")]
    UnknownService {
        name: String,
        state: String,
        event: String,
    },

    #[error("unknown action '{name}' (state '{state}', event '{event}')")]
    UnknownAction {
        name: String,
        state: String,
        event: String,
    },

    #[error("unresolvable transition target '{target}' (state '{state}', event '{event}')")]
    UnresolvableTarget {
        target: String,
        state: String,
        event: String,
    },

    #[error("machine '{machine}' is strict and has no transition for event '{event}'")]
    UnhandledEvent { machine: String, event: String },

    #[error("guard evaluation failed (state '{state}', event '{event}'): {reason}")]
    GuardFailure {
        state: String,
        event: String,
        reason: String,
    },

    #[error("assign evaluation failed (state '{state}', event '{event}'): {reason}")]
    AssignFailure {
        state: String,
        event: String,
        reason: String,
    },

    #[error("action evaluation failed (state '{state}', event '{event}'): {reason}")]
    ActionFailure {
        state: String,
        event: String,
        reason: String,
    },

    #[error("machine '{machine}' exceeded {limit} microsteps draining event '{event}'")]
    TransientLoop {
        machine: String,
        limit: usize,
        event: String,
    },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MachineError {
    /// Returns a stable error code suitable for protocol responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            MachineError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            MachineError::NoSuchState { .. } => "NO_SUCH_STATE",
            MachineError::UnknownGuard { .. } => "UNKNOWN_GUARD",
            MachineError::UnknownDelay { .. } => "UNKNOWN_DELAY",
            MachineError::UnknownService { .. } => "UNKNOWN_SERVICE",
            MachineError::UnknownAction { .. } => "UNKNOWN_ACTION",
            MachineError::UnresolvableTarget { .. } => "UNRESOLVABLE_TARGET",
            MachineError::UnhandledEvent { .. } => "UNHANDLED_EVENT",
            MachineError::GuardFailure { .. } => "GUARD_FAILURE",
            MachineError::AssignFailure { .. } => "ASSIGN_FAILURE",
            MachineError::ActionFailure { .. } => "ACTION_FAILURE",
            MachineError::TransientLoop { .. } => "TRANSIENT_LOOP",
            MachineError::InvalidExpression { .. } => "BAD_REQUEST",
            MachineError::Json(_) => "BAD_REQUEST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = MachineError::NoSuchState {
            path: "a.b".to_string(),
        };
        assert_eq!(err.error_code(), "NO_SUCH_STATE");

        let err = MachineError::UnhandledEvent {
            machine: "m".to_string(),
            event: "GO".to_string(),
        };
        assert_eq!(err.error_code(), "UNHANDLED_EVENT");
    }

    #[test]
    fn test_messages_name_state_and_event() {
        let err = MachineError::UnknownGuard {
            name: "isAdmin".to_string(),
            state: "door.closed".to_string(),
            event: "OPEN".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("isAdmin"));
        assert!(msg.contains("door.closed"));
        assert!(msg.contains("OPEN"));
    }
}
