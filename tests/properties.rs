//! Property-based tests for the engine invariants.
//!
//! These tests use proptest to verify the engine's contracts hold across
//! many randomly generated event sequences.

use proptest::prelude::*;
use serde_json::json;
use statechart::{Machine, State, StateValue};

fn pedestrian_light() -> Machine {
    Machine::from_json(
        "light",
        &json!({
            "initial": "green",
            "states": {
                "green":  {"on": {"TIMER": "yellow"}},
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

fn crossing() -> Machine {
    Machine::from_json(
        "crossing",
        &json!({
            "type": "parallel",
            "states": {
                "lane": {
                    "initial": "open",
                    "states": {
                        "open": {"on": {"CLOSE": "shut"}},
                        "shut": {"on": {"OPEN": "open"}}
                    }
                },
                "bell": {
                    "initial": "quiet",
                    "states": {
                        "quiet": {"on": {"RING": "ringing"}},
                        "ringing": {"on": {"MUTE": "quiet"}}
                    }
                }
            }
        }),
    )
    .unwrap()
}

fn arbitrary_event() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["TIMER", "PED", "CLOSE", "OPEN", "RING", "MUTE", "NOISE"])
}

fn drive(machine: &Machine, events: &[&str]) -> State {
    let mut state = machine.initial_state().unwrap();
    for &event in events {
        state = machine.transition(&state, event).unwrap();
    }
    state
}

proptest! {
    #[test]
    fn transition_is_deterministic(events in prop::collection::vec(arbitrary_event(), 0..12)) {
        let machine = pedestrian_light();
        let first = drive(&machine, &events);
        let second = drive(&machine, &events);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn input_state_is_never_mutated(events in prop::collection::vec(arbitrary_event(), 1..10)) {
        let machine = pedestrian_light();
        let state = drive(&machine, &events[..events.len() - 1]);
        let snapshot = state.clone();

        let _ = machine.transition(&state, *events.last().unwrap()).unwrap();
        prop_assert_eq!(state, snapshot);
    }

    #[test]
    fn unselected_events_leave_state_unchanged(events in prop::collection::vec(arbitrary_event(), 0..10)) {
        let machine = pedestrian_light();
        let state = drive(&machine, &events);

        let next = machine.transition(&state, "NOISE").unwrap();
        prop_assert!(!next.changed);
        prop_assert_eq!(&next.value, &state.value);
        prop_assert_eq!(&next.context, &state.context);
        prop_assert_eq!(&next.configuration, &state.configuration);
    }

    #[test]
    fn state_value_round_trips(events in prop::collection::vec(arbitrary_event(), 0..12)) {
        let machine = pedestrian_light();
        let state = drive(&machine, &events);

        for path in state.value.to_strings(machine.delimiter()) {
            let reparsed = StateValue::parse(&path, machine.delimiter());
            let resolved = machine.resolve_value(&reparsed).unwrap();
            prop_assert_eq!(&resolved, &state.value);
        }
    }

    #[test]
    fn configuration_is_ancestrally_closed(events in prop::collection::vec(arbitrary_event(), 0..12)) {
        let machine = crossing();
        let state = drive(&machine, &events);

        // Every proper prefix of every active id is itself active.
        for id in &state.configuration {
            let mut prefix = id.as_str();
            while let Some(split) = prefix.rfind('.') {
                prefix = &prefix[..split];
                prop_assert!(
                    state.configuration.iter().any(|other| other == prefix),
                    "missing ancestor {} of {}", prefix, id
                );
            }
        }

        // Both regions of the parallel machine are always represented.
        prop_assert!(state.configuration.iter().any(|id| id.starts_with("crossing.lane.")));
        prop_assert!(state.configuration.iter().any(|id| id.starts_with("crossing.bell.")));
    }

    #[test]
    fn parallel_regions_are_independent(
        lane_events in prop::collection::vec(prop::sample::select(vec!["CLOSE", "OPEN"]), 0..8),
        bell_events in prop::collection::vec(prop::sample::select(vec!["RING", "MUTE"]), 0..8),
    ) {
        let machine = crossing();

        // Feeding lane events never moves the bell region, and vice versa.
        let after_lane = drive(&machine, &lane_events);
        prop_assert!(StateValue::branch([("bell", StateValue::leaf("quiet"))])
            .matches(&after_lane.value));

        let after_bell = drive(&machine, &bell_events);
        prop_assert!(StateValue::branch([("lane", StateValue::leaf("open"))])
            .matches(&after_bell.value));
    }

    #[test]
    fn strict_machines_reject_foreign_events(events in prop::collection::vec(arbitrary_event(), 0..6)) {
        let machine = Machine::from_json(
            "m",
            &json!({
                "strict": true,
                "initial": "a",
                "states": {"a": {"on": {"TIMER": "b"}}, "b": {"on": {"TIMER": "a"}}}
            }),
        )
        .unwrap();

        let mut state = machine.initial_state().unwrap();
        for &event in &events {
            match machine.transition(&state, event) {
                Ok(next) => {
                    prop_assert_eq!(event, "TIMER");
                    state = next;
                }
                Err(err) => {
                    prop_assert_ne!(event, "TIMER");
                    prop_assert_eq!(err.error_code(), "UNHANDLED_EVENT");
                }
            }
        }
    }
}
