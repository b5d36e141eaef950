// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Per-device state carried between allocation cycles.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Debounce state machine of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DebounceState {
    #[default]
    Idle,
    /// A change to `target` has been requested continuously since `since`
    Pending { target: bool, since: DateTime<Utc> },
}

/// Result of feeding one candidate decision into the debouncer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOutcome {
    pub state: DebounceState,
    /// Committed on/off decision for this cycle
    pub committed: bool,
}

impl DebounceState {
    pub fn step(
        self,
        current_on: bool,
        candidate: bool,
        debounce_secs: u64,
        now: DateTime<Utc>,
    ) -> DebounceOutcome {
        if debounce_secs == 0 {
            return DebounceOutcome {
                state: Self::Idle,
                committed: candidate,
            };
        }

        if candidate == current_on {
            return DebounceOutcome {
                state: Self::Idle,
                committed: current_on,
            };
        }

        match self {
            Self::Pending { target, since } if target == candidate => {
                let hold = i64::try_from(debounce_secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .unwrap_or(TimeDelta::MAX);
                if now - since >= hold {
                    DebounceOutcome {
                        state: Self::Idle,
                        committed: candidate,
                    }
                } else {
                    DebounceOutcome {
                        state: self,
                        committed: current_on,
                    }
                }
            }
            Self::Pending { .. } | Self::Idle => DebounceOutcome {
                state: Self::Pending {
                    target: candidate,
                    since: now,
                },
                committed: current_on,
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

/// What the engine remembers about one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceRuntimeState {
    pub is_on: bool,
    pub debounce: DebounceState,
    pub last_on: Option<DateTime<Utc>>,
    pub last_off: Option<DateTime<Utc>>,
}

impl DeviceRuntimeState {
    /// State after a cycle ended with the device `is_on`
    pub fn with_outcome(self, is_on: bool, debounce: DebounceState, now: DateTime<Utc>) -> Self {
        let last_on = if is_on && (!self.is_on || self.last_on.is_none()) {
            Some(now)
        } else {
            self.last_on
        };
        let last_off = if !is_on && self.is_on {
            Some(now)
        } else {
            self.last_off
        };
        Self {
            is_on,
            debounce,
            last_on,
            last_off,
        }
    }

    pub fn switched_off(self, now: DateTime<Utc>) -> Self {
        self.with_outcome(false, DebounceState::Idle, now)
    }

    /// Seconds since the device was last switched on
    pub fn on_for(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_on
            .map(|at| (now - at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Runtime state of all devices of one entry, keyed by device id
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    devices: HashMap<String, DeviceRuntimeState>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a device; devices never seen before start off
    pub fn get(&self, device_id: &str) -> DeviceRuntimeState {
        self.devices.get(device_id).copied().unwrap_or_default()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn commit(&mut self, device_id: &str, state: DeviceRuntimeState) {
        self.devices.insert(device_id.to_owned(), state);
    }

    /// Drop state of devices that are no longer configured
    pub fn retain<'a>(&mut self, device_ids: impl IntoIterator<Item = &'a str>) {
        let keep: Vec<&str> = device_ids.into_iter().collect();
        self.devices.retain(|id, _| keep.contains(&id.as_str()));
    }

    pub fn mark_all_off(&mut self, now: DateTime<Utc>) {
        for state in self.devices.values_mut() {
            *state = state.switched_off(now);
            state.last_off = Some(now);
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_zero_debounce_commits_immediately() {
        let outcome = DebounceState::Idle.step(false, true, 0, t(0));
        assert!(outcome.committed);
        assert_eq!(outcome.state, DebounceState::Idle);

        let outcome = DebounceState::Idle.step(true, false, 0, t(0));
        assert!(!outcome.committed);
    }

    #[test]
    fn test_candidate_must_hold_for_debounce_interval() {
        let first = DebounceState::Idle.step(false, true, 15, t(0));
        assert!(!first.committed);
        assert_eq!(
            first.state,
            DebounceState::Pending {
                target: true,
                since: t(0)
            }
        );

        let early = first.state.step(false, true, 15, t(10));
        assert!(!early.committed);
        assert!(early.state.is_pending());

        let done = early.state.step(false, true, 15, t(15));
        assert!(done.committed);
        assert_eq!(done.state, DebounceState::Idle);
    }

    #[test]
    fn test_flapping_candidate_resets_timer() {
        let pending = DebounceState::Idle.step(false, true, 15, t(0)).state;
        let back = pending.step(false, false, 15, t(10));
        assert_eq!(back.state, DebounceState::Idle);
        assert!(!back.committed);

        let again = back.state.step(false, true, 15, t(12)).state;
        let not_yet = again.step(false, true, 15, t(20));
        assert!(!not_yet.committed);
    }

    #[test]
    fn test_pending_for_other_target_restarts() {
        let pending = DebounceState::Pending {
            target: false,
            since: t(0),
        };
        // current_on = false, so a pending "off" is stale; candidate "on" restarts
        let outcome = pending.step(false, true, 5, t(30));
        assert_eq!(
            outcome.state,
            DebounceState::Pending {
                target: true,
                since: t(30)
            }
        );
        assert!(!outcome.committed);
    }

    #[test]
    fn test_outcome_records_transitions() {
        let off = DeviceRuntimeState::default();
        let on = off.with_outcome(true, DebounceState::Idle, t(0));
        assert_eq!(on.last_on, Some(t(0)));
        assert_eq!(on.last_off, None);

        let still_on = on.with_outcome(true, DebounceState::Idle, t(10));
        assert_eq!(still_on.last_on, Some(t(0)));
        assert!((still_on.on_for(t(10)).unwrap() - 10.0).abs() < 1e-9);

        let switched = still_on.with_outcome(false, DebounceState::Idle, t(20));
        assert_eq!(switched.last_off, Some(t(20)));
        assert_eq!(switched.last_on, Some(t(0)));
    }

    #[test]
    fn test_retain_and_mark_all_off() {
        let mut runtime = RuntimeState::new();
        let on = DeviceRuntimeState::default().with_outcome(true, DebounceState::Idle, t(0));
        runtime.commit("a", on);
        runtime.commit("b", on);

        runtime.retain(["a"]);
        assert!(runtime.contains("a"));
        assert!(!runtime.contains("b"));

        runtime.mark_all_off(t(5));
        let a = runtime.get("a");
        assert!(!a.is_on);
        assert_eq!(a.last_off, Some(t(5)));
        assert!(!runtime.get("unknown").is_on);
    }
}
