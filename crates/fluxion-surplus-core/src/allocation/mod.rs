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

//! Priority-ordered allocation of excess power to devices.
//!
//! One call to [`AllocationEngine::evaluate`] is one cycle. Devices are
//! visited from the highest priority down; each one passes through
//!
//! 1. the filter (command target, entity availability, schedule),
//! 2. the hysteresis threshold,
//! 3. the debounce state machine,
//! 4. the minimum on-time guard,
//! 5. dispatch by [`DeviceKind`],
//!
//! and consumes what it was allocated from the running remainder.

pub mod runtime;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fluxion_surplus_types::{
    AllocationPolicy, AllocationResult, AllocationStrategy, CommandTarget, DeviceAction,
    DeviceCommand, DeviceConfig, DeviceKind, DeviceStatus, EntityDomain, EntityState, RelayMode,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::schedule;
use crate::traits::EntityController;

pub use runtime::{DebounceOutcome, DebounceState, DeviceRuntimeState, RuntimeState};

/// Allocations below this are reported as zero
pub const ALLOCATION_EPSILON: f64 = 1e-9;

/// Lowest percent a proportional device is driven at while active
pub const MIN_PROPORTIONAL_PERCENT: f64 = 5.0;

pub const MAX_PERCENT: f64 = 100.0;

pub const REASON_UNSUPPORTED_TARGET: &str = "Unsupported or missing entity_id";
pub const REASON_UNAVAILABLE: &str = "Entity unavailable or not found";
pub const REASON_OUTSIDE_SCHEDULE: &str = "Outside of schedule";
pub const REASON_MODE_UNAVAILABLE: &str = "Relay mode unavailable";
pub const REASON_NO_MAX_POWER: &str = "No maximum power configured for proportional control";

/// Hysteresis check: on at `min_expected`, off below `min_expected - hysteresis`
pub fn is_candidate_active(available_w: f64, was_on: bool, min_expected_w: f64, hysteresis_w: f64) -> bool {
    let on_threshold = min_expected_w;
    let off_threshold = (min_expected_w - hysteresis_w).max(0.0);
    available_w >= if was_on { off_threshold } else { on_threshold }
}

/// Power ceiling used for percent control of a proportional device
pub fn proportional_max_w(device: &DeviceConfig) -> f64 {
    let max = device.max_expected_w.unwrap_or(0.0);
    if max <= device.min_expected_w {
        device.min_expected_w * 1.1
    } else {
        max
    }
}

/// What was read about a device before the cycle started
#[derive(Debug)]
struct Observation {
    target: Option<CommandTarget>,
    entity: Option<EntityState>,
    mode: Option<RelayMode>,
    in_schedule: bool,
}

impl Observation {
    fn filter_reason(&self) -> Option<&'static str> {
        if self.target.is_none() {
            Some(REASON_UNSUPPORTED_TARGET)
        } else if self.entity.is_none() {
            Some(REASON_UNAVAILABLE)
        } else if !self.in_schedule {
            Some(REASON_OUTSIDE_SCHEDULE)
        } else {
            None
        }
    }

    fn observed_on(&self) -> bool {
        self.entity.as_ref().is_some_and(EntityState::is_on)
    }
}

/// Per-device step after the on/off decision is settled
struct Decision {
    is_on: bool,
    was_on: bool,
    /// Kept on by the minimum on-time guard
    held: bool,
}

/// Output of dispatching one device
struct Dispatched {
    allocated_w: f64,
    /// Where the device actually is; unchanged when its switch command failed
    is_on: bool,
    switch_failed: bool,
}

impl Dispatched {
    fn off(deactivate_failed: bool) -> Self {
        Self {
            allocated_w: 0.0,
            is_on: deactivate_failed,
            switch_failed: deactivate_failed,
        }
    }

    fn on(allocated_w: f64, activate_failed: bool) -> Self {
        Self {
            allocated_w,
            is_on: !activate_failed,
            switch_failed: activate_failed,
        }
    }
}

/// Seconds the device has been on while still inside its minimum on-time
fn within_min_on_time(
    device: &DeviceConfig,
    state: &DeviceRuntimeState,
    now: DateTime<Utc>,
) -> Option<f64> {
    if device.min_on_time_secs == 0 {
        return None;
    }
    state
        .on_for(now)
        .filter(|elapsed| *elapsed < device.min_on_time_secs as f64)
}

/// Allocation engine of one entry
#[derive(Debug)]
pub struct AllocationEngine {
    runtime: RuntimeState,
    timezone: Tz,
}

impl AllocationEngine {
    pub fn new(timezone: Tz) -> Self {
        Self {
            runtime: RuntimeState::new(),
            timezone,
        }
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn device_state(&self, device_id: &str) -> DeviceRuntimeState {
        self.runtime.get(device_id)
    }

    /// Forget everything about devices that are no longer configured
    pub fn retain_devices(&mut self, devices: &[DeviceConfig]) {
        self.runtime.retain(devices.iter().map(|d| d.id.as_str()));
    }

    /// Record that every device was forced off
    pub fn mark_all_off(&mut self, now: DateTime<Utc>) {
        self.runtime.mark_all_off(now);
    }

    /// Adopt an externally established on/off state, e.g. after a restore
    pub fn assume_state(&mut self, device_id: &str, is_on: bool, now: DateTime<Utc>) {
        let state = self
            .runtime
            .get(device_id)
            .with_outcome(is_on, DebounceState::Idle, now);
        self.runtime.commit(device_id, state);
    }

    /// Run one allocation cycle
    pub async fn evaluate(
        &mut self,
        excess_w: f64,
        now: DateTime<Utc>,
        devices: &[DeviceConfig],
        policy: &AllocationPolicy,
        controller: &dyn EntityController,
    ) -> AllocationResult {
        let mut result = AllocationResult::empty(excess_w, now);

        let mut candidates: Vec<&DeviceConfig> = devices.iter().filter(|d| d.auto_control).collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let local_now = schedule::local_time(now, self.timezone);
        let mut observations = Vec::with_capacity(candidates.len());
        for device in &candidates {
            observations.push(observe(device, controller, local_now).await);
        }

        let shares = match policy.strategy {
            AllocationStrategy::DistributeEvenly => {
                self.distribute_evenly(excess_w, &candidates, &observations, policy)
            }
            AllocationStrategy::FillOneByOne => HashMap::new(),
        };

        let mut remaining = excess_w;
        for (device, observation) in candidates.iter().zip(&observations) {
            let mut status = DeviceStatus::for_device(device);
            status.mode = observation.mode;
            let allocated = self
                .step_device(
                    device,
                    observation,
                    remaining,
                    shares.get(device.id.as_str()).copied(),
                    policy,
                    now,
                    controller,
                    &mut status,
                    &mut result,
                )
                .await;
            remaining -= allocated;
            result.allocation.insert(device.id.clone(), allocated);
            result.devices.insert(device.id.clone(), status);
        }

        for allocated in result.allocation.values_mut() {
            if allocated.abs() < ALLOCATION_EPSILON {
                *allocated = 0.0;
            }
        }
        result.remaining_power = remaining;
        result.allocated_power = excess_w - remaining;

        info!(
            "⚡ [ALLOCATION] excess={:.1}W allocated={:.1}W remaining={:.1}W active=[{}]",
            excess_w,
            result.allocated_power,
            remaining,
            result.active_devices().collect::<Vec<_>>().join(", ")
        );

        result
    }

    /// Shares of the total excess for active proportional devices, weighted by their max power
    fn distribute_evenly(
        &self,
        excess_w: f64,
        candidates: &[&DeviceConfig],
        observations: &[Observation],
        policy: &AllocationPolicy,
    ) -> HashMap<String, f64> {
        let eligible: Vec<(&str, f64)> = candidates
            .iter()
            .zip(observations)
            .filter(|(device, observation)| {
                device.kind == DeviceKind::Proportional
                    && observation.mode == Some(RelayMode::Proportional)
                    && observation.filter_reason().is_none()
                    && is_candidate_active(
                        excess_w,
                        self.runtime.get(&device.id).is_on,
                        device.min_expected_w,
                        policy.hysteresis_w,
                    )
            })
            .map(|(device, _)| (device.id.as_str(), proportional_max_w(device)))
            .collect();

        let total_max: f64 = eligible.iter().map(|(_, max)| max).sum();
        if total_max <= 0.0 {
            return HashMap::new();
        }

        eligible
            .into_iter()
            .map(|(id, max)| (id.to_owned(), excess_w * max / total_max))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn step_device(
        &mut self,
        device: &DeviceConfig,
        observation: &Observation,
        remaining: f64,
        share: Option<f64>,
        policy: &AllocationPolicy,
        now: DateTime<Utc>,
        controller: &dyn EntityController,
        status: &mut DeviceStatus,
        result: &mut AllocationResult,
    ) -> f64 {
        let previous = self.runtime.get(&device.id);

        if let Some(reason) = observation.filter_reason() {
            debug!("Device '{}' skipped: {}", device.name, reason);
            status.refuse(reason);

            if reason == REASON_OUTSIDE_SCHEDULE {
                let deactivate_failed = match &observation.target {
                    Some(target) if observation.observed_on() => !deactivate(controller, target).await,
                    Some(_) | None => false,
                };
                let next = if deactivate_failed {
                    previous
                } else {
                    previous.switched_off(now)
                };
                self.runtime.commit(&device.id, next);
                status.is_on = next.is_on;
                fill_timestamps(status, &next);
            } else {
                status.is_on = previous.is_on;
                fill_timestamps(status, &previous);
            }
            return 0.0;
        }

        let Some(target) = observation.target.as_ref() else {
            return 0.0;
        };

        if device.kind == DeviceKind::Proportional && observation.mode.is_none() {
            debug!("Device '{}' has no readable relay mode", device.name);
            status.refuse(REASON_MODE_UNAVAILABLE);
            status.is_on = previous.is_on;
            fill_timestamps(status, &previous);
            return 0.0;
        }

        let remaining = remaining.max(0.0);
        let candidate = is_candidate_active(
            remaining,
            previous.is_on,
            device.min_expected_w,
            policy.hysteresis_w,
        );
        status.is_active_candidate = candidate;

        let DebounceOutcome { state: debounce, committed } =
            previous
                .debounce
                .step(previous.is_on, candidate, device.debounce_secs, now);

        let mut decision = Decision {
            is_on: committed,
            was_on: previous.is_on,
            held: false,
        };

        if decision.was_on
            && !decision.is_on
            && let Some(elapsed) = within_min_on_time(device, &previous, now)
        {
            decision.is_on = true;
            decision.held = true;
            status.refuse(format!(
                "Minimum on-time not yet elapsed: {elapsed:.1}s < {}s",
                device.min_on_time_secs
            ));
            debug!("Device '{}' kept on by minimum on-time", device.name);
        }

        let dispatched = match device.kind {
            DeviceKind::Standard | DeviceKind::Thermostat => {
                dispatch_switched(device, target, &decision, remaining, controller, status).await
            }
            DeviceKind::Proportional => match observation.mode {
                Some(RelayMode::On) => {
                    dispatch_switched(device, target, &decision, remaining, controller, status).await
                }
                Some(RelayMode::Proportional) => {
                    let power = share.unwrap_or(remaining);
                    dispatch_proportional(
                        device, target, &decision, power, remaining, controller, status, result,
                    )
                    .await
                }
                Some(RelayMode::Off) | None => Dispatched::off(
                    decision.was_on && !deactivate(controller, target).await,
                ),
            },
        };

        let debounce = if dispatched.switch_failed {
            // Retry the same transition next cycle
            previous.debounce
        } else if dispatched.is_on == decision.is_on {
            debounce
        } else {
            DebounceState::Idle
        };
        let next = previous.with_outcome(dispatched.is_on, debounce, now);
        self.runtime.commit(&device.id, next);

        status.is_on = next.is_on;
        status.allocated_w = dispatched.allocated_w;
        fill_timestamps(status, &next);

        debug!(
            "Device '{}': candidate={} on={} allocated={:.1}W",
            device.name, candidate, next.is_on, dispatched.allocated_w
        );

        dispatched.allocated_w
    }
}

async fn observe(
    device: &DeviceConfig,
    controller: &dyn EntityController,
    local_now: chrono::NaiveDateTime,
) -> Observation {
    let target = match device.command_target() {
        Ok(target) if device.kind == DeviceKind::Thermostat && target.domain != EntityDomain::Climate => {
            warn!(
                "Device '{}' skipped: thermostat target {} is not a climate entity",
                device.name, target.entity_id
            );
            None
        }
        Ok(target) => Some(target),
        Err(e) => {
            warn!("Device '{}' skipped: {}", device.name, e);
            None
        }
    };

    let entity = match &target {
        Some(target) => controller.read_available(&target.entity_id).await,
        None => None,
    };

    let mode = match (&device.kind, &device.mode_select_entity) {
        (DeviceKind::Proportional, Some(select)) => controller
            .read_available(select)
            .await
            .and_then(|state| state.as_relay_mode()),
        _ => None,
    };

    Observation {
        target,
        entity,
        mode,
        in_schedule: schedule::is_in_schedule(device.schedule.as_ref(), local_now),
    }
}

/// On/off dispatch shared by standard devices, thermostats and relays in mode "on"
async fn dispatch_switched(
    device: &DeviceConfig,
    target: &CommandTarget,
    decision: &Decision,
    remaining: f64,
    controller: &dyn EntityController,
    status: &mut DeviceStatus,
) -> Dispatched {
    if decision.is_on {
        let sent = dispatch(controller, DeviceCommand::for_target(target, DeviceAction::Activate)).await;
        status.percent_target = MAX_PERCENT;
        status.percent_actual = MAX_PERCENT;
        Dispatched::on(
            remaining.min(device.power_cap_w()).max(0.0),
            !sent && !decision.was_on,
        )
    } else {
        Dispatched::off(decision.was_on && !deactivate(controller, target).await)
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_proportional(
    device: &DeviceConfig,
    target: &CommandTarget,
    decision: &Decision,
    power: f64,
    remaining: f64,
    controller: &dyn EntityController,
    status: &mut DeviceStatus,
    result: &mut AllocationResult,
) -> Dispatched {
    let max_w = proportional_max_w(device);
    let dimmable = target.domain.is_dimmable();

    if decision.is_on && max_w <= 0.0 {
        warn!(
            "Device '{}' is proportional but has no maximum power; forcing off",
            device.name
        );
        status.refuse(REASON_NO_MAX_POWER);
    }

    if !decision.is_on || max_w <= 0.0 {
        if dimmable {
            result.ramp_targets.insert(target.entity_id.clone(), 0.0);
            return Dispatched::off(false);
        }
        return Dispatched::off(decision.was_on && !deactivate(controller, target).await);
    }

    let percent = (power / max_w * MAX_PERCENT).clamp(MIN_PROPORTIONAL_PERCENT, MAX_PERCENT);
    status.percent_target = percent;

    let mut activate_failed = false;
    if dimmable {
        result.ramp_targets.insert(target.entity_id.clone(), percent);
    } else {
        status.percent_actual = percent;
        if !decision.was_on || decision.held {
            let sent =
                dispatch(controller, DeviceCommand::for_target(target, DeviceAction::Activate)).await;
            activate_failed = !sent && !decision.was_on;
        }
    }

    debug!(
        "Proportional target for '{}': {percent:.1}% of {max_w:.0}W (power {power:.1}W)",
        device.name
    );

    let allocated_w = power.min(max_w * percent / MAX_PERCENT).min(remaining).max(0.0);
    Dispatched::on(allocated_w, activate_failed)
}

fn fill_timestamps(status: &mut DeviceStatus, state: &DeviceRuntimeState) {
    status.last_on = state.last_on;
    status.last_off = state.last_off;
}

/// Switch a device off; true when the command went through
async fn deactivate(controller: &dyn EntityController, target: &CommandTarget) -> bool {
    dispatch(controller, DeviceCommand::for_target(target, DeviceAction::Deactivate)).await
}

/// Send a command; failures are logged and reported as `false`
async fn dispatch(controller: &dyn EntityController, command: DeviceCommand) -> bool {
    debug!("📞 [{}] {}", controller.name(), command);
    match controller.execute(&command).await {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ Command {} failed: {:#}", command, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis_thresholds() {
        // on at 100, off below 80
        assert!(is_candidate_active(100.0, false, 100.0, 20.0));
        assert!(!is_candidate_active(99.0, false, 100.0, 20.0));
        assert!(is_candidate_active(80.0, true, 100.0, 20.0));
        assert!(!is_candidate_active(79.0, true, 100.0, 20.0));
    }

    #[test]
    fn test_off_threshold_never_negative() {
        assert!(is_candidate_active(0.0, true, 10.0, 40.0));
        assert!(!is_candidate_active(-1.0, true, 10.0, 40.0));
    }

    #[test]
    fn test_proportional_max_falls_back_above_minimum() {
        let mut device = DeviceConfig::new("heater", "Heater");
        device.min_expected_w = 100.0;
        assert!((proportional_max_w(&device) - 110.0).abs() < 1e-9);

        device.max_expected_w = Some(2000.0);
        assert!((proportional_max_w(&device) - 2000.0).abs() < 1e-9);
    }
}
