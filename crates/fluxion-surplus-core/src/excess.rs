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

//! Excess power calculation.
//!
//! Two modes are supported:
//! - **Parallel**: a consumption sensor is available, excess is what the
//!   house does not use.
//! - **Curve**: no consumption sensor, excess is the untapped headroom of the
//!   array as estimated by [`crate::pv_model`].
//!
//! A positive reserve selects budget mode (the battery gets a fixed budget,
//! anything it charges above that is excess). A zero reserve selects battery
//! priority mode (all charging power is taken first).

use fluxion_surplus_types::{AllocationPolicy, PanelArrayConfig, TemperatureConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pv_model::{self, CurveTuning, MaxPowerEstimate};

/// Charging below this rate is treated as passive (float) charging
pub const PASSIVE_CHARGING_THRESHOLD_W: f64 = 50.0;

/// Excess above this is reported as usable
pub const EXCESS_POSSIBLE_THRESHOLD_W: f64 = 5.0;

/// Raw battery sensor reading plus its sign convention
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryFlow {
    pub raw_w: f64,
    /// When set the sensor reports charging as negative
    pub reversed: bool,
}

impl BatteryFlow {
    pub fn new(raw_w: f64, reversed: bool) -> Self {
        Self { raw_w, reversed }
    }

    /// Battery flow normalized to positive = charging
    pub fn charge_w(&self) -> f64 {
        if self.reversed { -self.raw_w } else { self.raw_w }
    }

    pub fn is_discharging(&self) -> bool {
        self.charge_w() < 0.0
    }
}

/// Excess from direct consumption telemetry
pub fn excess_parallel(
    pv_power_w: f64,
    consumption_w: f64,
    battery: BatteryFlow,
    reserve_w: f64,
    inverter_self_use_w: f64,
) -> f64 {
    let charge = battery.charge_w();

    let excess = if reserve_w > 0.0 {
        let mut effective_reserve = reserve_w;
        if charge > 0.0 && charge < PASSIVE_CHARGING_THRESHOLD_W {
            effective_reserve = reserve_w.min(charge);
            debug!(
                "Passive charging detected ({charge}W < {PASSIVE_CHARGING_THRESHOLD_W}W), effective reserve {reserve_w}W -> {effective_reserve}W"
            );
        }
        pv_power_w - consumption_w - effective_reserve - inverter_self_use_w
    } else {
        pv_power_w - consumption_w - charge.max(0.0) - inverter_self_use_w
    };

    debug!(
        "Parallel excess: PV={pv_power_w}W consumption={consumption_w}W charge={charge}W reserve={reserve_w}W self-use={inverter_self_use_w}W -> {excess}W"
    );

    excess.max(0.0)
}

/// Inputs of the curve-mode excess calculation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveExcessInput {
    pub estimated_max_power_w: f64,
    pub pv_power_w: f64,
    pub battery: BatteryFlow,
    pub consumption_w: Option<f64>,
    pub reserve_w: f64,
    pub inverter_self_use_w: f64,
    /// Topology guard inputs; `None` skips the guard
    pub relative_voltage: Option<f64>,
    pub harvesting_possible: Option<bool>,
}

/// Excess from the estimated maximum power of the array
pub fn excess_from_curve(input: &CurveExcessInput) -> f64 {
    if input.battery.is_discharging() {
        debug!("Battery discharging, no excess");
        return 0.0;
    }

    let guarded = input.relative_voltage.is_some_and(|rv| rv <= 1.0)
        || input.harvesting_possible == Some(false);

    let untapped = if guarded {
        0.0
    } else {
        (input.estimated_max_power_w - input.pv_power_w).max(0.0)
    };

    let charge = input.battery.charge_w().max(0.0);
    let budget = input.reserve_w > 0.0;
    let from_battery = if budget {
        (charge - input.reserve_w).max(0.0)
    } else {
        0.0
    };

    let excess = match input.consumption_w {
        None => untapped + from_battery - input.inverter_self_use_w,
        Some(consumption) => {
            let battery_draw = if budget { 0.0 } else { charge };
            let real = input.estimated_max_power_w
                - consumption
                - input.inverter_self_use_w
                - battery_draw;
            untapped.min(real.max(0.0)) + from_battery
        }
    };

    debug!(
        "Curve excess: untapped={untapped}W from battery={from_battery}W guarded={guarded} -> {excess}W"
    );

    excess.max(0.0)
}

/// One reading of the entry's telemetry
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub pv_power_w: f64,
    pub pv_voltage_v: f64,
    pub consumption_w: Option<f64>,
    /// Raw battery sensor value, before sign normalization
    pub battery_power_w: f64,
    pub temperature_c: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExcessMode {
    Parallel,
    Curve,
}

/// Result of one excess calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcessReport {
    pub excess_w: f64,
    pub mode: ExcessMode,
    pub snapshot: TelemetrySnapshot,
    pub estimate: Option<MaxPowerEstimate>,
    pub battery_discharging: bool,
    pub excess_possible: bool,
    pub usage_percent: Option<f64>,
}

/// Turns a telemetry snapshot into an excess report for one entry
#[derive(Debug, Clone, Copy)]
pub struct ExcessCalculator<'a> {
    pub panel: &'a PanelArrayConfig,
    pub policy: &'a AllocationPolicy,
    pub temperature: &'a TemperatureConfig,
}

impl<'a> ExcessCalculator<'a> {
    pub fn new(
        panel: &'a PanelArrayConfig,
        policy: &'a AllocationPolicy,
        temperature: &'a TemperatureConfig,
    ) -> Self {
        Self {
            panel,
            policy,
            temperature,
        }
    }

    pub fn calculate(&self, snapshot: &TelemetrySnapshot) -> ExcessReport {
        let battery = BatteryFlow::new(snapshot.battery_power_w, self.policy.battery_power_reversed);

        let (excess_w, mode, estimate, usage_percent) = match snapshot.consumption_w {
            Some(consumption) => (
                excess_parallel(
                    snapshot.pv_power_w,
                    consumption,
                    battery,
                    self.policy.reserve_battery_power_w,
                    self.policy.inverter_self_consumption_w,
                ),
                ExcessMode::Parallel,
                None,
                None,
            ),
            None => {
                let compensation = match (self.temperature.enabled, snapshot.temperature_c) {
                    (true, Some(temp)) => Some(self.temperature.compensation(temp)),
                    _ => None,
                };
                let estimate = pv_model::estimate_max_power(
                    snapshot.pv_voltage_v,
                    snapshot.pv_power_w,
                    &self.panel.parameters(),
                    &CurveTuning::from(self.panel),
                    compensation.as_ref(),
                );
                let excess = excess_from_curve(&CurveExcessInput {
                    estimated_max_power_w: estimate.max_power_w,
                    pv_power_w: snapshot.pv_power_w,
                    battery,
                    consumption_w: None,
                    reserve_w: self.policy.reserve_battery_power_w,
                    inverter_self_use_w: self.policy.inverter_self_consumption_w,
                    relative_voltage: None,
                    harvesting_possible: None,
                });
                let usage = pv_model::usage_percent(snapshot.pv_power_w, estimate.diagnostics.pmax);
                (excess, ExcessMode::Curve, Some(estimate), Some(usage))
            }
        };

        ExcessReport {
            excess_w,
            mode,
            snapshot: *snapshot,
            estimate,
            battery_discharging: battery.is_discharging(),
            excess_possible: excess_w > EXCESS_POSSIBLE_THRESHOLD_W,
            usage_percent,
        }
    }
}
