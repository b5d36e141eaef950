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

//! PV curve model.
//!
//! Estimates how much power an array could deliver right now from the
//! operating point reported by the inverter. When the inverter is curtailed the
//! array sits between Vmp and Voc; the distance from Vmp tells us how much
//! headroom is left untapped.

use fluxion_surplus_types::{
    PanelArrayConfig, PanelParameters, PanelTopology, TemperatureCompensation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Number of parallel strings in a parallel-series array
const STRING_COUNT: f64 = 2.0;

/// Curve-model tuning knobs of one array
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveTuning {
    /// Exponent of the empirical current-ratio curve below MPP
    pub curve_factor_k: f64,
    pub efficiency_factor: f64,
    pub min_inverter_voltage: f64,
}

impl From<&PanelArrayConfig> for CurveTuning {
    fn from(panel: &PanelArrayConfig) -> Self {
        Self {
            curve_factor_k: panel.curve_factor_k,
            efficiency_factor: panel.efficiency_correction_factor,
            min_inverter_voltage: panel.min_inverter_voltage,
        }
    }
}

/// Which branch of the model produced the estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationReason {
    NoPower,
    InvalidVoltage,
    AboveOpenCircuit,
    HarvestingImpossible,
    BelowMpp,
    BetweenMppAndVoc,
}

impl CalculationReason {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoPower => "PV power is zero or negative",
            Self::InvalidVoltage => "Invalid voltage or Vmp",
            Self::AboveOpenCircuit => "Voltage at or above Voc",
            Self::HarvestingImpossible => "Energy harvesting not possible",
            Self::BelowMpp => "Below or at MPP",
            Self::BetweenMppAndVoc => "Between Vmp and Voc (back-estimated irradiance)",
        }
    }
}

impl fmt::Display for CalculationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveDiagnostics {
    pub pmax: f64,
    pub light_factor: f64,
    pub min_system_voltage: f64,
    pub energy_harvesting_possible: bool,
    pub relative_voltage: f64,
    pub voc_ratio: f64,
    pub reason: CalculationReason,
}

impl CurveDiagnostics {
    fn no_power() -> Self {
        Self {
            pmax: 0.0,
            light_factor: 0.0,
            min_system_voltage: 0.0,
            energy_harvesting_possible: false,
            relative_voltage: 0.0,
            voc_ratio: 0.0,
            reason: CalculationReason::NoPower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaxPowerEstimate {
    pub max_power_w: f64,
    pub diagnostics: CurveDiagnostics,
}

/// Estimate the current maximum deliverable power of an array
///
/// The result is never lower than `power`, the power already being produced.
pub fn estimate_max_power(
    voltage: f64,
    power: f64,
    panel: &PanelParameters,
    tuning: &CurveTuning,
    temperature: Option<&TemperatureCompensation>,
) -> MaxPowerEstimate {
    if power <= 0.0 {
        return MaxPowerEstimate {
            max_power_w: 0.0,
            diagnostics: CurveDiagnostics::no_power(),
        };
    }

    let mut vmp = panel.vmp;
    let mut imp = panel.imp;
    let mut voc = panel.voc;
    let isc = panel.isc;

    if let Some(comp) = temperature {
        let dt = comp.temp_delta_c;
        voc = round_to(voc * (1.0 + comp.voc_coefficient * dt), 3);
        vmp = round_to(vmp * (1.0 + comp.voc_coefficient * dt), 3);
        imp = round_to(
            imp * (1.0 + comp.pmax_coefficient * dt + comp.voc_coefficient * dt),
            3,
        );
        debug!("Applied temperature compensation: temp_diff={dt:.1}°C");
    }

    let pmax = calculate_pmax(vmp, imp, panel.panel_count, panel.topology);

    let light_factor = if pmax > 0.0 {
        (power / pmax).clamp(0.1, 1.0)
    } else {
        0.1
    };

    let min_system_voltage = tuning.min_inverter_voltage;
    let energy_harvesting_possible = voltage >= min_system_voltage;
    let relative_voltage = relative_voltage(voltage, vmp, panel.panel_count, panel.topology);

    let mut voc_ratio = if vmp > 0.0 { voc / vmp } else { 1.2 };
    if (voc_ratio - 1.0).abs() < f64::EPSILON {
        voc_ratio = 1.01;
        debug!("Adjusted voc_ratio from 1.0 to {voc_ratio:.2}");
    }

    let mut reported_light_factor = light_factor;
    let (max_power, reason) = if voltage <= 0.0 || vmp <= 0.0 {
        (0.0, CalculationReason::InvalidVoltage)
    } else if relative_voltage >= voc_ratio {
        (0.0, CalculationReason::AboveOpenCircuit)
    } else if !energy_harvesting_possible {
        (0.0, CalculationReason::HarvestingImpossible)
    } else if relative_voltage <= 1.0 {
        let imp_isc = if isc > 0.0 { imp / isc } else { 1.0 / 1.1 };
        let current_ratio = 1.0 - (1.0 - imp_isc) * relative_voltage.powf(tuning.curve_factor_k);
        (
            pmax * light_factor * relative_voltage * current_ratio * tuning.efficiency_factor,
            CalculationReason::BelowMpp,
        )
    } else {
        let light_estimate = back_estimate_light(
            relative_voltage,
            voc_ratio,
            light_factor,
            power,
            pmax,
            tuning.efficiency_factor,
        );
        reported_light_factor = light_estimate;
        (
            pmax * light_estimate * tuning.efficiency_factor,
            CalculationReason::BetweenMppAndVoc,
        )
    };

    let max_power_w = round_to(max_power.max(power), 1);

    debug!(
        "Curve model: V={voltage:.1} P={power:.1} pmax={pmax:.1} rv={relative_voltage:.3} -> {max_power_w:.1}W ({reason})"
    );

    MaxPowerEstimate {
        max_power_w,
        diagnostics: CurveDiagnostics {
            pmax,
            light_factor: reported_light_factor,
            min_system_voltage,
            energy_harvesting_possible,
            relative_voltage,
            voc_ratio,
            reason,
        },
    }
}

/// Estimate irradiance from an operating point between Vmp and Voc
///
/// The power factor drops quadratically with the position between Vmp (0)
/// and Voc (1); the drop is steeper in low light and near Voc.
fn back_estimate_light(
    relative_voltage: f64,
    voc_ratio: f64,
    light_factor: f64,
    power: f64,
    pmax: f64,
    efficiency: f64,
) -> f64 {
    let span = voc_ratio - 1.0;
    let position = if span.abs() < 0.001 {
        (relative_voltage - 1.0) * 10.0
    } else if span > 0.0 {
        (relative_voltage - 1.0) / span
    } else {
        0.0
    };

    let mut drop_rate = (1.5 / light_factor.sqrt()).min(3.0);
    if position > 0.9 {
        let penalty = ((position - 0.9) / 0.1).powi(2);
        drop_rate += penalty * 2.0;
    }

    let floor = if position <= 0.98 { 0.05 } else { 0.0 };
    let power_factor = (1.0 - drop_rate * position.powi(2)).max(floor);

    if pmax > 0.0 && power_factor > 0.1 {
        (power / (pmax * power_factor * efficiency)).clamp(0.1, 1.0)
    } else {
        light_factor
    }
}

/// Theoretical maximum power of the array at STC, rounded to two decimals
pub fn calculate_pmax(vmp: f64, imp: f64, panel_count: u32, topology: PanelTopology) -> f64 {
    let count = f64::from(panel_count);
    let pmax = match topology {
        PanelTopology::Series => (vmp * count) * imp,
        PanelTopology::Parallel => vmp * (imp * count),
        PanelTopology::ParallelSeries => {
            if !panel_count.is_multiple_of(2) {
                warn!(
                    "Panel count {panel_count} is not evenly divisible by 2 for parallel-series configuration"
                );
            }
            (vmp * (count / STRING_COUNT)) * (imp * STRING_COUNT)
        }
    };
    round_to(pmax, 2)
}

/// Measured voltage relative to the array's Vmp for the given wiring
pub fn relative_voltage(voltage: f64, vmp: f64, panel_count: u32, topology: PanelTopology) -> f64 {
    let count = f64::from(panel_count);
    let array_vmp = match topology {
        PanelTopology::Series => vmp * count,
        PanelTopology::ParallelSeries => vmp * (count / STRING_COUNT),
        PanelTopology::Parallel => vmp,
    };
    if array_vmp > 0.0 {
        voltage / array_vmp
    } else {
        0.0
    }
}

/// Share of the theoretical maximum currently produced, in percent
pub fn usage_percent(actual_power: f64, pmax: f64) -> f64 {
    if pmax > 0.0 {
        round_to(actual_power / pmax * 100.0, 1)
    } else {
        0.0
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 10 panels of 40 V / 10 A in series, pmax 4000 W
    fn series_array() -> PanelParameters {
        PanelArrayConfig {
            vmp: 40.0,
            imp: 10.0,
            panel_count: 10,
            topology: PanelTopology::Series,
            ..Default::default()
        }
        .parameters()
    }

    fn default_tuning() -> CurveTuning {
        CurveTuning::from(&PanelArrayConfig::default())
    }

    #[test]
    fn test_zero_power_short_circuits() {
        let estimate = estimate_max_power(0.0, 0.0, &series_array(), &default_tuning(), None);
        assert!(estimate.max_power_w.abs() < f64::EPSILON);
        assert_eq!(estimate.diagnostics.reason, CalculationReason::NoPower);
        assert_eq!(
            estimate.diagnostics.reason.to_string(),
            "PV power is zero or negative"
        );
        assert!(!estimate.diagnostics.energy_harvesting_possible);
    }

    #[test]
    fn test_estimate_never_below_measured_power() {
        let panel = series_array();
        let tuning = default_tuning();
        for voltage in [0.0, 50.0, 150.0, 300.0, 399.0, 400.0, 420.0, 450.0, 479.0, 480.0, 600.0] {
            for power in [1.0, 250.0, 1000.0, 2500.0, 4200.0] {
                let estimate = estimate_max_power(voltage, power, &panel, &tuning, None);
                assert!(
                    estimate.max_power_w >= power - 0.05,
                    "V={voltage} P={power} -> {}",
                    estimate.max_power_w
                );
            }
        }
    }

    #[test]
    fn test_between_mpp_and_voc_projects_to_mpp() {
        // rv = 1.1, position 0.5, light factor 0.25 -> drop rate capped at 3.0,
        // power factor 0.25, back-estimated light 1000 / 1050
        let estimate = estimate_max_power(440.0, 1000.0, &series_array(), &default_tuning(), None);
        assert_eq!(estimate.diagnostics.reason, CalculationReason::BetweenMppAndVoc);
        assert!((estimate.max_power_w - 4000.0).abs() < 0.05);
        assert!((estimate.diagnostics.light_factor - 1000.0 / 1050.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_mpp_keeps_measured_power() {
        let estimate = estimate_max_power(400.0, 2000.0, &series_array(), &default_tuning(), None);
        assert_eq!(estimate.diagnostics.reason, CalculationReason::BelowMpp);
        assert!((estimate.max_power_w - 2000.0).abs() < 0.05);
        assert!((estimate.diagnostics.relative_voltage - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_voltage_at_voc_and_below_inverter_minimum() {
        let panel = series_array();
        let at_voc = estimate_max_power(480.0, 300.0, &panel, &default_tuning(), None);
        assert_eq!(at_voc.diagnostics.reason, CalculationReason::AboveOpenCircuit);
        assert!((at_voc.max_power_w - 300.0).abs() < 0.05);

        let too_low = estimate_max_power(90.0, 300.0, &panel, &default_tuning(), None);
        assert_eq!(too_low.diagnostics.reason, CalculationReason::HarvestingImpossible);
        assert!(!too_low.diagnostics.energy_harvesting_possible);
    }

    #[test]
    fn test_pmax_per_topology() {
        assert!((calculate_pmax(40.0, 10.0, 2, PanelTopology::Parallel) - 800.0).abs() < 1e-9);
        assert!((calculate_pmax(40.0, 10.0, 4, PanelTopology::ParallelSeries) - 1600.0).abs() < 1e-9);
        assert!((calculate_pmax(40.0, 10.0, 3, PanelTopology::Series) - 1200.0).abs() < 1e-9);
        assert!((relative_voltage(80.0, 40.0, 4, PanelTopology::ParallelSeries) - 1.0).abs() < 1e-9);
        assert!((relative_voltage(40.0, 40.0, 4, PanelTopology::Parallel) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_voc_equal_to_vmp_is_nudged() {
        let panel = PanelParameters {
            voc: 40.0,
            ..series_array()
        };
        let estimate = estimate_max_power(400.0, 500.0, &panel, &default_tuning(), None);
        assert!((estimate.diagnostics.voc_ratio - 1.01).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_compensation_lowers_pmax() {
        let comp = TemperatureCompensation {
            temp_delta_c: 20.0,
            voc_coefficient: -0.003,
            pmax_coefficient: -0.004,
        };
        let estimate =
            estimate_max_power(350.0, 1000.0, &series_array(), &default_tuning(), Some(&comp));
        // vmp 37.6 V, imp 8.6 A
        assert!((estimate.diagnostics.pmax - 3233.6).abs() < 0.01);
    }

    #[test]
    fn test_usage_percent() {
        assert!((usage_percent(1000.0, 4000.0) - 25.0).abs() < 1e-9);
        assert!(usage_percent(1000.0, 0.0).abs() < f64::EPSILON);
    }
}
