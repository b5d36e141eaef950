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

use fluxion_surplus_types::EntryConfig;
use tracing::debug;

use crate::excess::{ExcessCalculator, ExcessReport, TelemetrySnapshot};
use crate::traits::EntityController;

/// Read a numeric sensor, `None` when unavailable or not a number
pub async fn read_number(controller: &dyn EntityController, entity_id: &str) -> Option<f64> {
    let state = controller.read_available(entity_id).await?;
    let value = state.as_f64();
    if value.is_none() {
        debug!("Sensor {} has non-numeric state '{}'", entity_id, state.state);
    }
    value
}

/// Read an optional sensor, treating anything unreadable as 0
async fn read_or_zero(controller: &dyn EntityController, entity_id: Option<&str>) -> f64 {
    match entity_id {
        Some(entity_id) => read_number(controller, entity_id).await.unwrap_or(0.0),
        None => 0.0,
    }
}

/// Read the entry's sensors into a snapshot
///
/// Returns `None` when PV power cannot be read; such a cycle is not a valid
/// observation.
pub async fn read_snapshot(
    controller: &dyn EntityController,
    entry: &EntryConfig,
) -> Option<TelemetrySnapshot> {
    let sensors = &entry.sensors;

    let Some(pv_power_w) = read_number(controller, &sensors.pv_power).await else {
        debug!("🔍 [TELEMETRY] {}: PV power unavailable", entry.id);
        return None;
    };

    let pv_voltage_v = read_or_zero(controller, sensors.pv_voltage.as_deref()).await;
    let battery_power_w = read_or_zero(controller, sensors.battery_power.as_deref()).await;

    let consumption_w = match &sensors.consumption {
        Some(entity_id) => Some(read_number(controller, entity_id).await.unwrap_or(0.0)),
        None => None,
    };

    let temperature_c = match (entry.temperature.enabled, entry.temperature.sensor.as_deref()) {
        (true, Some(entity_id)) => read_number(controller, entity_id).await,
        _ => None,
    };

    Some(TelemetrySnapshot {
        pv_power_w,
        pv_voltage_v,
        consumption_w,
        battery_power_w,
        temperature_c,
    })
}

/// Read telemetry and compute the entry's excess power
pub async fn observe_excess(
    controller: &dyn EntityController,
    entry: &EntryConfig,
) -> Option<ExcessReport> {
    let snapshot = read_snapshot(controller, entry).await?;
    let report = ExcessCalculator::new(&entry.panel, &entry.policy, &entry.temperature)
        .calculate(&snapshot);

    debug!(
        "🔍 [TELEMETRY] {}: PV={:.1}W V={:.1} battery={:.1}W -> excess {:.1}W ({:?})",
        entry.id,
        snapshot.pv_power_w,
        snapshot.pv_voltage_v,
        snapshot.battery_power_w,
        report.excess_w,
        report.mode
    );

    Some(report)
}
