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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::DeviceConfig;
use crate::control::RelayMode;

/// Per-device status produced by one evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub priority: i32,
    pub entity_id: Option<String>,
    pub mode_entity_id: Option<String>,
    pub mode: Option<RelayMode>,
    pub percent_target: f64,
    pub percent_actual: f64,
    pub allocated_w: f64,
    pub min_expected_w: f64,
    pub max_expected_w: Option<f64>,
    pub min_on_time_secs: u64,
    pub refusal_reasons: Vec<String>,
    pub is_active_candidate: bool,
    pub is_on: bool,
    pub last_on: Option<DateTime<Utc>>,
    pub last_off: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    pub fn for_device(device: &DeviceConfig) -> Self {
        Self {
            name: device.name.clone(),
            priority: device.priority,
            entity_id: device.entity.clone(),
            mode_entity_id: device.mode_select_entity.clone(),
            mode: None,
            percent_target: 0.0,
            percent_actual: 0.0,
            allocated_w: 0.0,
            min_expected_w: device.min_expected_w,
            max_expected_w: device.max_expected_w,
            min_on_time_secs: device.min_on_time_secs,
            refusal_reasons: Vec::new(),
            is_active_candidate: false,
            is_on: false,
            last_on: None,
            last_off: None,
        }
    }

    pub fn refuse(&mut self, reason: impl Into<String>) {
        self.refusal_reasons.push(reason.into());
    }
}

/// Outcome of one allocation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Excess power the cycle started with
    pub total_power: f64,
    pub remaining_power: f64,
    pub allocated_power: f64,
    /// Allocated watts by device id
    pub allocation: BTreeMap<String, f64>,
    pub devices: BTreeMap<String, DeviceStatus>,
    /// Percent targets forwarded to the ramp controller, by entity id
    pub ramp_targets: BTreeMap<String, f64>,
    pub evaluated_at: DateTime<Utc>,
}

impl AllocationResult {
    pub fn empty(total_power: f64, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            total_power,
            remaining_power: total_power,
            allocated_power: 0.0,
            allocation: BTreeMap::new(),
            devices: BTreeMap::new(),
            ramp_targets: BTreeMap::new(),
            evaluated_at,
        }
    }

    pub fn allocated_to(&self, device_id: &str) -> f64 {
        self.allocation.get(device_id).copied().unwrap_or(0.0)
    }

    /// Devices that ended the cycle switched on
    pub fn active_devices(&self) -> impl Iterator<Item = &str> {
        self.devices
            .iter()
            .filter(|(_, status)| status.is_on)
            .map(|(id, _)| id.as_str())
    }
}
