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

use anyhow::Result;
use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::control::{CommandTarget, TargetError};

/// Temperature at standard test conditions (°C)
pub const STANDARD_TEST_TEMPERATURE_C: f64 = 25.0;

// ============= Entry =============

/// One independently evaluated array with its sensors and devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub sensors: SensorConfig,
    #[serde(default)]
    pub panel: PanelArrayConfig,
    #[serde(default)]
    pub temperature: TemperatureConfig,
    #[serde(default)]
    pub policy: AllocationPolicy,
    #[serde(default)]
    pub ramp: RampConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// How often telemetry is read and devices are re-evaluated
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl EntryConfig {
    pub fn new(id: impl Into<String>, sensors: SensorConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            sensors,
            panel: PanelArrayConfig::default(),
            temperature: TemperatureConfig::default(),
            policy: AllocationPolicy::default(),
            ramp: RampConfig::default(),
            watchdog: WatchdogConfig::default(),
            poll_interval_secs: default_poll_interval_secs(),
            devices: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == device_id)
    }
}

/// Telemetry entities of one entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorConfig {
    pub pv_power: String,
    #[serde(default)]
    pub pv_voltage: Option<String>,
    /// When set, excess is computed from consumption instead of the curve model
    #[serde(default)]
    pub consumption: Option<String>,
    #[serde(default)]
    pub battery_power: Option<String>,
}

/// Staleness watchdog timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_watchdog_period_secs")]
    pub period_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    180
}

fn default_watchdog_period_secs() -> u64 {
    60
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            period_secs: default_watchdog_period_secs(),
        }
    }
}

// ============= Panel Array =============

/// How the panels of one array are wired together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PanelTopology {
    #[default]
    Series,
    Parallel,
    /// Two equal strings in series, strings wired in parallel
    #[serde(alias = "parallel_series")]
    ParallelSeries,
}

impl PanelTopology {
    pub fn to_config_value(&self) -> &'static str {
        match self {
            Self::Series => "series",
            Self::Parallel => "parallel",
            Self::ParallelSeries => "parallel-series",
        }
    }

    pub fn all() -> &'static [PanelTopology] {
        &[Self::Series, Self::Parallel, Self::ParallelSeries]
    }
}

impl fmt::Display for PanelTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_config_value())
    }
}

impl FromStr for PanelTopology {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "series" => Ok(Self::Series),
            "parallel" => Ok(Self::Parallel),
            "parallel-series" => Ok(Self::ParallelSeries),
            _ => Err(anyhow::anyhow!(
                "Unknown panel topology: '{}'. Supported: {}",
                s,
                Self::all()
                    .iter()
                    .map(PanelTopology::to_config_value)
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

/// Static electrical description of one PV array plus curve-model tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelArrayConfig {
    /// Voltage at maximum power point of a single panel (V)
    pub vmp: f64,
    /// Current at maximum power point of a single panel (A)
    pub imp: f64,
    /// Open-circuit voltage; estimated as `vmp * 1.2` when absent
    #[serde(default)]
    pub voc: Option<f64>,
    /// Short-circuit current; estimated as `imp * 1.1` when absent
    #[serde(default)]
    pub isc: Option<f64>,
    #[serde(default = "default_panel_count")]
    pub panel_count: u32,
    #[serde(default)]
    pub topology: PanelTopology,
    #[serde(default = "default_curve_factor_k")]
    pub curve_factor_k: f64,
    #[serde(default = "default_efficiency_correction_factor")]
    pub efficiency_correction_factor: f64,
    #[serde(default = "default_min_inverter_voltage")]
    pub min_inverter_voltage: f64,
}

fn default_panel_count() -> u32 {
    1
}

fn default_curve_factor_k() -> f64 {
    0.2
}

fn default_efficiency_correction_factor() -> f64 {
    1.05
}

fn default_min_inverter_voltage() -> f64 {
    100.0
}

impl Default for PanelArrayConfig {
    fn default() -> Self {
        Self {
            vmp: 0.0,
            imp: 0.0,
            voc: None,
            isc: None,
            panel_count: default_panel_count(),
            topology: PanelTopology::default(),
            curve_factor_k: default_curve_factor_k(),
            efficiency_correction_factor: default_efficiency_correction_factor(),
            min_inverter_voltage: default_min_inverter_voltage(),
        }
    }
}

impl PanelArrayConfig {
    /// Resolve electrical parameters, filling in Voc/Isc estimates when not configured
    pub fn parameters(&self) -> PanelParameters {
        PanelParameters {
            vmp: self.vmp,
            imp: self.imp,
            voc: self.voc.filter(|v| *v > 0.0).unwrap_or(self.vmp * 1.2),
            isc: self.isc.filter(|i| *i > 0.0).unwrap_or(self.imp * 1.1),
            panel_count: self.panel_count,
            topology: self.topology,
        }
    }
}

/// Fully resolved electrical parameters used by the curve model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelParameters {
    pub vmp: f64,
    pub imp: f64,
    pub voc: f64,
    pub isc: f64,
    pub panel_count: u32,
    pub topology: PanelTopology,
}

// ============= Temperature =============

/// Optional temperature compensation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Panel (or ambient) temperature sensor entity
    #[serde(default)]
    pub sensor: Option<String>,
    /// Voc temperature coefficient in %/°C
    #[serde(default = "default_voc_coefficient_pct")]
    pub voc_coefficient_pct: f64,
    /// Pmax temperature coefficient in %/°C
    #[serde(default = "default_pmax_coefficient_pct")]
    pub pmax_coefficient_pct: f64,
}

fn default_voc_coefficient_pct() -> f64 {
    -0.3
}

fn default_pmax_coefficient_pct() -> f64 {
    -0.4
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sensor: None,
            voc_coefficient_pct: default_voc_coefficient_pct(),
            pmax_coefficient_pct: default_pmax_coefficient_pct(),
        }
    }
}

impl TemperatureConfig {
    /// Build compensation parameters for a measured temperature
    pub fn compensation(&self, temperature_c: f64) -> TemperatureCompensation {
        TemperatureCompensation {
            temp_delta_c: temperature_c - STANDARD_TEST_TEMPERATURE_C,
            voc_coefficient: self.voc_coefficient_pct / 100.0,
            pmax_coefficient: self.pmax_coefficient_pct / 100.0,
        }
    }
}

/// Temperature delta from STC and coefficients as fractions per degree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureCompensation {
    pub temp_delta_c: f64,
    pub voc_coefficient: f64,
    pub pmax_coefficient: f64,
}

// ============= Allocation Policy =============

/// How excess power is shared between proportional devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    /// Each device consumes from the shared pool in priority order
    #[default]
    FillOneByOne,
    /// Proportional devices get a share weighted by their maximum power
    DistributeEvenly,
}

impl AllocationStrategy {
    pub fn to_config_value(&self) -> &'static str {
        match self {
            Self::FillOneByOne => "fill-one-by-one",
            Self::DistributeEvenly => "distribute-evenly",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_config_value())
    }
}

/// Per-entry policy for turning telemetry into an allocatable budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// Battery charge power kept back before devices are served (0 = battery priority)
    #[serde(default)]
    pub reserve_battery_power_w: f64,
    #[serde(default)]
    pub inverter_self_consumption_w: f64,
    #[serde(default)]
    pub strategy: AllocationStrategy,
    #[serde(default = "default_hysteresis_w")]
    pub hysteresis_w: f64,
    /// When true the battery sensor reports charging as negative
    #[serde(default)]
    pub battery_power_reversed: bool,
}

fn default_hysteresis_w() -> f64 {
    40.0
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            reserve_battery_power_w: 0.0,
            inverter_self_consumption_w: 0.0,
            strategy: AllocationStrategy::default(),
            hysteresis_w: default_hysteresis_w(),
            battery_power_reversed: false,
        }
    }
}

/// Ramp settings for dimmable actuators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampConfig {
    #[serde(default = "default_ramp_up_step")]
    pub up_step_pct: f64,
    #[serde(default = "default_ramp_down_step")]
    pub down_step_pct: f64,
    #[serde(default = "default_ramp_deadband")]
    pub deadband_pct: f64,
    #[serde(default = "default_ramp_interval_secs")]
    pub interval_secs: u64,
}

fn default_ramp_up_step() -> f64 {
    10.0
}

fn default_ramp_down_step() -> f64 {
    20.0
}

fn default_ramp_deadband() -> f64 {
    1.0
}

fn default_ramp_interval_secs() -> u64 {
    5
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            up_step_pct: default_ramp_up_step(),
            down_step_pct: default_ramp_down_step(),
            deadband_pct: default_ramp_deadband(),
            interval_secs: default_ramp_interval_secs(),
        }
    }
}

// ============= Devices =============

/// Kind of controllable load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Plain on/off load
    #[default]
    Standard,
    /// Load with a relay-mode select and percent control
    #[serde(alias = "custom")]
    Proportional,
    /// Climate entity driven through its HVAC mode
    #[serde(alias = "climate")]
    Thermostat,
}

impl DeviceKind {
    pub fn to_config_value(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Proportional => "proportional",
            Self::Thermostat => "thermostat",
        }
    }

    pub fn all() -> &'static [DeviceKind] {
        &[Self::Standard, Self::Proportional, Self::Thermostat]
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_config_value())
    }
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "proportional" | "custom" => Ok(Self::Proportional),
            "thermostat" | "climate" => Ok(Self::Thermostat),
            _ => Err(anyhow::anyhow!(
                "Unknown device kind: '{}'. Supported kinds: {}",
                s,
                Self::all()
                    .iter()
                    .map(DeviceKind::to_config_value)
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

/// One controllable load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    /// Command target, e.g. "switch.boiler" or "climate.living_room|cool"
    #[serde(default)]
    pub entity: Option<String>,
    /// Relay mode select entity (proportional devices)
    #[serde(default)]
    pub mode_select_entity: Option<String>,
    #[serde(default)]
    pub kind: DeviceKind,
    /// Higher priority is served first
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub min_expected_w: f64,
    #[serde(default)]
    pub max_expected_w: Option<f64>,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default)]
    pub min_on_time_secs: u64,
    #[serde(default)]
    pub schedule: Option<ScheduleWindow>,
    #[serde(default)]
    pub auto_control: bool,
}

fn default_priority() -> i32 {
    50
}

fn default_debounce_secs() -> u64 {
    15
}

impl DeviceConfig {
    /// Device with default timing and no command target yet
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entity: None,
            mode_select_entity: None,
            kind: DeviceKind::default(),
            priority: default_priority(),
            min_expected_w: 0.0,
            max_expected_w: None,
            debounce_secs: default_debounce_secs(),
            min_on_time_secs: 0,
            schedule: None,
            auto_control: false,
        }
    }

    /// Resolve the configured command target
    pub fn command_target(&self) -> std::result::Result<CommandTarget, TargetError> {
        match self.entity.as_deref() {
            Some(entity) => entity.parse(),
            None => Err(TargetError::Missing),
        }
    }

    /// Upper bound of power a standard device is credited with
    pub fn power_cap_w(&self) -> f64 {
        match self.max_expected_w {
            Some(max) if max > 0.0 => max,
            _ => self.min_expected_w * 3.0,
        }
    }
}

// ============= Schedule =============

/// Day of week, Monday first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn all() -> &'static [DayOfWeek] {
        &[
            Self::Monday,
            Self::Tuesday,
            Self::Wednesday,
            Self::Thursday,
            Self::Friday,
            Self::Saturday,
            Self::Sunday,
        ]
    }

    pub fn to_config_value(&self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
            Self::Sunday => "sunday",
        }
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => Self::Monday,
            Weekday::Tue => Self::Tuesday,
            Weekday::Wed => Self::Wednesday,
            Weekday::Thu => Self::Thursday,
            Weekday::Fri => Self::Friday,
            Weekday::Sat => Self::Saturday,
            Weekday::Sun => Self::Sunday,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_config_value())
    }
}

impl FromStr for DayOfWeek {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|day| {
                let name = day.to_config_value();
                name == lower || (lower.len() == 3 && name.starts_with(lower.as_str()))
            })
            .ok_or_else(|| anyhow::anyhow!("Unknown day of week: '{s}'"))
    }
}

/// Active time window of a device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, with = "hh_mm")]
    pub start: Option<NaiveTime>,
    #[serde(default, with = "hh_mm")]
    pub end: Option<NaiveTime>,
    /// Empty means every day
    #[serde(default)]
    pub days: Vec<DayOfWeek>,
}

/// Serde adapter for optional "HH:MM" (or "HH:MM:SS") times
mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_str(&time.format("%H:%M").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => super::parse_time_of_day(text)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid time '{text}', expected HH:MM"))),
        }
    }
}

/// Parse "HH:MM" or "HH:MM:SS"
pub fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .ok()
}
