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

pub mod allocation;
pub mod config;
pub mod control;

pub use allocation::{AllocationResult, DeviceStatus};
pub use config::{
    AllocationPolicy, AllocationStrategy, DayOfWeek, DeviceConfig, DeviceKind, EntryConfig,
    PanelArrayConfig, PanelParameters, PanelTopology, RampConfig, ScheduleWindow, SensorConfig,
    TemperatureCompensation, TemperatureConfig, WatchdogConfig,
};
pub use control::{
    CommandTarget, DeviceAction, DeviceCommand, EntityDomain, EntityState, RelayMode, TargetError,
};
