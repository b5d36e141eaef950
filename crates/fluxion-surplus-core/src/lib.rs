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


//! Surplus power allocation: PV curve model, excess budgeting, device
//! allocation with debounce and hysteresis, and the staleness watchdog.

pub mod allocation;
pub mod board;
pub mod entry;
pub mod excess;
pub mod memory;
pub mod modes;
pub mod pv_model;
pub mod ramp;
pub mod schedule;
pub mod telemetry;
pub mod traits;
pub mod watchdog;

pub use allocation::{AllocationEngine, DebounceState, DeviceRuntimeState, RuntimeState};
pub use board::{DistributionBoard, EntrySnapshot};
pub use entry::{RelayTarget, SurplusEntry};
pub use excess::{ExcessCalculator, ExcessMode, ExcessReport, TelemetrySnapshot};
pub use memory::{DeviceMemory, DeviceMemoryStore};
pub use pv_model::{CalculationReason, CurveTuning, MaxPowerEstimate, estimate_max_power};
pub use traits::{AllocationObserver, Clock, EntityController, ManualClock, SystemClock};
pub use watchdog::{ShutdownReport, StalenessWatchdog, WatchdogVerdict};
