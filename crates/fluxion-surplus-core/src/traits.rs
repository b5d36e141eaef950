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
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fluxion_surplus_types::{AllocationResult, DeviceCommand, EntityState};
use parking_lot::Mutex;
use tracing::debug;

use crate::excess::ExcessReport;

/// Reads entity states and executes device commands
///
/// Implementations must not block indefinitely; a hung command has to time out
/// on its own so that later evaluation cycles are not stalled.
#[async_trait]
pub trait EntityController: Send + Sync {
    /// Read the current state of an entity
    async fn read_state(&self, entity_id: &str) -> Result<EntityState>;

    /// Execute a command against an entity
    async fn execute(&self, command: &DeviceCommand) -> Result<()>;

    /// Name of the controller for logging
    fn name(&self) -> &str;

    /// Read an entity, mapping errors and unknown/unavailable states to `None`
    async fn read_available(&self, entity_id: &str) -> Option<EntityState> {
        match self.read_state(entity_id).await {
            Ok(state) if state.is_available() => Some(state),
            Ok(state) => {
                debug!("Entity {} is '{}'", entity_id, state.state);
                None
            }
            Err(e) => {
                debug!("Entity {} could not be read: {:#}", entity_id, e);
                None
            }
        }
    }
}

/// Receives the results of each entry's evaluation
///
/// Publishing is fire-and-forget.
pub trait AllocationObserver: Send + Sync {
    fn publish_excess(&self, entry_id: &str, report: &ExcessReport);

    fn publish_allocation(&self, entry_id: &str, result: &AllocationResult);

    fn publish_watchdog(&self, entry_id: &str, alerted: bool);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
