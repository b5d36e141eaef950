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

//! Relay mode tracking for proportional devices.
//!
//! Relay firmware tends to boot into a default mode after a power cut. The
//! tracker remembers the last mode seen on each select entity and asks for it
//! to be re-applied when the select comes back with something else.

use fluxion_surplus_types::{EntityState, RelayMode};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeObservation {
    Unchanged,
    /// A new valid mode was observed and is now the desired one
    Learned(RelayMode),
    /// The select came back from unavailable with a different mode
    Reapply(RelayMode),
}

#[derive(Debug, Clone, Default)]
pub struct ModeTracker {
    desired: HashMap<String, RelayMode>,
    available: HashMap<String, bool>,
}

impl ModeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_desired(mut self, entity_id: &str, mode: RelayMode) -> Self {
        self.set_desired(entity_id, mode);
        self
    }

    pub fn set_desired(&mut self, entity_id: &str, mode: RelayMode) {
        self.desired.insert(entity_id.to_owned(), mode);
    }

    pub fn desired(&self, entity_id: &str) -> Option<RelayMode> {
        self.desired.get(entity_id).copied()
    }

    /// Feed the latest state of a select entity
    pub fn observe(&mut self, entity_id: &str, state: Option<&EntityState>) -> ModeObservation {
        let was_available = self.available.get(entity_id).copied().unwrap_or(false);

        let Some(state) = state.filter(|s| s.is_available()) else {
            self.available.insert(entity_id.to_owned(), false);
            return ModeObservation::Unchanged;
        };
        self.available.insert(entity_id.to_owned(), true);

        let observed = state.as_relay_mode();
        let desired = self.desired(entity_id);

        if !was_available
            && let Some(desired) = desired
            && observed != Some(desired)
        {
            debug!(
                "Re-applying desired mode {} to {} after availability",
                desired, entity_id
            );
            return ModeObservation::Reapply(desired);
        }

        match observed {
            Some(mode) if desired != Some(mode) => {
                self.set_desired(entity_id, mode);
                ModeObservation::Learned(mode)
            }
            _ => ModeObservation::Unchanged,
        }
    }
}
